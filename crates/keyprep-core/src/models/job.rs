//! Build job input: the secrets payload carrying per-target signing material.

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Signing material keyed by build target name.
pub type BuildCredentials = BTreeMap<String, TargetCredentials>;

/// The subset of an iOS build job this subsystem reads.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IosJob {
    /// Simulator builds are never signed.
    #[serde(default)]
    pub simulator: bool,
    #[serde(default)]
    pub secrets: Option<JobSecrets>,
}

impl IosJob {
    /// Parses a job from its JSON representation.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSecrets {
    #[serde(default)]
    pub build_credentials: Option<BuildCredentials>,
}

/// Certificate and profile for a single target.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCredentials {
    pub distribution_certificate: DistributionCertificateSecret,
    /// Base64-encoded `.mobileprovision` file.
    pub provisioning_profile_base64: String,
}

/// A PKCS#12 bundle and its password.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionCertificateSecret {
    /// Base64-encoded `.p12` file.
    pub data_base64: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_parse_job_with_credentials() {
        let job = IosJob::from_json(
            r#"{
                "simulator": false,
                "secrets": {
                    "buildCredentials": {
                        "App": {
                            "distributionCertificate": { "dataBase64": "MIIK", "password": "hunter2" },
                            "provisioningProfileBase64": "MIAG"
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        assert!(!job.simulator);
        let creds = job.secrets.unwrap().build_credentials.unwrap();
        let app = &creds["App"];
        assert_eq!(app.distribution_certificate.data_base64, "MIIK");
        let password = app.distribution_certificate.password.expose_secret();
        assert_eq!(password, "hunter2");
        assert_eq!(app.provisioning_profile_base64, "MIAG");
    }

    #[test]
    fn test_parse_job_defaults() {
        let job = IosJob::from_json(r#"{ "simulator": true }"#).unwrap();
        assert!(job.simulator);
        assert!(job.secrets.is_none());

        let job = IosJob::from_json(r#"{ "secrets": {} }"#).unwrap();
        assert!(!job.simulator);
        assert!(job.secrets.unwrap().build_credentials.is_none());
    }

    #[test]
    fn test_password_is_redacted_in_debug() {
        let secret = DistributionCertificateSecret {
            data_base64: String::new(),
            password: SecretString::from("hunter2"),
        };
        assert!(!format!("{:?}", secret).contains("hunter2"));
    }
}
