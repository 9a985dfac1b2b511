//! Test doubles for the external tools used during credential preparation.
//!
//! Available in unit tests and, through the `test-utils` feature, in
//! integration tests.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::error::{KeyprepError, Result};
use crate::process::{CommandOutput, CommandRunner, subcommand};
use crate::signing::{CertificateInspector, DistributionCertificateInfo};

type Handler = Box<dyn Fn(&[String]) -> Result<CommandOutput> + Send + Sync>;

#[derive(Debug, Clone)]
struct RecordedCall {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl RecordedCall {
    fn is(&self, program: &str, subcommand: &str) -> bool {
        self.program == program && self.args.first().map(String::as_str) == Some(subcommand)
    }
}

/// A scripted [`CommandRunner`] that records every invocation.
///
/// Handlers are keyed by program and first argument. Unscripted commands
/// fail with exit code 127.
#[derive(Default)]
pub struct FakeCommandRunner {
    handlers: HashMap<(String, String), Handler>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the response for `program subcommand ...`.
    pub fn on<F>(mut self, program: &str, subcommand: &str, handler: F) -> Self
    where
        F: Fn(&[String]) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.handlers.insert(
            (program.to_string(), subcommand.to_string()),
            Box::new(handler),
        );
        self
    }

    /// Scripts a plain success for `program subcommand ...`.
    pub fn ok(self, program: &str, subcommand: &str) -> Self {
        self.on(program, subcommand, |_| {
            Ok(CommandOutput::success(Vec::new()))
        })
    }

    /// Every recorded invocation, in order.
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| (c.program.clone(), c.args.clone()))
            .collect()
    }

    /// Number of times `program subcommand` ran.
    pub fn count(&self, program: &str, subcommand: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is(program, subcommand))
            .count()
    }

    /// Environment passed to each run of `program subcommand`, in order.
    pub fn envs(&self, program: &str, subcommand: &str) -> Vec<Vec<(String, String)>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is(program, subcommand))
            .map(|c| c.env.clone())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run_with_env(
        &self,
        program: &str,
        args: &[String],
        env: &[(&str, &str)],
    ) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });

        match self
            .handlers
            .get(&(program.to_string(), subcommand(args).to_string()))
        {
            Some(handler) => handler(args),
            None => Ok(CommandOutput::failure(
                127,
                format!("unscripted command: {} {}", program, subcommand(args)),
            )),
        }
    }
}

/// Value following `flag` in an argument list.
pub fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// A [`CertificateInspector`] that maps bundle contents to identities.
#[derive(Default)]
pub struct FakeCertificateInspector {
    certificates: HashMap<Vec<u8>, DistributionCertificateInfo>,
}

impl FakeCertificateInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_certificate(
        mut self,
        p12: impl Into<Vec<u8>>,
        fingerprint: impl Into<String>,
        common_name: impl Into<String>,
    ) -> Self {
        self.certificates.insert(
            p12.into(),
            DistributionCertificateInfo {
                fingerprint: fingerprint.into(),
                common_name: common_name.into(),
            },
        );
        self
    }
}

#[async_trait]
impl CertificateInspector for FakeCertificateInspector {
    async fn inspect(
        &self,
        p12_path: &Path,
        _password: &SecretString,
    ) -> Result<DistributionCertificateInfo> {
        let bytes = tokio::fs::read(p12_path)
            .await
            .map_err(|e| KeyprepError::io("Failed to read certificate", e))?;
        self.certificates
            .get(&bytes)
            .cloned()
            .ok_or_else(|| KeyprepError::ExternalTool {
                program: "openssl".to_string(),
                subcommand: "pkcs12".to_string(),
                stderr: "Mac verify error: invalid password?".to_string(),
            })
    }
}

/// Builder for provisioning profile plist payloads.
#[derive(Debug, Clone)]
pub struct ProfilePlist {
    pub team_id: String,
    pub bundle_identifier: String,
    pub uuid: String,
    pub name: String,
    pub developer_certificates: Vec<Vec<u8>>,
    pub provisioned_devices: Option<Vec<String>>,
    pub provisions_all_devices: Option<bool>,
    pub expiration: Option<SystemTime>,
}

impl ProfilePlist {
    pub fn new(team_id: &str, bundle_identifier: &str, certificate: &[u8]) -> Self {
        Self {
            team_id: team_id.to_string(),
            bundle_identifier: bundle_identifier.to_string(),
            uuid: format!("{}-profile-uuid", bundle_identifier),
            name: format!("{} AppStore", bundle_identifier),
            developer_certificates: vec![certificate.to_vec()],
            provisioned_devices: None,
            provisions_all_devices: None,
            expiration: Some(SystemTime::now() + Duration::from_secs(365 * 24 * 3600)),
        }
    }

    pub fn devices(mut self, devices: &[&str]) -> Self {
        self.provisioned_devices = Some(devices.iter().map(|d| d.to_string()).collect());
        self
    }

    pub fn all_devices(mut self) -> Self {
        self.provisions_all_devices = Some(true);
        self
    }

    pub fn to_dictionary(&self) -> plist::Dictionary {
        let mut entitlements = plist::Dictionary::new();
        entitlements.insert(
            "application-identifier".to_string(),
            plist::Value::String(format!("{}.{}", self.team_id, self.bundle_identifier)),
        );
        entitlements.insert(
            "get-task-allow".to_string(),
            plist::Value::Boolean(false),
        );

        let mut dict = plist::Dictionary::new();
        dict.insert(
            "AppIDName".to_string(),
            plist::Value::String("App".to_string()),
        );
        dict.insert(
            "Entitlements".to_string(),
            plist::Value::Dictionary(entitlements),
        );
        dict.insert(
            "TeamIdentifier".to_string(),
            plist::Value::Array(vec![plist::Value::String(self.team_id.clone())]),
        );
        dict.insert(
            "UUID".to_string(),
            plist::Value::String(self.uuid.clone()),
        );
        dict.insert(
            "Name".to_string(),
            plist::Value::String(self.name.clone()),
        );
        dict.insert(
            "DeveloperCertificates".to_string(),
            plist::Value::Array(
                self.developer_certificates
                    .iter()
                    .map(|c| plist::Value::Data(c.clone()))
                    .collect(),
            ),
        );
        if let Some(devices) = &self.provisioned_devices {
            dict.insert(
                "ProvisionedDevices".to_string(),
                plist::Value::Array(devices.iter().cloned().map(plist::Value::String).collect()),
            );
        }
        if let Some(all) = self.provisions_all_devices {
            dict.insert(
                "ProvisionsAllDevices".to_string(),
                plist::Value::Boolean(all),
            );
        }
        if let Some(expiration) = self.expiration {
            dict.insert(
                "ExpirationDate".to_string(),
                plist::Value::Date(plist::Date::from(expiration)),
            );
        }
        dict
    }

    /// Serializes the payload as XML, the format `security cms -D` emits.
    pub fn to_xml(&self) -> Vec<u8> {
        let mut out = Vec::new();
        plist::Value::Dictionary(self.to_dictionary())
            .to_writer_xml(&mut out)
            .unwrap();
        out
    }
}
