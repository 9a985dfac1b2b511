//! Distribution certificate inspection.
//!
//! Extracts the SHA-1 fingerprint and subject common name from a PKCS#12
//! bundle. The fingerprint is the certificate's identity everywhere else in
//! the signing flow: keychain identity lookup and provisioning profile
//! verification both compare against it.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sha1::{Digest, Sha1};
use std::path::Path;
use std::sync::Arc;
use x509_certificate::CapturedX509Certificate;

use crate::error::{KeyprepError, Result};
use crate::process::CommandRunner;

/// Environment variable that carries the bundle password to `openssl`.
const PASSWORD_ENV: &str = "KEYPREP_P12_PASSWORD";

/// Identity of a distribution certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionCertificateInfo {
    /// Uppercase hex SHA-1 of the DER certificate.
    pub fingerprint: String,
    /// Subject common name, e.g. `iPhone Distribution: Acme Inc (ABCDE12345)`.
    pub common_name: String,
}

/// Computes the uppercase hex SHA-1 fingerprint of a DER certificate.
pub fn sha1_fingerprint(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

/// Reads identity information out of a PKCS#12 bundle.
#[async_trait]
pub trait CertificateInspector: Send + Sync {
    async fn inspect(
        &self,
        p12_path: &Path,
        password: &SecretString,
    ) -> Result<DistributionCertificateInfo>;
}

/// Inspects certificates with the `openssl` CLI.
pub struct OpensslCertificateInspector {
    runner: Arc<dyn CommandRunner>,
    openssl_bin: String,
}

impl OpensslCertificateInspector {
    pub fn new(runner: Arc<dyn CommandRunner>, openssl_bin: impl Into<String>) -> Self {
        Self {
            runner,
            openssl_bin: openssl_bin.into(),
        }
    }

    /// Exports the client certificate from the bundle as PEM.
    ///
    /// OpenSSL 3 refuses bundles encrypted with RC2/3DES unless `-legacy` is
    /// passed, and Keychain Access still exports those, so retry once.
    async fn export_pem(&self, p12_path: &Path, password: &SecretString) -> Result<String> {
        let mut args = vec![
            "pkcs12".to_string(),
            "-in".to_string(),
            p12_path.to_string_lossy().into_owned(),
            "-passin".to_string(),
            format!("env:{}", PASSWORD_ENV),
            "-nokeys".to_string(),
            "-clcerts".to_string(),
        ];
        let env = [(PASSWORD_ENV, password.expose_secret())];

        let output = self
            .runner
            .run_with_env(&self.openssl_bin, &args, &env)
            .await?;
        let output = if !output.is_success() && is_unsupported_algorithm(&output.stderr) {
            tracing::debug!("Retrying certificate export with -legacy");
            args.push("-legacy".to_string());
            self.runner
                .run_checked_with_env(&self.openssl_bin, &args, &env)
                .await?
        } else if !output.is_success() {
            return Err(KeyprepError::ExternalTool {
                program: self.openssl_bin.clone(),
                subcommand: "pkcs12".to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        } else {
            output
        };

        Ok(output.stdout_lossy())
    }
}

#[async_trait]
impl CertificateInspector for OpensslCertificateInspector {
    async fn inspect(
        &self,
        p12_path: &Path,
        password: &SecretString,
    ) -> Result<DistributionCertificateInfo> {
        let pem = self.export_pem(p12_path, password).await?;
        certificate_info_from_pem(&pem)
    }
}

fn is_unsupported_algorithm(stderr: &str) -> bool {
    stderr.contains("unsupported") || stderr.contains("Algorithm (RC2-40-CBC")
}

/// Reads the fingerprint and common name of the first certificate in `pem`.
///
/// Text outside the `CERTIFICATE` blocks, such as the bag attributes
/// `openssl pkcs12` prints, is ignored.
pub fn certificate_info_from_pem(pem: &str) -> Result<DistributionCertificateInfo> {
    let certificate = CapturedX509Certificate::from_pem_multiple(pem.as_bytes())
        .map_err(|e| {
            KeyprepError::Configuration(format!(
                "Failed to decode distribution certificate: {}",
                e
            ))
        })?
        .into_iter()
        .next()
        .ok_or_else(|| {
            KeyprepError::Configuration(
                "Distribution certificate bundle contains no certificate".to_string(),
            )
        })?;

    let common_name = certificate
        .subject_name()
        .iter_common_name()
        .next()
        .and_then(|atv| atv.to_string().ok())
        .ok_or_else(|| {
            KeyprepError::Configuration(
                "Distribution certificate subject has no common name".to_string(),
            )
        })?;

    Ok(DistributionCertificateInfo {
        fingerprint: sha1_fingerprint(certificate.constructed_data()),
        common_name,
    })
}
