//! iOS provisioning profile installation and verification.
//!
//! A `.mobileprovision` file is a CMS envelope around a plist. The payload
//! is extracted with `security cms -D` against the build keychain, then the
//! fields needed for signing are derived from it.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{KeyprepError, Result};
use crate::models::{DistributionType, ProvisioningProfileData};
use crate::process::CommandRunner;
use crate::signing::certificate::sha1_fingerprint;

#[derive(Debug)]
enum ProfileState {
    Uninitialized,
    Loaded(ProvisioningProfileData),
    Destroyed,
}

/// A provisioning profile for one build target.
///
/// Moves from uninitialized to loaded (`init`) to destroyed (`destroy`),
/// never backwards. The keychain is referenced by path only; it is owned
/// and destroyed elsewhere.
pub struct ProvisioningProfile {
    raw: Vec<u8>,
    keychain_path: PathBuf,
    target: String,
    certificate_common_name: String,
    profiles_dir: PathBuf,
    security_bin: String,
    runner: Arc<dyn CommandRunner>,
    state: ProfileState,
}

impl ProvisioningProfile {
    pub fn new(
        raw: Vec<u8>,
        keychain_path: impl Into<PathBuf>,
        target: impl Into<String>,
        certificate_common_name: impl Into<String>,
        profiles_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            raw,
            keychain_path: keychain_path.into(),
            target: target.into(),
            certificate_common_name: certificate_common_name.into(),
            profiles_dir: profiles_dir.into(),
            security_bin: "security".to_string(),
            runner,
            state: ProfileState::Uninitialized,
        }
    }

    /// Overrides the `security` binary used for decoding.
    pub fn with_security_bin(mut self, security_bin: impl Into<String>) -> Self {
        self.security_bin = security_bin.into();
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Writes the profile into the profiles directory and loads it.
    pub async fn init(&mut self) -> Result<()> {
        if !matches!(self.state, ProfileState::Uninitialized) {
            return Err(KeyprepError::InvalidState(format!(
                "Provisioning profile for target '{}' has already been initialized",
                self.target
            )));
        }

        tracing::debug!("Making sure the directory for provisioning profiles exists");
        tokio::fs::create_dir_all(&self.profiles_dir)
            .await
            .map_err(|e| KeyprepError::io("Failed to create profiles directory", e))?;

        let path = self
            .profiles_dir
            .join(format!("{}.mobileprovision", uuid::Uuid::new_v4()));
        tracing::debug!("Writing provisioning profile to {}", path.display());
        tokio::fs::write(&path, &self.raw)
            .await
            .map_err(|e| KeyprepError::io("Failed to write provisioning profile", e))?;

        match self.load(&path).await {
            Ok(data) => {
                self.state = ProfileState::Loaded(data);
                Ok(())
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(
                        "Failed to remove provisioning profile {}: {}",
                        path.display(),
                        remove_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn load(&self, path: &Path) -> Result<ProvisioningProfileData> {
        tracing::debug!("Loading provisioning profile");
        let args = vec![
            "cms".to_string(),
            "-D".to_string(),
            "-k".to_string(),
            self.keychain_path.to_string_lossy().into_owned(),
            "-i".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        let output = self.runner.run_checked(&self.security_bin, &args).await?;

        let data = parse_profile_plist(
            &output.stdout,
            path.to_path_buf(),
            &self.target,
            &self.certificate_common_name,
        )?;

        if let Some(expires_at) = data.expires_at {
            if expires_at < Utc::now() {
                tracing::warn!(
                    "Provisioning profile '{}' for target '{}' expired at {}",
                    data.name,
                    self.target,
                    expires_at.to_rfc3339()
                );
            }
        }

        Ok(data)
    }

    /// Parsed profile data. Fails unless the profile is loaded.
    pub fn data(&self) -> Result<&ProvisioningProfileData> {
        match &self.state {
            ProfileState::Loaded(data) => Ok(data),
            ProfileState::Uninitialized => Err(KeyprepError::InvalidState(format!(
                "Provisioning profile for target '{}' is not initialized",
                self.target
            ))),
            ProfileState::Destroyed => Err(KeyprepError::InvalidState(format!(
                "Provisioning profile for target '{}' has been destroyed",
                self.target
            ))),
        }
    }

    /// Checks that the embedded developer certificate is the one with
    /// `fingerprint`.
    pub fn verify_certificate(&self, fingerprint: &str) -> Result<()> {
        let data = self.data()?;
        let profile_fingerprint = sha1_fingerprint(&data.developer_certificate);
        if profile_fingerprint != fingerprint {
            return Err(KeyprepError::CertificateMismatch {
                profile_fingerprint,
                certificate_fingerprint: fingerprint.to_string(),
            });
        }
        Ok(())
    }

    /// Removes the installed profile file.
    pub async fn destroy(&mut self) -> Result<()> {
        let path = match &self.state {
            ProfileState::Loaded(data) => data.path.clone(),
            ProfileState::Uninitialized => {
                tracing::warn!(
                    "There is nothing to destroy, a provisioning profile hasn't been created yet"
                );
                return Ok(());
            }
            ProfileState::Destroyed => return Ok(()),
        };

        self.state = ProfileState::Destroyed;
        tracing::info!("Removing provisioning profile {}", path.display());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyprepError::io(
                format!("Failed to remove provisioning profile {}", path.display()),
                e,
            )),
        }
    }

    /// Synchronous removal for contexts that cannot await.
    pub(crate) fn destroy_blocking(&mut self) {
        if let ProfileState::Loaded(data) = &self.state {
            let _ = std::fs::remove_file(&data.path);
            self.state = ProfileState::Destroyed;
        }
    }
}

/// Parses a decoded profile payload into [`ProvisioningProfileData`].
pub fn parse_profile_plist(
    payload: &[u8],
    path: PathBuf,
    target: &str,
    certificate_common_name: &str,
) -> Result<ProvisioningProfileData> {
    let plist: plist::Value = plist::from_bytes(payload)
        .map_err(|e| KeyprepError::Parse(e.to_string()))?;

    let dict = plist
        .as_dictionary()
        .ok_or_else(|| KeyprepError::Parse("Profile plist is not a dictionary".to_string()))?;

    let application_identifier = dict
        .get("Entitlements")
        .and_then(|v| v.as_dictionary())
        .and_then(|ents| ents.get("application-identifier"))
        .and_then(|v| v.as_string())
        .ok_or_else(|| missing("Entitlements.application-identifier"))?;

    let team_id = dict
        .get("TeamIdentifier")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.as_string())
        .ok_or_else(|| missing("TeamIdentifier"))?
        .to_string();

    let uuid = dict
        .get("UUID")
        .and_then(|v| v.as_string())
        .ok_or_else(|| missing("UUID"))?
        .to_string();

    let name = dict
        .get("Name")
        .and_then(|v| v.as_string())
        .ok_or_else(|| missing("Name"))?
        .to_string();

    let developer_certificate = dict
        .get("DeveloperCertificates")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| missing("DeveloperCertificates"))
        .and_then(certificate_bytes)?;

    let expires_at = dict
        .get("ExpirationDate")
        .and_then(|v| v.as_date())
        .and_then(|d| {
            let system_time: SystemTime = d.clone().into();
            system_time
                .duration_since(SystemTime::UNIX_EPOCH)
                .ok()
                .and_then(|dur| DateTime::from_timestamp(dur.as_secs() as i64, 0))
        });

    Ok(ProvisioningProfileData {
        path,
        target: target.to_string(),
        bundle_identifier: strip_team_prefix(application_identifier).to_string(),
        team_id,
        uuid,
        name,
        developer_certificate,
        certificate_common_name: certificate_common_name.to_string(),
        distribution_type: resolve_distribution_type(dict),
        expires_at,
    })
}

fn missing(field: &str) -> KeyprepError {
    KeyprepError::Parse(format!("Profile is missing {}", field))
}

/// Certificates are `<data>` elements; base64 strings are accepted too.
fn certificate_bytes(value: &plist::Value) -> Result<Vec<u8>> {
    if let Some(data) = value.as_data() {
        return Ok(data.to_vec());
    }
    if let Some(encoded) = value.as_string() {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        return BASE64
            .decode(compact)
            .map_err(|e| KeyprepError::Parse(format!("Invalid developer certificate: {}", e)));
    }
    Err(KeyprepError::Parse(
        "Developer certificate is neither data nor a string".to_string(),
    ))
}

/// `ABCDE12345.com.example.app` -> `com.example.app`.
fn strip_team_prefix(application_identifier: &str) -> &str {
    match application_identifier.split_once('.') {
        Some((_, bundle_identifier)) => bundle_identifier,
        None => application_identifier,
    }
}

/// Determines the distribution type from the plist dictionary.
///
/// `ProvisionsAllDevices` wins over `ProvisionedDevices`; with neither the
/// profile is for the App Store.
pub fn resolve_distribution_type(dict: &plist::Dictionary) -> DistributionType {
    if dict.get("ProvisionsAllDevices").and_then(|v| v.as_boolean()) == Some(true) {
        return DistributionType::Enterprise;
    }

    let has_devices = dict
        .get("ProvisionedDevices")
        .and_then(|v| v.as_array())
        .is_some_and(|devices| !devices.is_empty());

    if has_devices {
        DistributionType::AdHoc
    } else {
        DistributionType::AppStore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::test_utils::{FakeCommandRunner, ProfilePlist, arg_after};

    const TEAM: &str = "ABCDE12345";
    const CERT: &[u8] = b"developer-certificate-der";

    fn cms_runner(payload: Vec<u8>) -> Arc<FakeCommandRunner> {
        Arc::new(FakeCommandRunner::new().on("security", "cms", move |_| {
            Ok(CommandOutput::success(payload.clone()))
        }))
    }

    fn profile(raw: &[u8], dir: &Path, runner: Arc<FakeCommandRunner>) -> ProvisioningProfile {
        ProvisioningProfile::new(
            raw.to_vec(),
            "/tmp/build.keychain-db",
            "App",
            "iPhone Distribution: Acme (ABCDE12345)",
            dir,
            runner,
        )
    }

    fn parse(xml: &[u8]) -> Result<ProvisioningProfileData> {
        parse_profile_plist(xml, PathBuf::new(), "App", "CN")
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_distribution_type_enterprise() {
        let dict = ProfilePlist::new(TEAM, "com.app", CERT)
            .devices(&["device1"])
            .all_devices()
            .to_dictionary();
        assert_eq!(
            resolve_distribution_type(&dict),
            DistributionType::Enterprise
        );
    }

    #[test]
    fn test_distribution_type_adhoc() {
        let dict = ProfilePlist::new(TEAM, "com.app", CERT)
            .devices(&["device1"])
            .to_dictionary();
        assert_eq!(resolve_distribution_type(&dict), DistributionType::AdHoc);
    }

    #[test]
    fn test_distribution_type_appstore() {
        let dict = ProfilePlist::new(TEAM, "com.app", CERT).to_dictionary();
        assert_eq!(resolve_distribution_type(&dict), DistributionType::AppStore);

        let dict = ProfilePlist::new(TEAM, "com.app", CERT)
            .devices(&[])
            .to_dictionary();
        assert_eq!(resolve_distribution_type(&dict), DistributionType::AppStore);
    }

    #[test]
    fn test_distribution_type_all_devices_false() {
        let mut dict = ProfilePlist::new(TEAM, "com.app", CERT).to_dictionary();
        dict.insert(
            "ProvisionsAllDevices".to_string(),
            plist::Value::Boolean(false),
        );
        assert_eq!(resolve_distribution_type(&dict), DistributionType::AppStore);
    }

    #[test]
    fn test_parse_profile_plist_fields() {
        let mut plist = ProfilePlist::new(TEAM, "com.app.widget", CERT);
        plist.developer_certificates.push(b"second-cert".to_vec());
        let data = parse_profile_plist(
            &plist.to_xml(),
            PathBuf::from("/p/x.mobileprovision"),
            "Widget",
            "CN",
        )
        .unwrap();

        assert_eq!(data.bundle_identifier, "com.app.widget");
        assert_eq!(data.team_id, TEAM);
        assert_eq!(data.uuid, "com.app.widget-profile-uuid");
        assert_eq!(data.name, "com.app.widget AppStore");
        assert_eq!(data.developer_certificate, CERT);
        assert_eq!(data.target, "Widget");
        assert_eq!(data.certificate_common_name, "CN");
        assert!(data.expires_at.is_some());
    }

    #[test]
    fn test_parse_profile_plist_base64_certificate() {
        let mut dict = ProfilePlist::new(TEAM, "com.app", CERT).to_dictionary();
        dict.insert(
            "DeveloperCertificates".to_string(),
            plist::Value::Array(vec![plist::Value::String(BASE64.encode(CERT))]),
        );
        let mut xml = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_xml(&mut xml)
            .unwrap();

        let data = parse(&xml).unwrap();
        assert_eq!(data.developer_certificate, CERT);
    }

    #[test]
    fn test_parse_profile_plist_malformed() {
        let err = parse(b"<plist><dict><key>").unwrap_err();
        assert!(matches!(err, KeyprepError::Parse(_)));
        let message = err.to_string();
        assert!(message.starts_with("Error when parsing provisioning"));
    }

    #[test]
    fn test_parse_profile_plist_missing_team() {
        let mut dict = ProfilePlist::new(TEAM, "com.app", CERT).to_dictionary();
        dict.remove("TeamIdentifier");
        let mut xml = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_xml(&mut xml)
            .unwrap();

        let err = parse(&xml).unwrap_err();
        assert!(err.to_string().contains("TeamIdentifier"));
    }

    #[test]
    fn test_strip_team_prefix() {
        assert_eq!(strip_team_prefix("ABCDE12345.com.app"), "com.app");
        assert_eq!(strip_team_prefix("ABCDE12345.*"), "*");
        assert_eq!(strip_team_prefix("noprefix"), "noprefix");
    }

    #[tokio::test]
    async fn test_data_before_init_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let profile = profile(b"raw", dir.path(), cms_runner(Vec::new()));
        assert!(matches!(profile.data(), Err(KeyprepError::InvalidState(_))));
        assert!(matches!(
            profile.verify_certificate("00"),
            Err(KeyprepError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_init_writes_identical_bytes_and_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let profiles_dir = dir.path().join("Provisioning Profiles");
        let raw: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let expected = raw.clone();
        let payload = ProfilePlist::new(TEAM, "com.app", CERT).to_xml();

        let runner = Arc::new(FakeCommandRunner::new().on("security", "cms", move |args| {
            let written = std::fs::read(arg_after(args, "-i").unwrap()).unwrap();
            assert_eq!(written, expected);
            assert_eq!(arg_after(args, "-k"), Some("/tmp/build.keychain-db"));
            Ok(CommandOutput::success(payload.clone()))
        }));

        let mut profile = profile(&raw, &profiles_dir, runner.clone());
        profile.init().await.unwrap();

        let data = profile.data().unwrap();
        assert_eq!(data.path.parent(), Some(profiles_dir.as_path()));
        assert_eq!(data.path.extension().unwrap(), "mobileprovision");
        assert_eq!(std::fs::read(&data.path).unwrap(), raw);
        assert_eq!(runner.count("security", "cms"), 1);
    }

    #[tokio::test]
    async fn test_init_twice_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = cms_runner(ProfilePlist::new(TEAM, "com.app", CERT).to_xml());
        let mut profile = profile(b"raw", dir.path(), runner);
        profile.init().await.unwrap();

        let second = profile.init().await;
        assert!(matches!(second, Err(KeyprepError::InvalidState(_))));
        assert_eq!(files_in(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_init_decode_failure_surfaces_stderr_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeCommandRunner::new().on("security", "cms", |_| {
            Ok(CommandOutput::failure(
                1,
                "security: SecCmsDecoder failed to decode message.\n",
            ))
        }));
        let mut profile = profile(b"garbage", dir.path(), runner);

        let err = profile.init().await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "security cms failed: security: SecCmsDecoder failed to decode message."
        );
        assert_eq!(files_in(dir.path()), 0);
        assert!(profile.data().is_err());
    }

    #[tokio::test]
    async fn test_init_parse_failure_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = profile(b"raw", dir.path(), cms_runner(b"not a plist".to_vec()));

        let err = profile.init().await.unwrap_err();

        assert!(matches!(err, KeyprepError::Parse(_)));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_concurrent_profiles_get_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let runner = cms_runner(ProfilePlist::new(TEAM, "com.app", CERT).to_xml());
        let mut first = profile(b"same", dir.path(), runner.clone());
        let mut second = profile(b"same", dir.path(), runner);

        first.init().await.unwrap();
        second.init().await.unwrap();

        assert_ne!(
            first.data().unwrap().path,
            second.data().unwrap().path
        );
        assert_eq!(files_in(dir.path()), 2);
    }

    #[tokio::test]
    async fn test_verify_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let runner = cms_runner(ProfilePlist::new(TEAM, "com.app", CERT).to_xml());
        let mut profile = profile(b"raw", dir.path(), runner);
        profile.init().await.unwrap();

        profile.verify_certificate(&sha1_fingerprint(CERT)).unwrap();

        let other = sha1_fingerprint(b"another certificate");
        match profile.verify_certificate(&other).unwrap_err() {
            KeyprepError::CertificateMismatch {
                profile_fingerprint,
                certificate_fingerprint,
            } => {
                assert_eq!(profile_fingerprint, sha1_fingerprint(CERT));
                assert_eq!(certificate_fingerprint, other);
            }
            e => panic!("unexpected error: {e:?}"),
        }

        // Exact comparison: a lowercase fingerprint does not match.
        assert!(profile
            .verify_certificate(&sha1_fingerprint(CERT).to_lowercase())
            .is_err());
    }

    #[tokio::test]
    async fn test_destroy_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = cms_runner(ProfilePlist::new(TEAM, "com.app", CERT).to_xml());
        let mut profile = profile(b"raw", dir.path(), runner);
        profile.init().await.unwrap();
        let path = profile.data().unwrap().path.clone();

        profile.destroy().await.unwrap();

        assert!(!path.exists());
        assert!(profile.data().is_err());
        profile.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_before_init_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = profile(b"raw", dir.path(), cms_runner(Vec::new()));
        profile.destroy().await.unwrap();
        assert!(profile.data().is_err());
    }
}
