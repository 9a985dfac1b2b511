//! iOS credential orchestration.
//!
//! [`CredentialsManager`] turns the per-target secrets of a build job into
//! a ready-to-use signing environment: one ephemeral keychain holding every
//! distribution certificate, plus one installed and verified provisioning
//! profile per target. It owns everything it creates and tears it all down
//! in [`CredentialsManager::clean_up`], which also runs automatically when
//! preparation fails part way.
//!
//! Targets are processed one at a time. They share the keychain, and the
//! `security` tool does not tolerate overlapping mutations of one keychain
//! file.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::config::SigningConfig;
use crate::error::{KeyprepError, Result};
use crate::models::{
    BuildCredentials, Credentials, IosJob, ProvisioningProfileData, TargetCredentials,
};
use crate::process::{CommandRunner, SystemCommandRunner};
use crate::signing::certificate::{
    CertificateInspector, DistributionCertificateInfo, OpensslCertificateInspector,
};
use crate::signing::keychain::{EphemeralKeychain, Keychain};
use crate::signing::profile::ProvisioningProfile;

/// Prepares and cleans up signing credentials for a single build.
pub struct CredentialsManager {
    config: SigningConfig,
    runner: Arc<dyn CommandRunner>,
    inspector: Arc<dyn CertificateInspector>,
    keychain: Box<dyn Keychain>,
    keychain_created: bool,
    profiles: Vec<ProvisioningProfile>,
    prepared: bool,
    cleaned_up: bool,
    cleanup_failures: Vec<KeyprepError>,
}

impl CredentialsManager {
    /// Creates a manager that uses the host's `security` and `openssl`.
    pub fn new(config: SigningConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
        let inspector = Arc::new(OpensslCertificateInspector::new(
            runner.clone(),
            config.openssl_bin.clone(),
        ));
        let keychain = Box::new(EphemeralKeychain::new(runner.clone(), &config));
        Self::with_components(config, runner, keychain, inspector)
    }

    /// Creates a manager from explicit collaborators.
    pub fn with_components(
        config: SigningConfig,
        runner: Arc<dyn CommandRunner>,
        keychain: Box<dyn Keychain>,
        inspector: Arc<dyn CertificateInspector>,
    ) -> Self {
        Self {
            config,
            runner,
            inspector,
            keychain,
            keychain_created: false,
            profiles: Vec::new(),
            prepared: false,
            cleaned_up: false,
            cleanup_failures: Vec::new(),
        }
    }

    /// Prepares the signing environment for `job`.
    ///
    /// Returns `Ok(None)` for simulator builds, which need no signing. On
    /// failure everything created so far is cleaned up and the original
    /// error is returned.
    pub async fn prepare(&mut self, job: &IosJob) -> Result<Option<Credentials>> {
        if job.simulator {
            tracing::debug!("Simulator build, skipping credentials");
            return Ok(None);
        }

        let secrets = job.secrets.as_ref().ok_or_else(|| {
            KeyprepError::Configuration(
                "Secrets must be defined for non-simulator builds".to_string(),
            )
        })?;
        let build_credentials = secrets.build_credentials.as_ref().ok_or_else(|| {
            KeyprepError::Configuration("Credentials are required for an iOS build".to_string())
        })?;
        if build_credentials.is_empty() {
            return Err(KeyprepError::Configuration(
                "Build credentials contain no targets".to_string(),
            ));
        }

        if self.prepared {
            return Err(KeyprepError::InvalidState(
                "Credentials have already been prepared by this manager".to_string(),
            ));
        }
        self.prepared = true;

        tracing::info!("Preparing credentials");
        match self.prepare_targets(build_credentials).await {
            Ok(credentials) => Ok(Some(credentials)),
            Err(err) => {
                tracing::error!("Failed to prepare credentials: {}", err);
                if let Err(cleanup_err) = self.clean_up().await {
                    tracing::error!(
                        "Clean-up after failed preparation also failed: {}",
                        cleanup_err
                    );
                    match cleanup_err {
                        KeyprepError::Cleanup(failures) => self.cleanup_failures.extend(failures),
                        other => self.cleanup_failures.push(other),
                    }
                }
                Err(err)
            }
        }
    }

    async fn prepare_targets(
        &mut self,
        build_credentials: &BuildCredentials,
    ) -> Result<Credentials> {
        tracing::info!("Creating keychain");
        let keychain_path = self.keychain.create().await?;
        self.keychain_created = true;

        let mut target_provisioning_profiles = BTreeMap::new();
        for (target, target_credentials) in build_credentials {
            let (profile, fingerprint) = self
                .stage_target(target, target_credentials, &keychain_path)
                .await?;

            // Recorded even when verification fails so clean-up removes it
            let verified = self.verify_target(&profile, &fingerprint).await;
            let data = profile.data().cloned();
            self.profiles.push(profile);
            verified?;

            target_provisioning_profiles.insert(target.clone(), data?);
        }

        let application = self.application_target_profile()?.clone();
        warn_on_inconsistent_targets(&application, &target_provisioning_profiles);

        tracing::info!(
            "Credentials prepared for {} target(s), application target '{}' ({})",
            target_provisioning_profiles.len(),
            application.target,
            application.bundle_identifier
        );

        Ok(Credentials {
            distribution_type: application.distribution_type,
            team_id: application.team_id.clone(),
            application_target_provisioning_profile: application,
            keychain_path,
            target_provisioning_profiles,
        })
    }

    /// Imports the target's certificate and installs its profile.
    async fn stage_target(
        &self,
        target: &str,
        credentials: &TargetCredentials,
        keychain_path: &Path,
    ) -> Result<(ProvisioningProfile, String)> {
        tracing::info!("Preparing credentials for target '{}'", target);
        let certificate = &credentials.distribution_certificate;

        let p12 = BASE64
            .decode(certificate.data_base64.trim())
            .map_err(|source| KeyprepError::InvalidSecret {
                target: target.to_string(),
                field: "distribution certificate",
                source,
            })?;
        let p12 = Zeroizing::new(p12);
        let profile_bytes = BASE64
            .decode(credentials.provisioning_profile_base64.trim())
            .map_err(|source| KeyprepError::InvalidSecret {
                target: target.to_string(),
                field: "provisioning profile",
                source,
            })?;

        let p12_path = self
            .config
            .temp_dir
            .join(format!("{}.p12", uuid::Uuid::new_v4()));
        tracing::debug!("Writing distribution certificate to {}", p12_path.display());
        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|e| KeyprepError::io("Failed to create temp directory", e))?;
        tokio::fs::write(&p12_path, p12.as_slice())
            .await
            .map_err(|e| KeyprepError::io("Failed to write distribution certificate", e))?;

        let imported = self
            .inspect_and_import(&p12_path, &certificate.password)
            .await;
        if let Err(e) = tokio::fs::remove_file(&p12_path).await {
            tracing::warn!("Failed to remove {}: {}", p12_path.display(), e);
        }
        let info = imported?;

        tracing::info!("Initializing provisioning profile");
        let mut profile = ProvisioningProfile::new(
            profile_bytes,
            keychain_path,
            target,
            info.common_name,
            &self.config.provisioning_profiles_dir,
            self.runner.clone(),
        )
        .with_security_bin(self.config.security_bin.clone());
        profile.init().await?;

        Ok((profile, info.fingerprint))
    }

    async fn inspect_and_import(
        &self,
        p12_path: &Path,
        password: &SecretString,
    ) -> Result<DistributionCertificateInfo> {
        tracing::info!("Getting distribution certificate fingerprint and common name");
        let info = self.inspector.inspect(p12_path, password).await?;
        tracing::info!(
            "Fingerprint = \"{}\", common name = {}",
            info.fingerprint,
            info.common_name
        );

        tracing::info!("Importing distribution certificate into the keychain");
        self.keychain.import_certificate(p12_path, password).await?;
        Ok(info)
    }

    async fn verify_target(&self, profile: &ProvisioningProfile, fingerprint: &str) -> Result<()> {
        let data = profile.data()?;

        tracing::info!(
            "Validating whether distribution certificate has been imported successfully"
        );
        self.keychain
            .ensure_certificate_imported(&data.team_id, fingerprint)
            .await?;

        tracing::info!(
            "Verifying whether the distribution certificate and provisioning profile match"
        );
        profile.verify_certificate(fingerprint)
    }

    /// Picks the application target among the prepared profiles.
    ///
    /// Sibling targets of one app share a bundle identifier prefix
    /// (`com.app`, `com.app.widget`), so the smallest identifier is taken to
    /// be the app itself. This is a heuristic; a build manifest naming the
    /// primary target would be authoritative.
    fn application_target_profile(&self) -> Result<&ProvisioningProfileData> {
        let mut best: Option<&ProvisioningProfileData> = None;
        for profile in &self.profiles {
            let data = profile.data()?;
            if best.is_none_or(|b| data.bundle_identifier < b.bundle_identifier) {
                best = Some(data);
            }
        }
        best.ok_or_else(|| {
            KeyprepError::InvalidState("No provisioning profiles were prepared".to_string())
        })
    }

    /// Destroys the keychain and every recorded provisioning profile.
    ///
    /// Runs at most once; later calls return `Ok(())`. Every resource is
    /// attempted even if an earlier one fails, and all failures are
    /// returned together as [`KeyprepError::Cleanup`].
    pub async fn clean_up(&mut self) -> Result<()> {
        if self.cleaned_up || (!self.keychain_created && self.profiles.is_empty()) {
            return Ok(());
        }
        self.cleaned_up = true;

        let mut failures = Vec::new();

        if self.keychain_created {
            tracing::info!("Destroying keychain");
            if let Err(e) = self.keychain.destroy().await {
                tracing::error!("Failed to destroy keychain: {}", e);
                failures.push(e);
            }
        }

        for profile in &mut self.profiles {
            if let Err(e) = profile.destroy().await {
                tracing::error!(
                    "Failed to destroy provisioning profile for target '{}': {}",
                    profile.target(),
                    e
                );
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KeyprepError::Cleanup(failures))
        }
    }

    /// Secondary errors raised while cleaning up after a failed `prepare`.
    pub fn cleanup_failures(&self) -> &[KeyprepError] {
        &self.cleanup_failures
    }

    /// Path of the keychain, once created.
    pub fn keychain_path(&self) -> Option<PathBuf> {
        self.keychain.path().map(Path::to_path_buf)
    }
}

impl Drop for CredentialsManager {
    fn drop(&mut self) {
        if self.cleaned_up || (!self.keychain_created && self.profiles.is_empty()) {
            return;
        }

        tracing::warn!("Credentials manager dropped without clean-up, removing signing resources");
        self.keychain.destroy_blocking();
        for profile in &mut self.profiles {
            profile.destroy_blocking();
        }
        self.cleaned_up = true;
    }
}

fn warn_on_inconsistent_targets(
    application: &ProvisioningProfileData,
    profiles: &BTreeMap<String, ProvisioningProfileData>,
) {
    for profile in profiles.values() {
        if profile.team_id != application.team_id {
            tracing::warn!(
                "Target '{}' uses team {} but the application target uses team {}",
                profile.target,
                profile.team_id,
                application.team_id
            );
        }
        if profile.distribution_type != application.distribution_type {
            tracing::warn!(
                "Target '{}' has distribution type {} but the application target has {}",
                profile.target,
                profile.distribution_type,
                application.distribution_type
            );
        }
    }
}
