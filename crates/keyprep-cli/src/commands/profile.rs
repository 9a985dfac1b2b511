//! Provisioning profile inspection.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use keyprep_core::SigningConfig;
use keyprep_core::process::SystemCommandRunner;
use keyprep_core::signing::ProvisioningProfile;

use super::print_profile;

/// Decodes `file` into a scratch directory, prints it and removes the copy.
pub async fn handle_inspect_profile_command(
    config: &SigningConfig,
    file: &Path,
    keychain: &Path,
) -> Result<()> {
    let raw = std::fs::read(file)
        .with_context(|| format!("Failed to read provisioning profile {}", file.display()))?;
    let scratch = tempfile::tempdir()
        .context("Failed to create scratch directory")?;

    let target = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut profile = ProvisioningProfile::new(
        raw,
        keychain,
        target,
        String::new(),
        scratch.path(),
        Arc::new(SystemCommandRunner::new()),
    )
    .with_security_bin(config.security_bin.clone());

    profile
        .init()
        .await
        .context("Failed to decode provisioning profile")?;

    let data = profile.data()?;
    println!("Provisioning profile {}", file.display());
    print_profile(data);

    profile.destroy().await?;
    Ok(())
}
