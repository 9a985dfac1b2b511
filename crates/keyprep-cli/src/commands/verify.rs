//! Dry run of credential preparation.

use std::path::Path;

use anyhow::{Context, Result};
use keyprep_core::{CredentialsManager, SigningConfig};

use super::{print_credentials, read_job};

pub async fn handle_verify_command(config: SigningConfig, job: &Path, json: bool) -> Result<()> {
    let job = read_job(job)?;
    let mut manager = CredentialsManager::new(config);

    let credentials = match manager.prepare(&job).await {
        Ok(credentials) => credentials,
        Err(e) => {
            for failure in manager.cleanup_failures() {
                eprintln!("Warning: clean-up failed: {}", failure);
            }
            return Err(e).context("Failed to prepare credentials");
        }
    };

    let printed = match &credentials {
        None => {
            println!("Simulator build, no signing credentials needed.");
            Ok(())
        }
        Some(credentials) if json => serde_json::to_string_pretty(credentials)
            .map(|out| println!("{}", out))
            .context("Failed to serialize credentials"),
        Some(credentials) => {
            print_credentials(credentials);
            Ok(())
        }
    };

    manager
        .clean_up()
        .await
        .context("Failed to clean up credentials")?;
    printed
}
