//! Run a build command inside a prepared signing environment.

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use keyprep_core::models::Credentials;
use keyprep_core::{CredentialsManager, SigningConfig};
use tempfile::NamedTempFile;
use tokio::process::Command;

use super::read_job;

pub const KEYCHAIN_PATH_ENV: &str = "KEYPREP_KEYCHAIN_PATH";
pub const TEAM_ID_ENV: &str = "KEYPREP_TEAM_ID";
pub const DISTRIBUTION_TYPE_ENV: &str = "KEYPREP_DISTRIBUTION_TYPE";
pub const CREDENTIALS_FILE_ENV: &str = "KEYPREP_CREDENTIALS_FILE";

pub async fn handle_run_command(
    config: SigningConfig,
    job: &Path,
    command: &[String],
) -> Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        bail!("No command given");
    };

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

    let credentials = credentials.as_ref();
    let status = run_with_credentials(credentials, program, args).await;

    if let Err(e) = manager.clean_up().await {
        tracing::error!("Failed to clean up credentials: {}", e);
        if status.is_ok() {
            return Err(e).context("Failed to clean up credentials");
        }
    }

    let status = status?;
    tracing::info!("'{}' exited with {}", program, status);
    Ok(match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        // Terminated by a signal
        None => ExitCode::FAILURE,
    })
}

async fn run_with_credentials(
    credentials: Option<&Credentials>,
    program: &str,
    args: &[String],
) -> Result<std::process::ExitStatus> {
    let mut cmd = Command::new(program);
    cmd.args(args);

    // Held until the child exits; the file is removed on drop
    let mut credentials_file = None;
    if let Some(credentials) = credentials {
        let file = write_credentials_file(credentials)?;
        let distribution_type = credentials.distribution_type.as_str();
        cmd.env(KEYCHAIN_PATH_ENV, &credentials.keychain_path)
            .env(TEAM_ID_ENV, &credentials.team_id)
            .env(DISTRIBUTION_TYPE_ENV, distribution_type)
            .env(CREDENTIALS_FILE_ENV, file.path());
        credentials_file = Some(file);
    }

    tracing::info!("Running '{}'", program);
    let status = cmd
        .status()
        .await
        .with_context(|| format!("Failed to run '{}'", program))?;

    drop(credentials_file);
    Ok(status)
}

fn write_credentials_file(credentials: &Credentials) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("keyprep-credentials-")
        .suffix(".json")
        .tempfile()
        .context("Failed to create credentials file")?;
    serde_json::to_writer_pretty(&mut file, credentials)
        .context("Failed to serialize credentials")?;
    file.flush().context("Failed to write credentials file")?;
    Ok(file)
}
