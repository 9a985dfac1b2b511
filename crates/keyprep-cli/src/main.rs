use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{profile, run, verify};
use keyprep_core::SigningConfig;

#[derive(Parser)]
#[command(name = "keyprep")]
#[command(about = "Stage iOS signing credentials for a build", long_about = None)]
#[command(version = keyprep_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare credentials for a job, print them, then clean up
    Verify {
        /// Path to the job JSON
        #[arg(long)]
        job: PathBuf,

        /// Print credentials as JSON
        #[arg(long)]
        json: bool,
    },

    /// Prepare credentials, run a command with them, then clean up
    Run {
        /// Path to the job JSON
        #[arg(long)]
        job: PathBuf,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Decode a provisioning profile and print its fields
    InspectProfile {
        /// Path to the .mobileprovision file
        file: PathBuf,

        /// Keychain used to decode the profile
        #[arg(long)]
        keychain: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (doesn't override existing env vars)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyprep=info,keyprep_core=info".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = SigningConfig::from_env()?;

    match cli.command {
        Commands::Verify { job, json } => {
            verify::handle_verify_command(config, &job, json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { job, command } => {
            run::handle_run_command(config, &job, &command).await
        }
        Commands::InspectProfile { file, keychain } => {
            profile::handle_inspect_profile_command(&config, &file, &keychain)
                .await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
