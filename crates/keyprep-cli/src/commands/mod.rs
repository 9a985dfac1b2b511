//! CLI command implementations.

use std::path::Path;

use anyhow::{Context, Result};
use keyprep_core::models::{Credentials, IosJob, ProvisioningProfileData};

pub mod profile;
pub mod run;
pub mod verify;

/// Reads and parses a job description.
pub fn read_job(path: &Path) -> Result<IosJob> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    IosJob::from_json(&json)
        .with_context(|| format!("Failed to parse job file {}", path.display()))
}

pub fn print_profile(profile: &ProvisioningProfileData) {
    println!("  Target:       {}", profile.target);
    println!("  Bundle ID:    {}", profile.bundle_identifier);
    println!("  Team ID:      {}", profile.team_id);
    println!("  UUID:         {}", profile.uuid);
    println!("  Name:         {}", profile.name);
    println!("  Distribution: {}", profile.distribution_type);
    if !profile.certificate_common_name.is_empty() {
        println!("  Certificate:  {}", profile.certificate_common_name);
    }
    match profile.expires_at {
        Some(expires_at) => println!("  Expires:      {}", expires_at.to_rfc3339()),
        None => println!("  Expires:      -"),
    }
    println!("  Path:         {}", profile.path.display());
}

pub fn print_credentials(credentials: &Credentials) {
    println!("Keychain:          {}", credentials.keychain_path.display());
    println!("Team ID:           {}", credentials.team_id);
    println!("Distribution type: {}", credentials.distribution_type);
    println!(
        "Application target: {}",
        credentials.application_target_provisioning_profile.target
    );
    println!();

    println!("Targets:");
    println!("{}", "-".repeat(60));
    for profile in credentials.target_provisioning_profiles.values() {
        print_profile(profile);
        println!();
    }
}
