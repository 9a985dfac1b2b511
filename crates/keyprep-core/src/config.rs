//! Signing environment configuration.
//!
//! All locations the subsystem touches on disk are injected from here so
//! tests can point them at scratch directories.

use std::path::PathBuf;

use crate::error::{KeyprepError, Result};

/// Default keychain lock timeout (6 hours).
pub const DEFAULT_KEYCHAIN_TIMEOUT_SECS: u64 = 21600;

/// Paths and tool locations used while staging signing credentials.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    /// Directory where `.mobileprovision` files are written.
    pub provisioning_profiles_dir: PathBuf,
    /// Directory for short-lived `.p12` files.
    pub temp_dir: PathBuf,
    /// Directory where ephemeral keychains are created.
    pub keychain_dir: PathBuf,
    /// Seconds of inactivity before the keychain locks itself.
    pub keychain_timeout_secs: u64,
    /// Path or name of the macOS `security` tool.
    pub security_bin: String,
    /// Path or name of the `openssl` tool.
    pub openssl_bin: String,
}

impl SigningConfig {
    /// Creates a configuration rooted at the given profiles directory with
    /// defaults for everything else.
    pub fn new(provisioning_profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            provisioning_profiles_dir: provisioning_profiles_dir.into(),
            temp_dir: std::env::temp_dir(),
            keychain_dir: std::env::temp_dir(),
            keychain_timeout_secs: DEFAULT_KEYCHAIN_TIMEOUT_SECS,
            security_bin: "security".to_string(),
            openssl_bin: "openssl".to_string(),
        }
    }

    /// Loads configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        let profiles_dir = match std::env::var("KEYPREP_PROVISIONING_PROFILES_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_provisioning_profiles_dir()?,
        };

        let mut config = Self::new(profiles_dir);

        if let Ok(dir) = std::env::var("KEYPREP_TEMP_DIR") {
            config.temp_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("KEYPREP_KEYCHAIN_DIR") {
            config.keychain_dir = PathBuf::from(dir);
        }

        if let Ok(val) = std::env::var("KEYPREP_KEYCHAIN_TIMEOUT_SECS") {
            match val.parse() {
                Ok(v) => config.keychain_timeout_secs = v,
                Err(_) => tracing::warn!(
                    "Ignoring invalid KEYPREP_KEYCHAIN_TIMEOUT_SECS: {}",
                    val
                ),
            }
        }

        if let Ok(bin) = std::env::var("KEYPREP_SECURITY_BIN") {
            config.security_bin = bin;
        }

        if let Ok(bin) = std::env::var("KEYPREP_OPENSSL_BIN") {
            config.openssl_bin = bin;
        }

        Ok(config)
    }
}

/// Returns the standard macOS provisioning profile directory.
pub fn default_provisioning_profiles_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join("Library/MobileDevice/Provisioning Profiles"))
        .ok_or_else(|| KeyprepError::Configuration("No home directory found".to_string()))
}
