//! Keyprep Core Library
//!
//! Stages iOS code-signing credentials for a build: an ephemeral keychain
//! plus one verified provisioning profile per build target.

pub mod config;
pub mod error;
pub mod models;
pub mod process;
pub mod signing;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::SigningConfig;
pub use error::{ErrorKind, KeyprepError, Result};
pub use signing::CredentialsManager;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
