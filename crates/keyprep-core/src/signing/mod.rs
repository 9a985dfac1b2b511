//! Code signing utilities for iOS.
//!
//! This module provides functionality for:
//! - distribution certificate inspection (fingerprint, common name)
//! - ephemeral macOS keychain management
//! - provisioning profile installation, parsing and verification
//! - orchestration of all of the above per build target

pub mod certificate;
pub mod keychain;
pub mod manager;
pub mod profile;

pub use certificate::*;
pub use keychain::*;
pub use manager::*;
pub use profile::*;
