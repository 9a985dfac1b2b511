//! Domain models for iOS credential staging.

pub mod job;
pub mod signing;

pub use job::*;
pub use signing::*;
