//! Error types for the keyprep core library.

use thiserror::Error;

/// Core error type for credential preparation.
#[derive(Error, Debug)]
pub enum KeyprepError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid {field} for target '{target}': {source}")]
    InvalidSecret {
        target: String,
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("{program} {subcommand} failed: {stderr}")]
    ExternalTool {
        program: String,
        subcommand: String,
        stderr: String,
    },

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error when parsing provisioning profile: {0}")]
    Parse(String),

    #[error(
        "Provisioning profile and distribution certificate don't match.\n\
         Profile's certificate fingerprint = {profile_fingerprint}, \
         distribution certificate fingerprint = {certificate_fingerprint}"
    )]
    CertificateMismatch {
        profile_fingerprint: String,
        certificate_fingerprint: String,
    },

    #[error(
        "Distribution certificate with fingerprint {fingerprint} hasn't been imported successfully \
         (no matching identity for team {team_id})"
    )]
    IdentityNotFound {
        team_id: String,
        fingerprint: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Clean-up failed: {}", join_errors(.0))]
    Cleanup(Vec<KeyprepError>),
}

/// Coarse classification of [`KeyprepError`] for exhaustive branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Secrets missing or malformed.
    Configuration,
    /// An external tool exited non-zero or could not be started.
    ExternalTool,
    /// The decoded provisioning profile payload is malformed.
    Parse,
    /// The profile's embedded certificate is not the supplied certificate.
    TrustMismatch,
    /// The keychain does not hold the identity it reported importing.
    Consistency,
    Io,
    /// An operation was called in the wrong lifecycle state.
    InvalidState,
    Cleanup,
}

impl KeyprepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyprepError::Configuration(_) | KeyprepError::InvalidSecret { .. } => {
                ErrorKind::Configuration
            }
            KeyprepError::ExternalTool { .. } | KeyprepError::Spawn { .. } => {
                ErrorKind::ExternalTool
            }
            KeyprepError::Io { .. } => ErrorKind::Io,
            KeyprepError::Parse(_) => ErrorKind::Parse,
            KeyprepError::CertificateMismatch { .. } => ErrorKind::TrustMismatch,
            KeyprepError::IdentityNotFound { .. } => ErrorKind::Consistency,
            KeyprepError::InvalidState(_) => ErrorKind::InvalidState,
            KeyprepError::Cleanup(_) => ErrorKind::Cleanup,
        }
    }

    /// Wraps an I/O error with a short description of what was attempted.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        KeyprepError::Io {
            context: context.into(),
            source,
        }
    }
}

fn join_errors(errors: &[KeyprepError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for keyprep operations.
pub type Result<T> = std::result::Result<T, KeyprepError>;
