use thiserror::Error;

use crate::policy::PolicyRejection;

/// Errors surfaced by the backup engine
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record in {file}: {reason}")]
    CorruptRecord { file: String, reason: String },

    #[error("Transport not registered: {0}")]
    TransportNotRegistered(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backup not allowed: {0}")]
    PolicyRejected(PolicyRejection),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Package not found: {0}")]
    PackageNotFound(String),

    #[error("State transition error: {0}")]
    StateTransitionError(String),

    #[error("Orchestration error: {0}")]
    OrchestrationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl BackupError {
    pub fn corrupt<F: Into<String>, R: Into<String>>(file: F, reason: R) -> Self {
        Self::CorruptRecord {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure means the record on disk should be treated as absent
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptRecord { .. })
    }
}

impl From<crate::transport::TransportError> for BackupError {
    fn from(err: crate::transport::TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<crate::config::ConfigurationError> for BackupError {
    fn from(err: crate::config::ConfigurationError) -> Self {
        Self::ConfigurationError(err.to_string())
    }
}

pub type BackupResult<T> = std::result::Result<T, BackupError>;
