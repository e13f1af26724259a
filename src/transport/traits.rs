use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport disconnected: {0}")]
    Disconnected(String),

    #[error("Transport call failed: {0}")]
    Remote(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Outcome codes a transport reports for data-moving calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Ok,
    Error,
    NotInitialized,
    PackageRejected,
    QuotaExceeded,
}

impl TransportStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::NotInitialized => "not_initialized",
            Self::PackageRejected => "package_rejected",
            Self::QuotaExceeded => "quota_exceeded",
        };
        f.write_str(name)
    }
}

/// A dataset available for restore on the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSet {
    pub name: String,
    pub device: String,
    pub token: u64,
}

/// Static identity of a transport implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDescription {
    /// Name used for selection
    pub name: String,
    /// Identity of the component hosting the transport; mandatory-transport
    /// policy is expressed against this
    pub component: String,
    /// Directory name for this transport's state under the base dir
    pub dir_name: String,
}

impl TransportDescription {
    pub fn new(
        name: impl Into<String>,
        component: impl Into<String>,
        dir_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            dir_name: dir_name.into(),
        }
    }

    /// Package part of the component identity (`package/class`)
    pub fn host_package(&self) -> &str {
        self.component
            .split_once('/')
            .map(|(package, _)| package)
            .unwrap_or(&self.component)
    }
}

/// Remote storage backend. The wire protocol behind it is out of scope.
#[async_trait]
pub trait BackupTransport: Send + Sync {
    /// Token of the dataset this device is currently writing, 0 if none
    async fn current_restore_set(&self) -> TransportResult<u64>;

    async fn restore_sets(&self) -> TransportResult<Vec<RestoreSet>>;

    /// Wipe the remote dataset for this device
    async fn initialize_device(&self) -> TransportResult<TransportStatus>;

    async fn perform_backup(
        &self,
        package: &str,
        non_incremental: bool,
    ) -> TransportResult<TransportStatus>;

    async fn perform_full_backup(&self, package: &str) -> TransportResult<TransportStatus>;

    /// Commit everything sent since the last call
    async fn finish_backup(&self) -> TransportResult<TransportStatus>;

    async fn clear_backup_data(&self, package: &str) -> TransportResult<TransportStatus>;

    async fn start_restore(
        &self,
        restore_token: u64,
        packages: &[String],
    ) -> TransportResult<TransportStatus>;

    async fn finish_restore(&self) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_package_from_component() {
        let description = TransportDescription::new(
            "com.example/.CloudTransport",
            "com.example/.CloudTransport",
            "cloud",
        );
        assert_eq!(description.host_package(), "com.example");

        let bare = TransportDescription::new("local", "local", "local");
        assert_eq!(bare.host_package(), "local");
    }

    #[test]
    fn test_status_helpers() {
        assert!(TransportStatus::Ok.is_ok());
        assert!(!TransportStatus::QuotaExceeded.is_ok());
        assert_eq!(TransportStatus::NotInitialized.to_string(), "not_initialized");
    }
}
