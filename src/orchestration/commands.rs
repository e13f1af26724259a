//! Commands processed, in arrival order, by the orchestrator's control loop.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::BackupResult;
use crate::platform::BackupObserver;
use crate::queues::FullBackupEntry;
use crate::transport::TransportClient;

/// Type alias for command response channels
pub type CommandResponder<T> = oneshot::Sender<BackupResult<T>>;

/// A caller-requested backup, already gated and bound to a transport
pub struct BackupParams {
    pub client: TransportClient,
    pub key_value_packages: Vec<String>,
    pub full_packages: Vec<String>,
    pub observer: Option<Arc<dyn BackupObserver>>,
    pub non_incremental: bool,
}

/// A restore ready to run once no other restore is in progress
pub struct RestoreParams {
    pub client: TransportClient,
    pub restore_token: u64,
    pub packages: Vec<String>,
    /// Installer callback token when restoring at install time
    pub install_token: Option<i32>,
    /// Record the restored set as the device's ancestral dataset
    pub record_ancestral: bool,
    pub session_id: Option<Uuid>,
}

pub enum BackupCommand {
    /// Stage a package whose data changed
    DataChanged {
        package: String,
        targets: HashSet<String>,
    },
    /// Scheduled or immediate key-value pass over everything pending
    RunKeyValueBackup,
    RequestBackup {
        params: BackupParams,
    },
    /// A key-value pass wound down; start the next queued request, if any
    KeyValuePassFinished,
    /// Wipe and re-initialize the named transports
    RunInitialize {
        transports: Vec<String>,
        observer: Option<Arc<dyn BackupObserver>>,
    },
    ClearBackupData {
        transport: String,
        package: String,
    },
    /// Persist the full backup schedule
    WriteFullBackupSchedule,
    StartRestore {
        params: RestoreParams,
    },
    RestoreFinished {
        session_id: Option<Uuid>,
    },
    RestoreSessionTimeout {
        session_id: Uuid,
    },
    /// Processed after everything queued before it; doubles as a barrier
    Snapshot {
        resp: CommandResponder<OrchestratorSnapshot>,
    },
    Shutdown {
        resp: CommandResponder<()>,
    },
}

impl BackupCommand {
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::DataChanged { .. } => "data_changed",
            Self::RunKeyValueBackup => "run_key_value_backup",
            Self::RequestBackup { .. } => "request_backup",
            Self::KeyValuePassFinished => "key_value_pass_finished",
            Self::RunInitialize { .. } => "run_initialize",
            Self::ClearBackupData { .. } => "clear_backup_data",
            Self::WriteFullBackupSchedule => "write_full_backup_schedule",
            Self::StartRestore { .. } => "start_restore",
            Self::RestoreFinished { .. } => "restore_finished",
            Self::RestoreSessionTimeout { .. } => "restore_session_timeout",
            Self::Snapshot { .. } => "snapshot",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

impl fmt::Debug for BackupCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupCommand")
            .field("type", &self.command_type())
            .finish()
    }
}

/// Point-in-time view of the orchestrator's bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    pub pending_packages: Vec<String>,
    pub full_backup_queue: Vec<FullBackupEntry>,
    pub running_full_backup: Option<String>,
    pub backup_running: bool,
    /// Requested backups waiting for the running pass to finish
    pub queued_requests: usize,
    pub operations: usize,
    pub current_transport: Option<String>,
    pub outstanding_leases: usize,
    pub restore_session_active: bool,
    pub restore_in_progress: bool,
    pub ancestral_token: u64,
    pub current_token: u64,
}
