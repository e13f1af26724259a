//! # Platform Collaborators
//!
//! Interfaces to the pieces of the host system the engine drives but does
//! not own: package metadata, agent process lifecycle, the installer, power
//! management and the job scheduler. Implementations are injected into
//! [`crate::orchestration::BackupOrchestrator`] through [`Collaborators`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::constants::SYSTEM_UID;
use crate::operations::OperationToken;

/// Identity of whoever is calling into the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub uid: u32,
    /// Holds the backup capability and may act on any package
    pub privileged: bool,
}

impl Caller {
    pub fn system() -> Self {
        Self {
            uid: SYSTEM_UID,
            privileged: true,
        }
    }

    pub fn app(uid: u32) -> Self {
        Self {
            uid,
            privileged: false,
        }
    }

    pub fn is_system(&self) -> bool {
        self.uid == SYSTEM_UID
    }
}

/// What the engine needs to know about an installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub package_name: String,
    pub uid: u32,
    /// The package opted in to backup at all
    pub allows_backup: bool,
    /// The package ships its own key-value backup agent
    pub has_backup_agent: bool,
    /// A package with an agent that nonetheless wants full-data backup
    pub full_backup_only: bool,
    /// Full backup may run while the package is in the foreground
    pub backup_in_foreground: bool,
}

impl PackageInfo {
    pub fn new(package_name: impl Into<String>, uid: u32) -> Self {
        Self {
            package_name: package_name.into(),
            uid,
            allows_backup: true,
            has_backup_agent: false,
            full_backup_only: false,
            backup_in_foreground: false,
        }
    }

    pub fn with_backup_agent(mut self) -> Self {
        self.has_backup_agent = true;
        self
    }

    pub fn is_eligible_for_backup(&self) -> bool {
        self.allows_backup
    }

    /// Full-data backup applies to agentless packages and to agents that ask
    /// for it explicitly
    pub fn gets_full_backup(&self) -> bool {
        self.is_eligible_for_backup() && (!self.has_backup_agent || self.full_backup_only)
    }

    /// Key-value participants are the eligible packages that ship an agent
    pub fn is_key_value_participant(&self) -> bool {
        self.is_eligible_for_backup() && self.has_backup_agent && !self.full_backup_only
    }
}

pub trait PackageCatalog: Send + Sync {
    fn package_info(&self, package: &str) -> Option<PackageInfo>;

    fn installed_packages(&self) -> Vec<PackageInfo>;

    /// Whether the uid currently has visible UI
    fn is_foreground(&self, uid: u32) -> bool;
}

/// Which kind of work an agent is bound for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Incremental,
    Full,
    Restore,
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incremental => write!(f, "incremental"),
            Self::Full => write!(f, "full"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

/// A bound agent. Each call returns immediately; the agent reports through
/// the orchestrator's `op_complete` with the token it was given.
pub trait BackupAgent: Send + Sync {
    fn do_backup(&self, token: OperationToken, non_incremental: bool);

    fn do_full_backup(&self, token: OperationToken);

    fn do_restore(&self, token: OperationToken, restore_token: u64);
}

/// Starts and stops agent processes. A successful bind is announced later
/// through the orchestrator's `agent_connected`.
pub trait AgentHost: Send + Sync {
    /// Ask for the agent to be brought up; false if the request was refused
    fn bind_backup_agent(&self, package: &PackageInfo, mode: AgentMode) -> bool;

    fn unbind_backup_agent(&self, package: &PackageInfo);

    fn kill_application_process(&self, package: &PackageInfo);

    /// Abandon a bind that never completed
    fn clear_pending_backup(&self);
}

pub trait InstallObserver: Send + Sync {
    fn finish_package_install(&self, install_token: i32, did_launch_restore: bool);
}

pub trait WakeLock: Send + Sync {
    fn acquire(&self);

    fn release(&self);
}

/// External job scheduler that later calls back into the orchestrator's
/// `run_key_value_pass` / `begin_full_backup`
pub trait JobScheduler: Send + Sync {
    fn schedule_key_value_job(&self, delay: Duration);

    fn cancel_key_value_job(&self);

    fn schedule_full_backup_job(&self, delay: Duration);
}

/// Status reported to observers of a backup request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Success,
    NotAllowed,
    TransportAborted,
    NoPackages,
    PackageNotFound,
    PackageNotEligible,
    AgentFailure,
    TransportPackageRejected,
    QuotaExceeded,
    Cancelled,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::NotAllowed => "not_allowed",
            Self::TransportAborted => "transport_aborted",
            Self::NoPackages => "no_packages",
            Self::PackageNotFound => "package_not_found",
            Self::PackageNotEligible => "package_not_eligible",
            Self::AgentFailure => "agent_failure",
            Self::TransportPackageRejected => "transport_package_rejected",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

pub trait BackupObserver: Send + Sync {
    fn on_result(&self, package: &str, status: BackupStatus);

    fn backup_finished(&self, status: BackupStatus);
}

/// Everything the orchestrator is constructed with besides configuration
/// and transports
#[derive(Clone)]
pub struct Collaborators {
    pub packages: Arc<dyn PackageCatalog>,
    pub agents: Arc<dyn AgentHost>,
    pub installer: Arc<dyn InstallObserver>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub jobs: Arc<dyn JobScheduler>,
    pub clock: Arc<dyn Clock>,
}
