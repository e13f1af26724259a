use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a registered operation in the operation table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Waiting for a result, a cancel, or its deadline
    Pending,
    /// A result arrived before the deadline
    Acknowledged,
    /// Canceled, either explicitly or by the deadline
    Timeout,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "acknowledged" => Ok(Self::Acknowledged),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid operation state: {s}")),
        }
    }
}

impl Default for OperationState {
    fn default() -> Self {
        Self::Pending
    }
}

/// Kind of work an operation token stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Waiting on an agent to finish producing backup data
    BackupWait,
    /// Waiting on an agent to finish consuming restore data
    RestoreWait,
    /// A whole backup pass, registered so it can be canceled
    BackupTask,
}

impl OperationType {
    /// Only wait-style operations carry a deadline
    pub fn is_waitable(&self) -> bool {
        matches!(self, Self::BackupWait | Self::RestoreWait)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackupWait => write!(f, "backup_wait"),
            Self::RestoreWait => write!(f, "restore_wait"),
            Self::BackupTask => write!(f, "backup_task"),
        }
    }
}

/// Lifecycle of one backup, restore or maintenance pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Requested,
    /// Refused by policy or preconditions before any transport was bound
    Gated,
    TransportBound,
    Dispatched,
    Completed,
    Canceled,
    TimedOut,
}

impl PassState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Gated | Self::Completed | Self::Canceled | Self::TimedOut
        )
    }

    /// A transport lease is outstanding in these states
    pub fn holds_transport(&self) -> bool {
        matches!(self, Self::TransportBound | Self::Dispatched)
    }
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Gated => write!(f, "gated"),
            Self::TransportBound => write!(f, "transport_bound"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Completed => write!(f, "completed"),
            Self::Canceled => write!(f, "canceled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl std::str::FromStr for PassState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "gated" => Ok(Self::Gated),
            "transport_bound" => Ok(Self::TransportBound),
            "dispatched" => Ok(Self::Dispatched),
            "completed" => Ok(Self::Completed),
            "canceled" => Ok(Self::Canceled),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(format!("Invalid pass state: {s}")),
        }
    }
}

impl Default for PassState {
    fn default() -> Self {
        Self::Requested
    }
}

/// What a pass does, for logging and bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    KeyValue,
    Full,
    Restore,
    Initialize,
    ClearData,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyValue => write!(f, "key_value"),
            Self::Full => write!(f, "full"),
            Self::Restore => write!(f, "restore"),
            Self::Initialize => write!(f, "initialize"),
            Self::ClearData => write!(f, "clear_data"),
        }
    }
}
