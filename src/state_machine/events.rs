use serde::{Deserialize, Serialize};

/// Events that drive a pass through its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PassEvent {
    /// Policy or preconditions refused the pass
    Reject(String),
    /// A transport lease was taken for the pass
    BindTransport(String),
    /// Work handed to a worker task
    Dispatch,
    /// The pass ran to the end
    Complete,
    /// The pass ran to the end but the transport or agents failed it
    Fail(String),
    /// Canceled from outside
    Cancel,
    /// An agent deadline expired and ended the pass
    Timeout,
}

impl PassEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Reject(_) => "reject",
            Self::BindTransport(_) => "bind_transport",
            Self::Dispatch => "dispatch",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
            Self::Timeout => "timeout",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Reject(msg) | Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Reject(_) | Self::Complete | Self::Fail(_) | Self::Cancel | Self::Timeout
        )
    }
}
