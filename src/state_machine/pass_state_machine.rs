use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::events::PassEvent;
use super::states::{PassKind, PassState};
use crate::error::{BackupError, BackupResult};

/// One recorded transition of a pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassTransition {
    pub from: PassState,
    pub to: PassState,
    pub event: String,
    pub at: DateTime<Utc>,
}

/// In-memory lifecycle tracker for a single pass
#[derive(Debug, Clone)]
pub struct PassStateMachine {
    pass_id: Uuid,
    kind: PassKind,
    state: PassState,
    transport: Option<String>,
    failure: Option<String>,
    history: Vec<PassTransition>,
}

impl PassStateMachine {
    pub fn new(kind: PassKind) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            kind,
            state: PassState::default(),
            transport: None,
            failure: None,
            history: Vec::new(),
        }
    }

    pub fn pass_id(&self) -> Uuid {
        self.pass_id
    }

    pub fn kind(&self) -> PassKind {
        self.kind
    }

    pub fn current_state(&self) -> PassState {
        self.state
    }

    pub fn transport(&self) -> Option<&str> {
        self.transport.as_deref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn history(&self) -> &[PassTransition] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Attempt to transition the pass
    pub fn transition(&mut self, event: PassEvent) -> BackupResult<PassState> {
        let from = self.state;
        let to = Self::determine_target_state(from, &event)?;

        match &event {
            PassEvent::BindTransport(name) => self.transport = Some(name.clone()),
            PassEvent::Reject(reason) | PassEvent::Fail(reason) => {
                self.failure = Some(reason.clone())
            }
            _ => {}
        }

        debug!(
            pass_id = %self.pass_id,
            kind = %self.kind,
            from = %from,
            to = %to,
            event = event.event_type(),
            "Pass transition"
        );

        self.history.push(PassTransition {
            from,
            to,
            event: event.event_type().to_string(),
            at: Utc::now(),
        });
        self.state = to;
        Ok(to)
    }

    fn determine_target_state(current: PassState, event: &PassEvent) -> BackupResult<PassState> {
        let target = match (current, event) {
            (PassState::Requested, PassEvent::Reject(_)) => PassState::Gated,
            (PassState::Requested, PassEvent::BindTransport(_)) => PassState::TransportBound,

            (PassState::TransportBound, PassEvent::Dispatch) => PassState::Dispatched,
            (PassState::TransportBound, PassEvent::Cancel) => PassState::Canceled,

            (PassState::Dispatched, PassEvent::Complete) => PassState::Completed,
            (PassState::Dispatched, PassEvent::Fail(_)) => PassState::Completed,
            (PassState::Dispatched, PassEvent::Cancel) => PassState::Canceled,
            (PassState::Dispatched, PassEvent::Timeout) => PassState::TimedOut,

            (from, _) => {
                return Err(BackupError::StateTransitionError(format!(
                    "cannot apply {} to pass in state {from}",
                    event.event_type()
                )))
            }
        };

        Ok(target)
    }
}
