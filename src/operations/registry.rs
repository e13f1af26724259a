//! # Operation Registry
//!
//! Table of in-flight asynchronous operations keyed by token. Each operation
//! ends in exactly one terminal state: a result acknowledges it, a cancel or
//! its deadline times it out, and whichever arrives second is a logged no-op.
//!
//! Completion callbacks are never run on the thread that reported the result;
//! they are posted as [`OperationEvent`]s for the control loop to dispatch.
//! Cancel hooks run synchronously on the canceling thread.
//!
//! Waiters block on a dedicated monitor (`parking_lot` mutex + condvar) so a
//! blocked [`OperationRegistry::wait_for_completion`] never holds up the
//! control loop.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::token::OperationToken;
use crate::state_machine::{OperationState, OperationType};

/// Hooks a registered operation reports back through
pub trait BackupRestoreTask: Send + Sync {
    /// The operation produced a result in time
    fn on_complete(&self, result: i64);

    /// The operation was canceled or its deadline expired
    fn on_cancel(&self, cancel_all: bool);
}

/// Work the registry hands to the control loop
pub enum OperationEvent {
    Completed {
        token: OperationToken,
        callback: Arc<dyn BackupRestoreTask>,
        result: i64,
    },
    DeadlineElapsed {
        token: OperationToken,
    },
}

impl OperationEvent {
    /// Run the event's effect; called from the control loop
    pub fn dispatch(self, registry: &OperationRegistry) {
        match self {
            Self::Completed {
                token,
                callback,
                result,
            } => {
                debug!(token = %token, result = result, "Delivering operation completion");
                callback.on_complete(result);
            }
            Self::DeadlineElapsed { token } => registry.handle_deadline(token),
        }
    }
}

impl fmt::Debug for OperationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { token, result, .. } => f
                .debug_struct("Completed")
                .field("token", token)
                .field("result", result)
                .finish(),
            Self::DeadlineElapsed { token } => f
                .debug_struct("DeadlineElapsed")
                .field("token", token)
                .finish(),
        }
    }
}

struct Operation {
    state: OperationState,
    op_type: OperationType,
    callback: Option<Arc<dyn BackupRestoreTask>>,
    deadline: Option<JoinHandle<()>>,
}

impl Operation {
    fn clear_deadline(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

struct RegistryInner {
    table: Mutex<HashMap<OperationToken, Operation>>,
    changed: Condvar,
    events: mpsc::UnboundedSender<OperationEvent>,
}

#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<RegistryInner>,
}

impl OperationRegistry {
    /// Create a registry and the event stream the control loop must drain
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperationEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                table: Mutex::new(HashMap::new()),
                changed: Condvar::new(),
                events,
            }),
        };
        (registry, rx)
    }

    /// Register a wait-style operation with a deadline
    pub fn begin(
        &self,
        token: OperationToken,
        op_type: OperationType,
        callback: Arc<dyn BackupRestoreTask>,
        timeout: Duration,
    ) {
        if !op_type.is_waitable() {
            error!(token = %token, op_type = %op_type, "Refusing to begin non-waitable operation");
            return;
        }

        let deadline = self.schedule_deadline(token, timeout);
        let mut table = self.inner.table.lock();
        if let Some(mut previous) = table.insert(
            token,
            Operation {
                state: OperationState::Pending,
                op_type,
                callback: Some(callback),
                deadline,
            },
        ) {
            warn!(token = %token, "Operation token reused; replacing stale entry");
            previous.clear_deadline();
        }
        debug!(token = %token, op_type = %op_type, timeout_ms = timeout.as_millis() as u64, "Operation registered");
    }

    /// Register a running pass so it can be found and canceled. No deadline.
    pub fn register_task(&self, token: OperationToken, callback: Arc<dyn BackupRestoreTask>) {
        let mut table = self.inner.table.lock();
        table.insert(
            token,
            Operation {
                state: OperationState::Pending,
                op_type: OperationType::BackupTask,
                callback: Some(callback),
                deadline: None,
            },
        );
        debug!(token = %token, "Backup task registered");
    }

    fn schedule_deadline(&self, token: OperationToken, timeout: Duration) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(token = %token, "No runtime available; operation will have no deadline");
            return None;
        };
        let events = self.inner.events.clone();
        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(OperationEvent::DeadlineElapsed { token });
        }))
    }

    /// Report a result for `token`
    pub fn complete(&self, token: OperationToken, result: i64) {
        let mut table = self.inner.table.lock();
        let Some(op) = table.get_mut(&token) else {
            warn!(token = %token, "Result for unknown operation dropped");
            return;
        };

        let state = op.state;
        match state {
            // The waiter still has to observe the timeout, so the entry stays
            // until it collects it
            OperationState::Timeout => {
                debug!(token = %token, "Result arrived after timeout; dropped");
            }
            // A vanished entry reads as acknowledged to any waiter
            OperationState::Acknowledged => {
                warn!(token = %token, "Duplicate acknowledgement; removing operation");
                table.remove(&token);
            }
            OperationState::Pending => {
                op.state = OperationState::Acknowledged;
                op.clear_deadline();
                if let Some(callback) = op.callback.clone() {
                    let event = OperationEvent::Completed {
                        token,
                        callback,
                        result,
                    };
                    if self.inner.events.send(event).is_err() {
                        warn!(token = %token, "Control loop gone; completion not delivered");
                    }
                }
            }
        }
        self.inner.changed.notify_all();
    }

    /// Cancel `token`, running its cancel hook on this thread
    pub fn cancel(&self, token: OperationToken, cancel_all: bool) {
        let callback = {
            let mut table = self.inner.table.lock();
            let callback = match table.get_mut(&token) {
                None => {
                    debug!(token = %token, "Cancel for unknown operation ignored");
                    None
                }
                Some(op) => match op.state {
                    OperationState::Acknowledged => {
                        debug!(token = %token, "Removing orphaned acknowledged operation");
                        table.remove(&token);
                        None
                    }
                    OperationState::Timeout => {
                        debug!(token = %token, "Operation already timed out");
                        None
                    }
                    OperationState::Pending => {
                        op.state = OperationState::Timeout;
                        op.clear_deadline();
                        op.callback.clone()
                    }
                },
            };
            self.inner.changed.notify_all();
            callback
        };

        if let Some(callback) = callback {
            callback.on_cancel(cancel_all);
        }
    }

    fn handle_deadline(&self, token: OperationToken) {
        let still_pending = {
            let table = self.inner.table.lock();
            matches!(table.get(&token), Some(op) if op.state == OperationState::Pending)
        };
        if still_pending {
            info!(token = %token, "⏰ Operation deadline elapsed");
            self.cancel(token, false);
        }
    }

    /// Block until `token` leaves Pending. True iff it was acknowledged.
    ///
    /// The entry is removed on return. A token that vanished while waiting
    /// counts as success.
    pub fn wait_for_completion(&self, token: OperationToken) -> bool {
        let mut table = self.inner.table.lock();
        loop {
            match table.get(&token).map(|op| op.state) {
                None => {
                    warn!(token = %token, "Awaited operation vanished; treating as complete");
                    return true;
                }
                Some(OperationState::Pending) => self.inner.changed.wait(&mut table),
                Some(state) => {
                    if let Some(mut op) = table.remove(&token) {
                        op.clear_deadline();
                    }
                    return state == OperationState::Acknowledged;
                }
            }
        }
    }

    /// Drop an entry without touching its callback
    pub fn remove(&self, token: OperationToken) {
        if let Some(mut op) = self.inner.table.lock().remove(&token) {
            op.clear_deadline();
        }
        self.inner.changed.notify_all();
    }

    pub fn state(&self, token: OperationToken) -> Option<OperationState> {
        self.inner.table.lock().get(&token).map(|op| op.state)
    }

    /// Tokens of running passes that can still be canceled
    pub fn pending_tasks(&self) -> Vec<OperationToken> {
        self.inner
            .table
            .lock()
            .iter()
            .filter(|(_, op)| {
                op.op_type == OperationType::BackupTask && op.state == OperationState::Pending
            })
            .map(|(token, _)| *token)
            .collect()
    }

    pub fn is_backup_in_progress(&self) -> bool {
        !self.pending_tasks().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.len())
            .finish()
    }
}
