//! # Scheduled Full Backups
//!
//! One package at a time is taken from the head of the schedule once it is
//! due. Packages that vanished or lost eligibility are dropped; packages in
//! the foreground are pushed back by a randomized busy back-off.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::core::{BackupOrchestrator, RunningFullBackup};
use super::tasks::{FullBackupTask, OnTaskFinished, PassControl};
use crate::platform::{PackageCatalog, PackageInfo};
use crate::queues::{FullBackupEntry, FullBackupScheduleQueue};

/// What a `begin_full_backup` call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FullBackupOutcome {
    Dispatched { package: String },
    /// Nothing to do, or backup is not allowed right now
    NoWork,
    /// Work exists but not yet; the job was re-armed
    Rescheduled { delay_ms: u64 },
    AlreadyRunning,
}

impl FullBackupOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched { .. })
    }
}

pub(crate) struct SelectionContext<'a> {
    pub(crate) now: i64,
    pub(crate) transport_ready: bool,
    pub(crate) catalog: &'a dyn PackageCatalog,
    pub(crate) busy_backoff_min_ms: u64,
    pub(crate) busy_backoff_fuzz_ms: u64,
    pub(crate) key_value_interval_ms: u64,
}

#[derive(Debug)]
pub(crate) enum Selection {
    Run {
        entry: FullBackupEntry,
        info: PackageInfo,
    },
    /// Try again after the given delay, or not at all
    Wait(Option<u64>),
}

/// Walk the head of the schedule until a runnable package turns up.
///
/// Returns the selection and whether the queue was modified.
pub(crate) fn select_full_backup_candidate<R: Rng>(
    queue: &mut FullBackupScheduleQueue,
    ctx: &SelectionContext<'_>,
    rng: &mut R,
) -> (Selection, bool) {
    let mut changed = false;
    loop {
        let Some(head) = queue.head().cloned() else {
            return (Selection::Wait(None), changed);
        };

        if !ctx.transport_ready {
            debug!("Transport not ready for full backup");
            return (Selection::Wait(Some(ctx.key_value_interval_ms)), changed);
        }

        if head.due_at > ctx.now {
            let delay = u64::try_from(head.due_at - ctx.now).unwrap_or(0);
            return (Selection::Wait(Some(delay)), changed);
        }

        let Some(info) = ctx.catalog.package_info(&head.package_name) else {
            info!(package = %head.package_name, "Scheduled package no longer installed; dropping");
            queue.dequeue(&head.package_name);
            changed = true;
            continue;
        };

        if !info.gets_full_backup() {
            info!(package = %head.package_name, "Scheduled package no longer eligible; dropping");
            queue.dequeue(&head.package_name);
            changed = true;
            continue;
        }

        if ctx.catalog.is_foreground(info.uid) && !info.backup_in_foreground {
            let fuzz = if ctx.busy_backoff_fuzz_ms > 0 {
                rng.gen_range(0..ctx.busy_backoff_fuzz_ms)
            } else {
                0
            };
            let retry_at = ctx
                .now
                .saturating_add(i64::try_from(ctx.busy_backoff_min_ms + fuzz).unwrap_or(i64::MAX));
            debug!(package = %head.package_name, retry_at = retry_at, "Package busy; deferring full backup");
            queue.defer(&head.package_name, head.last_backup, retry_at);
            changed = true;
            continue;
        }

        queue.dequeue(&head.package_name);
        return (Selection::Run { entry: head, info }, true);
    }
}

impl BackupOrchestrator {
    /// Entry point for the full-backup job: run the next due package, if any
    pub fn begin_full_backup(&self) -> FullBackupOutcome {
        let inner = &self.inner;
        if let Err(reason) = inner.policy.check_backup_allowed() {
            info!(reason = %reason, "Full backup not allowed");
            return FullBackupOutcome::NoWork;
        }
        if inner.policy.battery_saver() {
            let delay_ms = inner.config.key_value_backup_interval_ms;
            info!("🔋 Battery saver on; deferring full backup");
            inner
                .collaborators
                .jobs
                .schedule_full_backup_job(Duration::from_millis(delay_ms));
            return FullBackupOutcome::Rescheduled { delay_ms };
        }

        // Full backups wait until the metadata pass has run on the transport
        let transport_ready = inner.transports.current_name().is_some_and(|name| {
            inner.transports.is_registered(&name)
                && inner.transports.has_metadata_state(&name)
                && !inner.transports.is_init_pending(&name)
        });

        let (outcome, changed) = {
            let mut queues = inner.queues.lock();
            if let Some(running) = &queues.running_full_backup {
                debug!(package = %running.package, "Full backup already running");
                return FullBackupOutcome::AlreadyRunning;
            }

            let ctx = SelectionContext {
                now: inner.now(),
                transport_ready,
                catalog: inner.collaborators.packages.as_ref(),
                busy_backoff_min_ms: inner.config.busy_backoff_min_ms,
                busy_backoff_fuzz_ms: inner.config.busy_backoff_fuzz_ms,
                key_value_interval_ms: inner.config.key_value_backup_interval_ms,
            };
            let (selection, changed) =
                select_full_backup_candidate(&mut queues.full_queue, &ctx, &mut rand::thread_rng());

            match selection {
                Selection::Wait(None) => (FullBackupOutcome::NoWork, changed),
                Selection::Wait(Some(delay_ms)) => {
                    (FullBackupOutcome::Rescheduled { delay_ms }, changed)
                }
                Selection::Run { entry, info } => {
                    match inner.transports.current_client("full-backup") {
                        None => {
                            warn!("Transport vanished while starting full backup");
                            queues
                                .full_queue
                                .defer(&entry.package_name, entry.last_backup, entry.due_at);
                            let delay_ms = inner.config.key_value_backup_interval_ms;
                            (FullBackupOutcome::Rescheduled { delay_ms }, true)
                        }
                        Some(client) => {
                            let token = inner.tokens.next_token();
                            let control = PassControl::new(inner.operations.clone());
                            inner.operations.register_task(token, control.clone());
                            queues.running_full_backup = Some(RunningFullBackup {
                                token,
                                package: entry.package_name.clone(),
                            });
                            inner.collaborators.wake_lock.acquire();

                            let task = FullBackupTask {
                                inner: Arc::downgrade(inner),
                                listener: OnTaskFinished::new(inner, client, "full-backup"),
                                package: info,
                                last_backup: entry.last_backup,
                                token,
                                control,
                            };
                            tokio::spawn(task.run());
                            info!(package = %entry.package_name, token = %token, "🚀 Full backup dispatched");
                            (
                                FullBackupOutcome::Dispatched {
                                    package: entry.package_name,
                                },
                                true,
                            )
                        }
                    }
                }
            }
        };

        if changed {
            inner.request_schedule_write();
        }
        let rearm_ms = match outcome {
            FullBackupOutcome::Rescheduled { delay_ms } => Some(delay_ms),
            // Nothing queued; look again after a full interval
            FullBackupOutcome::NoWork => Some(inner.config.full_backup_interval_ms),
            _ => None,
        };
        if let Some(delay_ms) = rearm_ms {
            inner
                .collaborators
                .jobs
                .schedule_full_backup_job(Duration::from_millis(delay_ms));
        }
        outcome
    }

    /// Cancel the running scheduled full backup. Returns whether one was
    /// running.
    pub fn end_full_backup(&self) -> bool {
        let running = self.inner.queues.lock().running_full_backup.clone();
        match running {
            Some(running) => {
                info!(package = %running.package, "Ending full backup on request");
                self.inner.operations.cancel(running.token, true);
                true
            }
            None => false,
        }
    }

    /// Re-arm the full-backup job for the head of the schedule
    pub fn schedule_next_full_backup_job(&self, transport_min_latency: Duration) {
        let latency_ms = u64::try_from(transport_min_latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.schedule_next_full_backup_job(latency_ms);
    }
}
