//! # Backup Orchestrator Core
//!
//! Owns the shared bookkeeping and runs the control loop. External signals
//! either mutate state directly under the queue lock or post a
//! [`BackupCommand`]; the loop handles commands and operation events in
//! arrival order, so a data change posted before a pass is scheduled is
//! always drained by that pass.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::agents::AgentConnector;
use super::commands::{BackupCommand, BackupParams, OrchestratorSnapshot};
use super::restore::{RestoreBookkeeping, RestoreCoordinator};
use crate::config::BackupConfig;
use crate::constants::{files, PACKAGE_MANAGER_SENTINEL};
use crate::error::{BackupError, BackupResult};
use crate::logging::{init_structured_logging, log_error};
use crate::operations::{OperationEvent, OperationRegistry, OperationToken, TokenGenerator};
use crate::persistence::{AncestralRecord, ProcessedPackagesJournal};
use crate::platform::{Collaborators, PackageInfo};
use crate::policy::PolicyGate;
use crate::queues::{FullBackupScheduleQueue, PendingRequestSet};
use crate::transport::TransportRegistry;

/// The scheduled full backup currently running
#[derive(Debug, Clone)]
pub(crate) struct RunningFullBackup {
    pub(crate) token: OperationToken,
    pub(crate) package: String,
}

/// Everything guarded by the queue lock
pub(crate) struct QueueState {
    pub(crate) pending: PendingRequestSet,
    pub(crate) full_queue: FullBackupScheduleQueue,
    pub(crate) running_full_backup: Option<RunningFullBackup>,
}

pub(crate) struct OrchestratorInner {
    pub(crate) config: BackupConfig,
    pub(crate) policy: PolicyGate,
    pub(crate) operations: OperationRegistry,
    pub(crate) tokens: TokenGenerator,
    pub(crate) transports: TransportRegistry,
    pub(crate) queues: Mutex<QueueState>,
    /// uid -> key-value participant packages under that uid
    pub(crate) participants: Mutex<HashMap<u32, HashSet<String>>>,
    pub(crate) bookkeeping: Mutex<RestoreBookkeeping>,
    pub(crate) restore: RestoreCoordinator,
    pub(crate) agents: AgentConnector,
    pub(crate) collaborators: Collaborators,
    /// Key-value passes spawned and not yet wound down
    pub(crate) running_passes: AtomicUsize,
    pub(crate) waiting_requests: Mutex<VecDeque<BackupParams>>,
    schedule_write_pending: AtomicBool,
    commands: mpsc::UnboundedSender<BackupCommand>,
}

/// Handle to a running backup engine
#[derive(Clone)]
pub struct BackupOrchestrator {
    pub(crate) inner: Arc<OrchestratorInner>,
}

impl BackupOrchestrator {
    /// Load persisted state, replay leftover journals and start the control
    /// loop. Must be called inside a tokio runtime.
    pub async fn start(config: BackupConfig, collaborators: Collaborators) -> BackupResult<Self> {
        init_structured_logging();
        config.validate()?;
        fs::create_dir_all(&config.base_state_dir)?;
        fs::create_dir_all(config.journal_dir())?;

        let policy = PolicyGate::load(&config.base_state_dir);
        let (operations, events_rx) = OperationRegistry::new();
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let installed = collaborators.packages.installed_packages();
        let participants = build_participants(&installed);

        let ancestral_path = config.base_state_dir.join(files::ANCESTRAL_RECORD);
        let bookkeeping = RestoreBookkeeping {
            record: AncestralRecord::load(&ancestral_path),
            processed: ProcessedPackagesJournal::open(&config.base_state_dir),
            path: ancestral_path,
        };

        let mut pending = PendingRequestSet::new(config.journal_dir());
        let mut replay_targets: HashSet<String> =
            participants.values().flatten().cloned().collect();
        replay_targets.insert(PACKAGE_MANAGER_SENTINEL.to_string());
        let replayed = pending.replay_stale_journals(&replay_targets);

        let eligible: Vec<String> = installed
            .iter()
            .filter(|info| info.gets_full_backup())
            .map(|info| info.package_name.clone())
            .collect();
        let schedule = FullBackupScheduleQueue::load(
            &config.base_state_dir.join(files::FULL_BACKUP_SCHEDULE),
            config.full_backup_interval_ms,
            &eligible,
        );

        let agents = AgentConnector::new(
            collaborators.agents.clone(),
            config.confirmation_ui_package.clone(),
        );
        let transports = TransportRegistry::new(&config.base_state_dir);
        let has_pending = !pending.is_empty();

        let inner = Arc::new(OrchestratorInner {
            policy,
            operations,
            tokens: TokenGenerator::new(),
            transports,
            queues: Mutex::new(QueueState {
                pending,
                full_queue: schedule.queue,
                running_full_backup: None,
            }),
            participants: Mutex::new(participants),
            bookkeeping: Mutex::new(bookkeeping),
            restore: RestoreCoordinator::new(),
            agents,
            collaborators,
            running_passes: AtomicUsize::new(0),
            waiting_requests: Mutex::new(VecDeque::new()),
            schedule_write_pending: AtomicBool::new(false),
            commands,
            config,
        });

        tokio::spawn(run_control_loop(inner.clone(), commands_rx, events_rx));

        if schedule.changed {
            inner.request_schedule_write();
        }
        if has_pending {
            inner.schedule_key_value_job();
        }
        inner.schedule_next_full_backup_job(0);

        info!(
            base_state_dir = %inner.config.base_state_dir.display(),
            replayed_journals = replayed,
            participants = replay_targets.len() - 1,
            enabled = inner.policy.is_enabled(),
            "🚀 Backup orchestrator started"
        );
        Ok(Self { inner })
    }

    /// Stop the control loop after everything already queued
    pub async fn shutdown(&self) -> BackupResult<()> {
        let (resp, rx) = oneshot::channel();
        self.inner.send(BackupCommand::Shutdown { resp })?;
        rx.await
            .map_err(|_| BackupError::OrchestrationError("control loop dropped shutdown".into()))?
    }

    /// Bookkeeping view taken after all previously posted commands ran
    pub async fn snapshot(&self) -> BackupResult<OrchestratorSnapshot> {
        let (resp, rx) = oneshot::channel();
        self.inner.send(BackupCommand::Snapshot { resp })?;
        rx.await
            .map_err(|_| BackupError::OrchestrationError("control loop dropped snapshot".into()))?
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.inner.operations
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.inner.transports
    }

    pub fn policy(&self) -> &PolicyGate {
        &self.inner.policy
    }

    pub fn config(&self) -> &BackupConfig {
        &self.inner.config
    }
}

fn build_participants(installed: &[PackageInfo]) -> HashMap<u32, HashSet<String>> {
    let mut participants: HashMap<u32, HashSet<String>> = HashMap::new();
    for info in installed.iter().filter(|i| i.is_key_value_participant()) {
        participants
            .entry(info.uid)
            .or_default()
            .insert(info.package_name.clone());
    }
    participants
}

async fn run_control_loop(
    inner: Arc<OrchestratorInner>,
    mut commands: mpsc::UnboundedReceiver<BackupCommand>,
    mut events: mpsc::UnboundedReceiver<OperationEvent>,
) {
    info!("🔄 Backup control loop running");
    loop {
        tokio::select! {
            Some(command) = commands.recv() => {
                if !process_command(&inner, command).await {
                    break;
                }
            }
            Some(event) = events.recv() => event.dispatch(&inner.operations),
            else => break,
        }
    }
    info!("🛑 Backup control loop stopped");
}

async fn process_command(inner: &Arc<OrchestratorInner>, command: BackupCommand) -> bool {
    debug!(command = command.command_type(), "Processing command");
    match command {
        BackupCommand::DataChanged { package, targets } => {
            inner.data_changed_impl(&package, &targets);
        }
        BackupCommand::RunKeyValueBackup => inner.start_key_value_pass(),
        BackupCommand::RequestBackup { params } => inner.start_requested_pass(params),
        BackupCommand::KeyValuePassFinished => inner.on_key_value_pass_finished(),
        BackupCommand::RunInitialize {
            transports,
            observer,
        } => inner.start_initialize_pass(transports, observer),
        BackupCommand::ClearBackupData { transport, package } => {
            inner.start_clear_data_pass(transport, package)
        }
        BackupCommand::WriteFullBackupSchedule => inner.write_full_backup_schedule(),
        BackupCommand::StartRestore { params } => inner.start_or_queue_restore(params),
        BackupCommand::RestoreFinished { session_id } => inner.on_restore_finished(session_id),
        BackupCommand::RestoreSessionTimeout { session_id } => {
            inner.restore.expire_session(session_id)
        }
        BackupCommand::Snapshot { resp } => {
            let _ = resp.send(Ok(inner.snapshot()));
        }
        BackupCommand::Shutdown { resp } => {
            let _ = resp.send(Ok(()));
            return false;
        }
    }
    true
}

impl OrchestratorInner {
    pub(crate) fn send(&self, command: BackupCommand) -> BackupResult<()> {
        self.commands
            .send(command)
            .map_err(|_| BackupError::OrchestrationError("control loop is not running".into()))
    }

    /// Post a command, logging if the loop has already stopped
    pub(crate) fn post(&self, command: BackupCommand) {
        if let Err(e) = self.send(command) {
            warn!(error = %e, "Dropping command");
        }
    }

    pub(crate) fn post_delayed(&self, command: BackupCommand, delay: Duration) -> JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(command);
        })
    }

    pub(crate) fn now(&self) -> i64 {
        self.collaborators.clock.now_millis()
    }

    pub(crate) fn package_info(&self, package: &str) -> Option<PackageInfo> {
        self.collaborators.packages.package_info(package)
    }

    /// Every key-value participant on the device
    pub(crate) fn all_participants(&self) -> HashSet<String> {
        self.participants
            .lock()
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub(crate) fn schedule_key_value_job(&self) {
        let fuzz = if self.config.key_value_backup_fuzz_ms > 0 {
            rand::thread_rng().gen_range(0..self.config.key_value_backup_fuzz_ms)
        } else {
            0
        };
        let delay = Duration::from_millis(self.config.key_value_backup_interval_ms + fuzz);
        self.collaborators.jobs.schedule_key_value_job(delay);
    }

    /// Ask the scheduler to fire when the head of the full queue falls due,
    /// but never sooner than `transport_min_latency_ms`
    pub(crate) fn schedule_next_full_backup_job(&self, transport_min_latency_ms: u64) {
        let next_due = self.queues.lock().full_queue.next_due_at();
        let Some(due_at) = next_due else {
            debug!("Full backup queue empty; not scheduling");
            return;
        };
        let app_latency = u64::try_from(due_at - self.now()).unwrap_or(0);
        let latency = transport_min_latency_ms.max(app_latency);
        debug!(latency_ms = latency, "Scheduling next full backup job");
        self.collaborators
            .jobs
            .schedule_full_backup_job(Duration::from_millis(latency));
    }

    /// Coalesce schedule writes: at most one write is queued at a time
    pub(crate) fn request_schedule_write(&self) {
        if !self.schedule_write_pending.swap(true, Ordering::SeqCst) {
            self.post(BackupCommand::WriteFullBackupSchedule);
        }
    }

    pub(crate) fn write_full_backup_schedule(&self) {
        self.schedule_write_pending.store(false, Ordering::SeqCst);
        let snapshot = self.queues.lock().full_queue.clone();
        let path = self.config.base_state_dir.join(files::FULL_BACKUP_SCHEDULE);
        match snapshot.write(&path) {
            Ok(()) => debug!(entries = snapshot.len(), "Full backup schedule written"),
            Err(e) => log_error(
                "full_backup_schedule",
                "write",
                &e.to_string(),
                Some(&path.display().to_string()),
            ),
        }
    }

    pub(crate) fn enqueue_full_backup(&self, package: &str, last_backup: i64) {
        self.queues.lock().full_queue.enqueue(package, last_backup);
        self.request_schedule_write();
    }

    /// Remember that `package` now has data in the current dataset
    pub(crate) fn log_backup_complete(&self, package: &str) {
        if let Err(e) = self.bookkeeping.lock().processed.add_package(package) {
            warn!(package = %package, error = %e, "Unable to record processed package");
        }
    }

    pub(crate) fn snapshot(&self) -> OrchestratorSnapshot {
        let (pending_packages, full_backup_queue, running_full_backup) = {
            let queues = self.queues.lock();
            (
                queues.pending.package_names(),
                queues.full_queue.iter().cloned().collect(),
                queues
                    .running_full_backup
                    .as_ref()
                    .map(|running| running.package.clone()),
            )
        };
        let (ancestral_token, current_token) = {
            let bookkeeping = self.bookkeeping.lock();
            (
                bookkeeping.record.ancestral_token,
                bookkeeping.record.current_token,
            )
        };

        OrchestratorSnapshot {
            pending_packages,
            full_backup_queue,
            running_full_backup,
            backup_running: self.is_backup_running(),
            queued_requests: self.waiting_requests.lock().len(),
            operations: self.operations.len(),
            current_transport: self.transports.current_name(),
            outstanding_leases: self.transports.outstanding_leases(),
            restore_session_active: self.restore.has_active_session(),
            restore_in_progress: self.restore.is_restore_in_progress(),
            ancestral_token,
            current_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participants_grouped_by_uid() {
        let installed = vec![
            PackageInfo::new("com.a", 10_001).with_backup_agent(),
            PackageInfo::new("com.a.helper", 10_001).with_backup_agent(),
            PackageInfo::new("com.b", 10_002).with_backup_agent(),
            PackageInfo::new("com.full", 10_003),
        ];
        let participants = build_participants(&installed);

        assert_eq!(participants.len(), 2);
        assert_eq!(participants[&10_001].len(), 2);
        assert!(!participants.contains_key(&10_003));
    }
}
