//! Backup passes that run off the control loop: key-value passes, scheduled
//! full backups, transport initialization and per-package data clearing.
//!
//! Every pass holds exactly one transport lease, owned by its
//! [`OnTaskFinished`] guard, and registers its pass token so
//! `cancel_backups` can reach it. Passes keep only a weak reference to the
//! orchestrator and upgrade it for the duration of their run.

use bytes::BytesMut;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::commands::BackupCommand;
use super::core::OrchestratorInner;
use crate::constants::PACKAGE_MANAGER_SENTINEL;
use crate::logging::log_backup_operation;
use crate::operations::{BackupRestoreTask, OperationRegistry, OperationToken};
use crate::persistence::atomic::atomic_write;
use crate::persistence::codec::put_utf;
use crate::platform::{AgentMode, BackupAgent, BackupObserver, BackupStatus, PackageInfo};
use crate::queues::DrainedPass;
use crate::state_machine::{OperationType, PassEvent, PassKind, PassStateMachine};
use crate::transport::{TransportClient, TransportStatus};

/// Returns a pass's transport lease exactly once, when the pass finishes or
/// is dropped early
pub(crate) struct OnTaskFinished {
    inner: Weak<OrchestratorInner>,
    client: Option<TransportClient>,
    caller: &'static str,
}

impl OnTaskFinished {
    pub(crate) fn new(
        inner: &Arc<OrchestratorInner>,
        client: TransportClient,
        caller: &'static str,
    ) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            client: Some(client),
            caller,
        }
    }

    pub(crate) fn client(&self) -> Option<&TransportClient> {
        self.client.as_ref()
    }

    pub(crate) fn finish(mut self) {
        self.dispose();
    }

    fn dispose(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        match self.inner.upgrade() {
            Some(inner) => {
                inner.transports.dispose_client(&client, self.caller);
            }
            None => debug!(caller = self.caller, "Orchestrator gone; lease dropped with it"),
        }
    }
}

impl Drop for OnTaskFinished {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Cancel hook shared by a pass and its in-flight agent wait
pub(crate) struct PassControl {
    operations: OperationRegistry,
    canceled: AtomicBool,
    current_wait: Mutex<Option<OperationToken>>,
}

impl PassControl {
    pub(crate) fn new(operations: OperationRegistry) -> Arc<Self> {
        Arc::new(Self {
            operations,
            canceled: AtomicBool::new(false),
            current_wait: Mutex::new(None),
        })
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl BackupRestoreTask for PassControl {
    fn on_complete(&self, result: i64) {
        debug!(result = result, "Pass token acknowledged");
    }

    fn on_cancel(&self, cancel_all: bool) {
        self.canceled.store(true, Ordering::SeqCst);
        let waiting = self.current_wait.lock().take();
        if let Some(token) = waiting {
            self.operations.cancel(token, cancel_all);
        }
    }
}

/// Callback for a single agent wait; the waiter reads the outcome from the
/// registry, so nothing happens here beyond logging
struct AgentWait {
    package: String,
}

impl BackupRestoreTask for AgentWait {
    fn on_complete(&self, result: i64) {
        debug!(package = %self.package, result = result, "Agent finished");
    }

    fn on_cancel(&self, cancel_all: bool) {
        debug!(package = %self.package, cancel_all = cancel_all, "Agent wait abandoned");
    }
}

/// Register a wait-style operation, start the agent work and block (off the
/// runtime) until it is acknowledged, canceled or times out
pub(crate) async fn await_agent<F>(
    inner: &OrchestratorInner,
    control: Option<&PassControl>,
    op_type: OperationType,
    package: &str,
    timeout: Duration,
    start: F,
) -> bool
where
    F: FnOnce(OperationToken),
{
    let token = inner.tokens.next_token();
    if let Some(control) = control {
        *control.current_wait.lock() = Some(token);
    }
    inner.operations.begin(
        token,
        op_type,
        Arc::new(AgentWait {
            package: package.to_string(),
        }),
        timeout,
    );
    if control.is_some_and(|c| c.is_canceled()) {
        inner.operations.cancel(token, true);
    } else {
        start(token);
    }

    let operations = inner.operations.clone();
    let acknowledged = tokio::task::spawn_blocking(move || operations.wait_for_completion(token))
        .await
        .unwrap_or(false);
    if let Some(control) = control {
        control.current_wait.lock().take();
    }
    acknowledged
}

fn map_transport_status(status: TransportStatus) -> BackupStatus {
    match status {
        TransportStatus::Ok => BackupStatus::Success,
        TransportStatus::PackageRejected => BackupStatus::TransportPackageRejected,
        TransportStatus::QuotaExceeded => BackupStatus::QuotaExceeded,
        TransportStatus::Error | TransportStatus::NotInitialized => BackupStatus::TransportAborted,
    }
}

/// Per-package steps shared by every backup pass
pub(crate) struct PackageRunner<'a> {
    pub(crate) inner: &'a Arc<OrchestratorInner>,
    pub(crate) client: &'a TransportClient,
    pub(crate) control: &'a PassControl,
    /// Set when the transport reported it needs initialization
    pub(crate) not_initialized: bool,
}

impl<'a> PackageRunner<'a> {
    pub(crate) fn new(
        inner: &'a Arc<OrchestratorInner>,
        client: &'a TransportClient,
        control: &'a PassControl,
    ) -> Self {
        Self {
            inner,
            client,
            control,
            not_initialized: false,
        }
    }

    fn record_transport_status(&mut self, status: TransportStatus) -> BackupStatus {
        if status == TransportStatus::NotInitialized {
            self.not_initialized = true;
        }
        map_transport_status(status)
    }

    async fn bind(&self, info: &PackageInfo, mode: AgentMode) -> Option<Arc<dyn BackupAgent>> {
        self.inner
            .agents
            .bind(info, mode, self.inner.config.agent_bind_timeout())
            .await
    }

    pub(crate) async fn key_value(&mut self, info: &PackageInfo, non_incremental: bool) -> BackupStatus {
        let package = info.package_name.as_str();
        let Some(agent) = self.bind(info, AgentMode::Incremental).await else {
            return BackupStatus::AgentFailure;
        };

        let acknowledged = await_agent(
            self.inner,
            Some(self.control),
            OperationType::BackupWait,
            package,
            self.inner.config.key_value_agent_timeout(),
            |token| agent.do_backup(token, non_incremental),
        )
        .await;
        self.inner.agents.tear_down(info);

        if !acknowledged {
            return if self.control.is_canceled() {
                BackupStatus::Cancelled
            } else {
                warn!(package = %package, "Key-value agent did not finish in time");
                BackupStatus::AgentFailure
            };
        }

        let status = match self
            .client
            .transport()
            .perform_backup(package, non_incremental)
            .await
        {
            Ok(status) => self.record_transport_status(status),
            Err(e) => {
                warn!(package = %package, error = %e, "Transport failed during key-value backup");
                BackupStatus::TransportAborted
            }
        };
        if status == BackupStatus::Success {
            self.inner.log_backup_complete(package);
        }
        status
    }

    pub(crate) async fn full(&mut self, info: &PackageInfo) -> BackupStatus {
        let package = info.package_name.as_str();
        let Some(agent) = self.bind(info, AgentMode::Full).await else {
            return BackupStatus::AgentFailure;
        };

        let acknowledged = await_agent(
            self.inner,
            Some(self.control),
            OperationType::BackupWait,
            package,
            self.inner.config.full_backup_agent_timeout(),
            |token| agent.do_full_backup(token),
        )
        .await;
        self.inner.agents.tear_down(info);

        if !acknowledged {
            return if self.control.is_canceled() {
                BackupStatus::Cancelled
            } else {
                warn!(package = %package, "Full backup agent did not finish in time");
                BackupStatus::AgentFailure
            };
        }

        let status = match self.client.transport().perform_full_backup(package).await {
            Ok(status) => self.record_transport_status(status),
            Err(e) => {
                warn!(package = %package, error = %e, "Transport failed during full backup");
                BackupStatus::TransportAborted
            }
        };
        if status == BackupStatus::Success {
            self.inner.log_backup_complete(package);
        }
        status
    }

    /// Back up the installed-package metadata and remember that this
    /// transport has it
    pub(crate) async fn metadata(&mut self, non_incremental: bool) -> BackupStatus {
        let status = match self
            .client
            .transport()
            .perform_backup(PACKAGE_MANAGER_SENTINEL, non_incremental)
            .await
        {
            Ok(status) => self.record_transport_status(status),
            Err(e) => {
                warn!(error = %e, "Transport failed during metadata backup");
                BackupStatus::TransportAborted
            }
        };
        if status == BackupStatus::Success {
            if let Err(e) = self.write_metadata_state() {
                warn!(error = %e, "Unable to record metadata state");
            }
        }
        status
    }

    fn write_metadata_state(&self) -> crate::error::BackupResult<()> {
        let path = self
            .inner
            .transports
            .metadata_state_file(self.client.transport_name())?;
        let mut names: Vec<String> = self
            .inner
            .collaborators
            .packages
            .installed_packages()
            .into_iter()
            .map(|info| info.package_name)
            .collect();
        names.sort();

        let mut buf = BytesMut::new();
        for name in &names {
            put_utf(&mut buf, name)?;
        }
        atomic_write(&path, &buf)
    }
}

/// Commit a pass's writes; fetch the dataset token the first time the
/// transport accepts data
pub(crate) async fn finish_pass(
    inner: &OrchestratorInner,
    client: &TransportClient,
) -> TransportStatus {
    let status = match client.transport().finish_backup().await {
        Ok(status) => status,
        Err(e) => {
            warn!(transport = %client.transport_name(), error = %e, "finish_backup failed");
            TransportStatus::Error
        }
    };
    if !status.is_ok() {
        return status;
    }

    let needs_token = inner.bookkeeping.lock().record.current_token == 0;
    if needs_token {
        match client.transport().current_restore_set().await {
            Ok(token) if token != 0 => {
                let mut bookkeeping = inner.bookkeeping.lock();
                bookkeeping.record.current_token = token;
                if let Err(e) = bookkeeping.record.write(&bookkeeping.path) {
                    error!(error = %e, "Unable to persist current restore token");
                }
                info!(current_token = token, "Current restore set recorded");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Unable to fetch current restore set"),
        }
    }
    status
}

/// A key-value pass: either everything drained from the pending set, or an
/// explicitly requested list (which may include full-data packages)
pub(crate) struct KeyValueBackupTask {
    pub(crate) inner: Weak<OrchestratorInner>,
    pub(crate) listener: OnTaskFinished,
    pub(crate) drained: Option<DrainedPass>,
    pub(crate) key_value_packages: Vec<String>,
    pub(crate) full_packages: Vec<String>,
    pub(crate) observer: Option<Arc<dyn BackupObserver>>,
    pub(crate) non_incremental: bool,
    pub(crate) token: OperationToken,
    pub(crate) control: Arc<PassControl>,
}

impl KeyValueBackupTask {
    pub(crate) async fn run(self) {
        let Self {
            inner,
            listener,
            drained,
            key_value_packages,
            full_packages,
            observer,
            non_incremental,
            token,
            control,
        } = self;
        let Some(inner) = inner.upgrade() else {
            debug!(token = %token, "Orchestrator stopped before key-value pass ran");
            return;
        };

        inner.collaborators.wake_lock.acquire();
        let mut machine = PassStateMachine::new(PassKind::KeyValue);
        let status = match listener.client() {
            Some(client) => {
                Self::run_packages(
                    &inner,
                    client,
                    &control,
                    &mut machine,
                    &key_value_packages,
                    &full_packages,
                    observer.as_deref(),
                    non_incremental,
                )
                .await
            }
            None => BackupStatus::TransportAborted,
        };

        if let Some(drained) = drained {
            let mut queues = inner.queues.lock();
            drained.finish(status == BackupStatus::Success, &mut queues.pending);
        }

        let event = match status {
            BackupStatus::Success => PassEvent::Complete,
            BackupStatus::Cancelled => PassEvent::Cancel,
            other => PassEvent::Fail(other.to_string()),
        };
        if let Err(e) = machine.transition(event) {
            debug!(error = %e, "Pass ended before dispatch");
        }

        log_backup_operation(
            "key_value_pass",
            None,
            machine.transport(),
            &status.to_string(),
            Some(&format!("{} packages", key_value_packages.len() + full_packages.len())),
        );

        inner.post(BackupCommand::KeyValuePassFinished);
        if let Some(observer) = &observer {
            observer.backup_finished(status);
        }
        inner.operations.remove(token);
        if status != BackupStatus::Success && status != BackupStatus::Cancelled {
            inner.schedule_key_value_job();
        }
        inner.collaborators.wake_lock.release();
        listener.finish();
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_packages(
        inner: &Arc<OrchestratorInner>,
        client: &TransportClient,
        control: &PassControl,
        machine: &mut PassStateMachine,
        key_value_packages: &[String],
        full_packages: &[String],
        observer: Option<&dyn BackupObserver>,
        non_incremental: bool,
    ) -> BackupStatus {
        let transport_name = client.transport_name();
        if let Err(e) = machine.transition(PassEvent::BindTransport(transport_name.to_string())) {
            warn!(error = %e, "Unable to bind pass");
        }

        if inner.transports.is_init_pending(transport_name) {
            info!(transport = %transport_name, "Transport awaiting initialization; aborting pass");
            let _ = machine.transition(PassEvent::Cancel);
            return BackupStatus::TransportAborted;
        }
        let _ = machine.transition(PassEvent::Dispatch);

        let mut runner = PackageRunner::new(inner, client, control);
        let mut status = BackupStatus::Success;

        for package in key_value_packages {
            if control.is_canceled() {
                status = BackupStatus::Cancelled;
                break;
            }
            let result = if package == PACKAGE_MANAGER_SENTINEL {
                runner.metadata(non_incremental).await
            } else {
                match inner.package_info(package) {
                    None => BackupStatus::PackageNotFound,
                    Some(info) if !info.is_key_value_participant() => {
                        BackupStatus::PackageNotEligible
                    }
                    Some(info) => runner.key_value(&info, non_incremental).await,
                }
            };
            debug!(package = %package, status = %result, "Key-value package done");
            if let Some(observer) = observer {
                observer.on_result(package, result);
            }
            match result {
                BackupStatus::TransportAborted => {
                    status = BackupStatus::TransportAborted;
                    break;
                }
                BackupStatus::Cancelled => {
                    status = BackupStatus::Cancelled;
                    break;
                }
                _ => {}
            }
        }

        if status == BackupStatus::Success {
            for package in full_packages {
                if control.is_canceled() {
                    status = BackupStatus::Cancelled;
                    break;
                }
                let result = match inner.package_info(package) {
                    None => BackupStatus::PackageNotFound,
                    Some(info) if !info.gets_full_backup() => BackupStatus::PackageNotEligible,
                    Some(info) => runner.full(&info).await,
                };
                if result == BackupStatus::Success {
                    inner.enqueue_full_backup(package, inner.now());
                }
                if let Some(observer) = observer {
                    observer.on_result(package, result);
                }
                if matches!(
                    result,
                    BackupStatus::TransportAborted | BackupStatus::Cancelled
                ) {
                    status = result;
                    break;
                }
            }
        }

        if status == BackupStatus::Success {
            let finished = finish_pass(inner, client).await;
            runner.record_transport_status(finished);
            if !finished.is_ok() {
                status = BackupStatus::TransportAborted;
            }
        }

        if runner.not_initialized {
            mark_for_initialization(inner, transport_name);
        }
        status
    }
}

/// Remember that `transport` must be wiped and schedule the wipe
pub(crate) fn mark_for_initialization(inner: &OrchestratorInner, transport: &str) {
    match inner.transports.transport_dir_name(transport) {
        Ok(dir_name) => {
            if let Err(e) = inner
                .transports
                .record_init_pending(true, transport, &dir_name)
            {
                error!(transport = %transport, error = %e, "Unable to record init-pending state");
            }
            inner.post_delayed(
                BackupCommand::RunInitialize {
                    transports: vec![transport.to_string()],
                    observer: None,
                },
                inner.config.transport_retry_interval(),
            );
        }
        Err(e) => warn!(transport = %transport, error = %e, "Cannot mark unknown transport"),
    }
}

/// The single scheduled full backup dequeued from the schedule
pub(crate) struct FullBackupTask {
    pub(crate) inner: Weak<OrchestratorInner>,
    pub(crate) listener: OnTaskFinished,
    pub(crate) package: PackageInfo,
    pub(crate) last_backup: i64,
    pub(crate) token: OperationToken,
    pub(crate) control: Arc<PassControl>,
}

impl FullBackupTask {
    pub(crate) async fn run(self) {
        let Self {
            inner,
            listener,
            package,
            last_backup,
            token,
            control,
        } = self;
        let Some(inner) = inner.upgrade() else {
            debug!(token = %token, "Orchestrator stopped before full backup ran");
            return;
        };
        let name = package.package_name.clone();
        let mut machine = PassStateMachine::new(PassKind::Full);

        let status = match listener.client() {
            Some(client) => {
                let _ = machine.transition(PassEvent::BindTransport(
                    client.transport_name().to_string(),
                ));
                let _ = machine.transition(PassEvent::Dispatch);
                let mut runner = PackageRunner::new(&inner, client, &control);
                let mut status = runner.full(&package).await;
                if status == BackupStatus::Success {
                    let finished = finish_pass(&inner, client).await;
                    runner.record_transport_status(finished);
                    if !finished.is_ok() {
                        status = BackupStatus::TransportAborted;
                    }
                }
                if runner.not_initialized {
                    mark_for_initialization(&inner, client.transport_name());
                }
                status
            }
            None => BackupStatus::TransportAborted,
        };

        if status == BackupStatus::Success {
            inner.enqueue_full_backup(&name, inner.now());
            let _ = machine.transition(PassEvent::Complete);
        } else {
            let fuzz = if inner.config.busy_backoff_fuzz_ms > 0 {
                rand::thread_rng().gen_range(0..inner.config.busy_backoff_fuzz_ms)
            } else {
                0
            };
            let retry_at = inner.now()
                + i64::try_from(inner.config.busy_backoff_min_ms + fuzz).unwrap_or(i64::MAX / 2);
            inner
                .queues
                .lock()
                .full_queue
                .defer(&name, last_backup, retry_at);
            inner.request_schedule_write();
            let event = if status == BackupStatus::Cancelled {
                PassEvent::Cancel
            } else {
                PassEvent::Fail(status.to_string())
            };
            let _ = machine.transition(event);
        }

        log_backup_operation(
            "full_backup",
            Some(&name),
            machine.transport(),
            &status.to_string(),
            None,
        );

        {
            let mut queues = inner.queues.lock();
            if queues
                .running_full_backup
                .as_ref()
                .is_some_and(|running| running.token == token)
            {
                queues.running_full_backup = None;
            }
        }
        inner.operations.remove(token);
        inner.collaborators.wake_lock.release();
        inner.schedule_next_full_backup_job(0);
        listener.finish();
    }
}

/// Wipe each named transport's remote dataset, then reset local state for it
pub(crate) async fn run_initialize(
    inner: Weak<OrchestratorInner>,
    transports: Vec<String>,
    observer: Option<Arc<dyn BackupObserver>>,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.collaborators.wake_lock.acquire();
    let mut overall = BackupStatus::Success;

    for name in &transports {
        let Some(client) = inner.transports.get_client(name, "initialize") else {
            warn!(transport = %name, "Cannot initialize unregistered transport");
            overall = BackupStatus::TransportAborted;
            if let Some(observer) = &observer {
                observer.on_result(name, BackupStatus::TransportAborted);
            }
            continue;
        };
        let listener = OnTaskFinished::new(&inner, client, "initialize");
        let mut machine = PassStateMachine::new(PassKind::Initialize);
        let _ = machine.transition(PassEvent::BindTransport(name.clone()));
        let _ = machine.transition(PassEvent::Dispatch);

        let status = match listener.client() {
            Some(client) => initialize_one(client).await,
            None => TransportStatus::Error,
        };

        let result = if status.is_ok() {
            info!(transport = %name, "🧹 Transport initialized");
            if let Err(e) = inner.reset_backup_state(name) {
                error!(transport = %name, error = %e, "Unable to reset state after initialization");
            }
            match inner.transports.transport_dir_name(name) {
                Ok(dir_name) => {
                    if let Err(e) = inner.transports.record_init_pending(false, name, &dir_name) {
                        warn!(transport = %name, error = %e, "Unable to clear init-pending state");
                    }
                }
                Err(e) => warn!(transport = %name, error = %e, "Transport vanished during initialization"),
            }
            let _ = machine.transition(PassEvent::Complete);
            BackupStatus::Success
        } else {
            warn!(transport = %name, status = %status, "Transport initialization failed; will retry");
            inner.post_delayed(
                BackupCommand::RunInitialize {
                    transports: vec![name.clone()],
                    observer: None,
                },
                inner.config.transport_retry_interval(),
            );
            let _ = machine.transition(PassEvent::Fail(status.to_string()));
            overall = BackupStatus::TransportAborted;
            BackupStatus::TransportAborted
        };

        if let Some(observer) = &observer {
            observer.on_result(name, result);
        }
        listener.finish();
    }

    if let Some(observer) = &observer {
        observer.backup_finished(overall);
    }
    inner.collaborators.wake_lock.release();
}

async fn initialize_one(client: &TransportClient) -> TransportStatus {
    match client.transport().initialize_device().await {
        Ok(TransportStatus::Ok) => {}
        Ok(other) => return other,
        Err(e) => {
            warn!(transport = %client.transport_name(), error = %e, "initialize_device failed");
            return TransportStatus::Error;
        }
    }
    match client.transport().finish_backup().await {
        Ok(status) => status,
        Err(e) => {
            warn!(transport = %client.transport_name(), error = %e, "finish_backup after initialize failed");
            TransportStatus::Error
        }
    }
}

/// Erase one package's data on the transport
pub(crate) async fn run_clear_data(
    inner: Weak<OrchestratorInner>,
    listener: OnTaskFinished,
    package: String,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.collaborators.wake_lock.acquire();
    let mut machine = PassStateMachine::new(PassKind::ClearData);

    if let Some(client) = listener.client() {
        let _ = machine.transition(PassEvent::BindTransport(client.transport_name().to_string()));
        let _ = machine.transition(PassEvent::Dispatch);

        let cleared = match client.transport().clear_backup_data(&package).await {
            Ok(TransportStatus::Ok) => client.transport().finish_backup().await,
            Ok(other) => Ok(other),
            Err(e) => Err(e),
        };
        let outcome = match cleared {
            Ok(TransportStatus::Ok) => {
                let _ = machine.transition(PassEvent::Complete);
                "cleared".to_string()
            }
            Ok(status) => {
                let _ = machine.transition(PassEvent::Fail(status.to_string()));
                status.to_string()
            }
            Err(e) => {
                let _ = machine.transition(PassEvent::Fail(e.to_string()));
                e.to_string()
            }
        };
        log_backup_operation(
            "clear_backup_data",
            Some(&package),
            Some(client.transport_name()),
            &outcome,
            None,
        );
    }

    inner.collaborators.wake_lock.release();
    listener.finish();
}
