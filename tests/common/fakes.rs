//! In-memory stand-ins for every platform collaborator and a scriptable
//! transport.

use async_trait::async_trait;
use backup_core::operations::OperationToken;
use backup_core::platform::{
    AgentHost, AgentMode, BackupAgent, BackupObserver, BackupStatus, InstallObserver, JobScheduler,
    PackageCatalog, PackageInfo, WakeLock,
};
use backup_core::transport::{
    BackupTransport, RestoreSet, TransportError, TransportResult, TransportStatus,
};
use backup_core::{BackupOrchestrator, Caller};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct FakeCatalog {
    packages: Mutex<HashMap<String, PackageInfo>>,
    foreground: Mutex<HashSet<u32>>,
}

impl FakeCatalog {
    pub fn new(packages: Vec<PackageInfo>) -> Self {
        let catalog = Self::default();
        for info in packages {
            catalog.add(info);
        }
        catalog
    }

    pub fn add(&self, info: PackageInfo) {
        self.packages.lock().insert(info.package_name.clone(), info);
    }

    pub fn remove(&self, package: &str) {
        self.packages.lock().remove(package);
    }

    pub fn set_foreground(&self, uid: u32, foreground: bool) {
        let mut set = self.foreground.lock();
        if foreground {
            set.insert(uid);
        } else {
            set.remove(&uid);
        }
    }
}

impl PackageCatalog for FakeCatalog {
    fn package_info(&self, package: &str) -> Option<PackageInfo> {
        self.packages.lock().get(package).cloned()
    }

    fn installed_packages(&self) -> Vec<PackageInfo> {
        let mut all: Vec<PackageInfo> = self.packages.lock().values().cloned().collect();
        all.sort_by(|a, b| a.package_name.cmp(&b.package_name));
        all
    }

    fn is_foreground(&self, uid: u32) -> bool {
        self.foreground.lock().contains(&uid)
    }
}

/// What an agent did when asked to work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Backup { package: String, non_incremental: bool },
    FullBackup { package: String },
    Restore { package: String, restore_token: u64 },
}

struct FakeAgent {
    package: String,
    orchestrator: BackupOrchestrator,
    respond: bool,
    calls: Arc<Mutex<Vec<AgentCall>>>,
}

impl FakeAgent {
    fn finish(&self, token: OperationToken) {
        if self.respond {
            self.orchestrator.op_complete(token, 0);
        }
    }
}

impl BackupAgent for FakeAgent {
    fn do_backup(&self, token: OperationToken, non_incremental: bool) {
        self.calls.lock().push(AgentCall::Backup {
            package: self.package.clone(),
            non_incremental,
        });
        self.finish(token);
    }

    fn do_full_backup(&self, token: OperationToken) {
        self.calls.lock().push(AgentCall::FullBackup {
            package: self.package.clone(),
        });
        self.finish(token);
    }

    fn do_restore(&self, token: OperationToken, restore_token: u64) {
        self.calls.lock().push(AgentCall::Restore {
            package: self.package.clone(),
            restore_token,
        });
        self.finish(token);
    }
}

/// Brings agents up immediately by calling back into the orchestrator.
/// Agents answer at once unless their package was made silent.
#[derive(Default)]
pub struct FakeAgentHost {
    orchestrator: Mutex<Option<BackupOrchestrator>>,
    silent: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    pub calls: Arc<Mutex<Vec<AgentCall>>>,
    pub binds: Mutex<Vec<(String, AgentMode)>>,
    pub kills: Mutex<Vec<String>>,
    pub unbinds: AtomicUsize,
    pub cleared_binds: AtomicUsize,
}

impl FakeAgentHost {
    pub fn attach(&self, orchestrator: BackupOrchestrator) {
        *self.orchestrator.lock() = Some(orchestrator);
    }

    pub fn detach(&self) {
        self.orchestrator.lock().take();
    }

    /// The package's agent accepts work but never reports back
    pub fn make_silent(&self, package: &str) {
        self.silent.lock().insert(package.to_string());
    }

    /// The package's agent never connects
    pub fn make_unreachable(&self, package: &str) {
        self.unreachable.lock().insert(package.to_string());
    }

    pub fn agent_calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }
}

impl AgentHost for FakeAgentHost {
    fn bind_backup_agent(&self, package: &PackageInfo, mode: AgentMode) -> bool {
        self.binds.lock().push((package.package_name.clone(), mode));
        if self.unreachable.lock().contains(&package.package_name) {
            return true;
        }
        let Some(orchestrator) = self.orchestrator.lock().clone() else {
            return false;
        };
        let agent = Arc::new(FakeAgent {
            package: package.package_name.clone(),
            orchestrator: orchestrator.clone(),
            respond: !self.silent.lock().contains(&package.package_name),
            calls: self.calls.clone(),
        });
        orchestrator
            .agent_connected(Caller::system(), &package.package_name, agent)
            .unwrap_or(false)
    }

    fn unbind_backup_agent(&self, _package: &PackageInfo) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }

    fn kill_application_process(&self, package: &PackageInfo) {
        self.kills.lock().push(package.package_name.clone());
    }

    fn clear_pending_backup(&self) {
        self.cleared_binds.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scriptable transport that records every call
pub struct FakeTransport {
    pub restore_set_token: Mutex<u64>,
    pub restore_sets: Mutex<Vec<RestoreSet>>,
    pub backup_status: Mutex<TransportStatus>,
    pub initialize_status: Mutex<TransportStatus>,
    pub key_value_backups: Mutex<Vec<String>>,
    pub full_backups: Mutex<Vec<String>>,
    pub cleared: Mutex<Vec<String>>,
    pub restores: Mutex<Vec<(u64, Vec<String>)>>,
    pub finish_backups: AtomicUsize,
    pub initializations: AtomicUsize,
    pub finished_restores: AtomicUsize,
}

impl FakeTransport {
    pub fn new(restore_set_token: u64) -> Self {
        Self {
            restore_set_token: Mutex::new(restore_set_token),
            restore_sets: Mutex::new(vec![RestoreSet {
                name: "phone".to_string(),
                device: "device-1".to_string(),
                token: restore_set_token,
            }]),
            backup_status: Mutex::new(TransportStatus::Ok),
            initialize_status: Mutex::new(TransportStatus::Ok),
            key_value_backups: Mutex::new(Vec::new()),
            full_backups: Mutex::new(Vec::new()),
            cleared: Mutex::new(Vec::new()),
            restores: Mutex::new(Vec::new()),
            finish_backups: AtomicUsize::new(0),
            initializations: AtomicUsize::new(0),
            finished_restores: AtomicUsize::new(0),
        }
    }

    pub fn set_backup_status(&self, status: TransportStatus) {
        *self.backup_status.lock() = status;
    }

    pub fn key_value_backups(&self) -> Vec<String> {
        self.key_value_backups.lock().clone()
    }

    pub fn full_backups(&self) -> Vec<String> {
        self.full_backups.lock().clone()
    }
}

#[async_trait]
impl BackupTransport for FakeTransport {
    async fn current_restore_set(&self) -> TransportResult<u64> {
        Ok(*self.restore_set_token.lock())
    }

    async fn restore_sets(&self) -> TransportResult<Vec<RestoreSet>> {
        Ok(self.restore_sets.lock().clone())
    }

    async fn initialize_device(&self) -> TransportResult<TransportStatus> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(*self.initialize_status.lock())
    }

    async fn perform_backup(
        &self,
        package: &str,
        _non_incremental: bool,
    ) -> TransportResult<TransportStatus> {
        let status = *self.backup_status.lock();
        if status.is_ok() {
            self.key_value_backups.lock().push(package.to_string());
        }
        Ok(status)
    }

    async fn perform_full_backup(&self, package: &str) -> TransportResult<TransportStatus> {
        let status = *self.backup_status.lock();
        if status.is_ok() {
            self.full_backups.lock().push(package.to_string());
        }
        Ok(status)
    }

    async fn finish_backup(&self) -> TransportResult<TransportStatus> {
        self.finish_backups.fetch_add(1, Ordering::SeqCst);
        Ok(TransportStatus::Ok)
    }

    async fn clear_backup_data(&self, package: &str) -> TransportResult<TransportStatus> {
        self.cleared.lock().push(package.to_string());
        Ok(TransportStatus::Ok)
    }

    async fn start_restore(
        &self,
        restore_token: u64,
        packages: &[String],
    ) -> TransportResult<TransportStatus> {
        self.restores.lock().push((restore_token, packages.to_vec()));
        Ok(TransportStatus::Ok)
    }

    async fn finish_restore(&self) -> TransportResult<()> {
        self.finished_restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport whose every call fails as if the remote end went away
pub struct DisconnectedTransport;

#[async_trait]
impl BackupTransport for DisconnectedTransport {
    async fn current_restore_set(&self) -> TransportResult<u64> {
        Err(TransportError::Disconnected("gone".to_string()))
    }
    async fn restore_sets(&self) -> TransportResult<Vec<RestoreSet>> {
        Err(TransportError::Disconnected("gone".to_string()))
    }
    async fn initialize_device(&self) -> TransportResult<TransportStatus> {
        Err(TransportError::Disconnected("gone".to_string()))
    }
    async fn perform_backup(&self, _: &str, _: bool) -> TransportResult<TransportStatus> {
        Err(TransportError::Disconnected("gone".to_string()))
    }
    async fn perform_full_backup(&self, _: &str) -> TransportResult<TransportStatus> {
        Err(TransportError::Disconnected("gone".to_string()))
    }
    async fn finish_backup(&self) -> TransportResult<TransportStatus> {
        Err(TransportError::Disconnected("gone".to_string()))
    }
    async fn clear_backup_data(&self, _: &str) -> TransportResult<TransportStatus> {
        Err(TransportError::Disconnected("gone".to_string()))
    }
    async fn start_restore(&self, _: u64, _: &[String]) -> TransportResult<TransportStatus> {
        Err(TransportError::Disconnected("gone".to_string()))
    }
    async fn finish_restore(&self) -> TransportResult<()> {
        Err(TransportError::Disconnected("gone".to_string()))
    }
}

#[derive(Default)]
pub struct RecordingJobs {
    pub key_value: Mutex<Vec<Duration>>,
    pub full: Mutex<Vec<Duration>>,
    pub key_value_cancels: AtomicUsize,
}

impl RecordingJobs {
    pub fn last_key_value(&self) -> Option<Duration> {
        self.key_value.lock().last().copied()
    }

    pub fn last_full(&self) -> Option<Duration> {
        self.full.lock().last().copied()
    }
}

impl JobScheduler for RecordingJobs {
    fn schedule_key_value_job(&self, delay: Duration) {
        self.key_value.lock().push(delay);
    }

    fn cancel_key_value_job(&self) {
        self.key_value_cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn schedule_full_backup_job(&self, delay: Duration) {
        self.full.lock().push(delay);
    }
}

#[derive(Default)]
pub struct CountingWakeLock {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl CountingWakeLock {
    pub fn held(&self) -> bool {
        self.acquired.load(Ordering::SeqCst) > self.released.load(Ordering::SeqCst)
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingInstaller {
    pub finished: Mutex<Vec<(i32, bool)>>,
}

impl InstallObserver for RecordingInstaller {
    fn finish_package_install(&self, install_token: i32, did_launch_restore: bool) {
        self.finished.lock().push((install_token, did_launch_restore));
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub results: Mutex<Vec<(String, BackupStatus)>>,
    pub finished: Mutex<Option<BackupStatus>>,
}

impl RecordingObserver {
    pub fn result_for(&self, package: &str) -> Option<BackupStatus> {
        self.results
            .lock()
            .iter()
            .find(|(p, _)| p == package)
            .map(|(_, status)| *status)
    }

    pub fn finished(&self) -> Option<BackupStatus> {
        *self.finished.lock()
    }
}

impl BackupObserver for RecordingObserver {
    fn on_result(&self, package: &str, status: BackupStatus) {
        self.results.lock().push((package.to_string(), status));
    }

    fn backup_finished(&self, status: BackupStatus) {
        *self.finished.lock() = Some(status);
    }
}
