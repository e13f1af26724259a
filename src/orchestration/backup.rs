//! Backup-side entry points: data-change signals, key-value passes, caller
//! requests, enable/disable, transport selection and initialization, and
//! package lifecycle signals.

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::commands::{BackupCommand, BackupParams};
use super::core::{BackupOrchestrator, OrchestratorInner};
use super::tasks::{run_clear_data, run_initialize, KeyValueBackupTask, OnTaskFinished, PassControl};
use crate::constants::{files, PACKAGE_MANAGER_SENTINEL};
use crate::error::{BackupError, BackupResult};
use crate::operations::OperationToken;
use crate::platform::{BackupAgent, BackupObserver, BackupStatus, Caller, PackageInfo};
use crate::transport::{BackupTransport, TransportDescription, TransportState};

impl OrchestratorInner {
    /// Packages a caller may mark as changed
    pub(crate) fn data_changed_targets(&self, caller: Caller, package: &str) -> HashSet<String> {
        if !caller.privileged {
            return self
                .participants
                .lock()
                .get(&caller.uid)
                .cloned()
                .unwrap_or_default();
        }
        if package == PACKAGE_MANAGER_SENTINEL {
            HashSet::from([PACKAGE_MANAGER_SENTINEL.to_string()])
        } else {
            self.all_participants()
        }
    }

    pub(crate) fn data_changed_impl(&self, package: &str, targets: &HashSet<String>) {
        let staged = self.queues.lock().pending.record_change(package, targets);
        if staged {
            debug!(package = %package, "Staged for key-value backup");
        }
        self.schedule_key_value_job();
    }

    fn stage_metadata_change(&self) {
        self.post(BackupCommand::DataChanged {
            package: PACKAGE_MANAGER_SENTINEL.to_string(),
            targets: HashSet::from([PACKAGE_MANAGER_SENTINEL.to_string()]),
        });
    }

    /// Drain everything pending into a key-value pass on the current
    /// transport
    pub(crate) fn start_key_value_pass(self: &Arc<Self>) {
        if let Err(reason) = self.policy.check_backup_allowed() {
            info!(reason = %reason, "Key-value pass not allowed");
            return;
        }
        if self.is_backup_running() {
            debug!("Key-value pass already running");
            return;
        }

        let (client, drained) = {
            let mut queues = self.queues.lock();
            if queues.pending.is_empty() {
                debug!("No pending key-value backups");
                return;
            }
            let Some(client) = self.transports.current_client("key-value") else {
                warn!("No transport available; key-value pass postponed");
                drop(queues);
                self.schedule_key_value_job();
                return;
            };
            (client, queues.pending.drain_for_pass())
        };

        let mut packages = drained.packages.clone();
        if !self.transports.has_metadata_state(client.transport_name())
            && !packages.iter().any(|p| p == PACKAGE_MANAGER_SENTINEL)
        {
            packages.insert(0, PACKAGE_MANAGER_SENTINEL.to_string());
        }
        // The metadata pass always goes first
        if let Some(index) = packages.iter().position(|p| p == PACKAGE_MANAGER_SENTINEL) {
            let sentinel = packages.remove(index);
            packages.insert(0, sentinel);
        }

        info!(
            transport = %client.transport_name(),
            packages = packages.len(),
            "🚀 Starting key-value pass"
        );
        self.spawn_key_value_task(client, Some(drained), packages, Vec::new(), None, false);
    }

    pub(crate) fn is_backup_running(&self) -> bool {
        self.running_passes.load(Ordering::SeqCst) > 0
    }

    /// Run a requested backup now, or queue it until the running pass ends
    pub(crate) fn start_requested_pass(self: &Arc<Self>, params: BackupParams) {
        if self.is_backup_running() {
            let mut waiting = self.waiting_requests.lock();
            waiting.push_back(params);
            info!(queued = waiting.len(), "Backup in progress; queueing requested backup");
            return;
        }
        let BackupParams {
            client,
            key_value_packages,
            full_packages,
            observer,
            non_incremental,
        } = params;
        info!(
            transport = %client.transport_name(),
            key_value = key_value_packages.len(),
            full = full_packages.len(),
            "🚀 Starting requested backup"
        );
        self.spawn_key_value_task(
            client,
            None,
            key_value_packages,
            full_packages,
            observer,
            non_incremental,
        );
    }

    pub(crate) fn on_key_value_pass_finished(self: &Arc<Self>) {
        let previous = self
            .running_passes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous > 1 {
            return;
        }
        let next = self.waiting_requests.lock().pop_front();
        if let Some(params) = next {
            debug!(transport = %params.client.transport_name(), "Starting queued requested backup");
            self.start_requested_pass(params);
        }
    }

    fn spawn_key_value_task(
        self: &Arc<Self>,
        client: crate::transport::TransportClient,
        drained: Option<crate::queues::DrainedPass>,
        key_value_packages: Vec<String>,
        full_packages: Vec<String>,
        observer: Option<Arc<dyn BackupObserver>>,
        non_incremental: bool,
    ) -> OperationToken {
        let token = self.tokens.next_token();
        let control = PassControl::new(self.operations.clone());
        self.operations.register_task(token, control.clone());
        self.running_passes.fetch_add(1, Ordering::SeqCst);

        let task = KeyValueBackupTask {
            inner: Arc::downgrade(self),
            listener: OnTaskFinished::new(self, client, "key-value"),
            drained,
            key_value_packages,
            full_packages,
            observer,
            non_incremental,
            token,
            control,
        };
        tokio::spawn(task.run());
        token
    }

    pub(crate) fn start_initialize_pass(
        self: &Arc<Self>,
        transports: Vec<String>,
        observer: Option<Arc<dyn BackupObserver>>,
    ) {
        if transports.is_empty() {
            return;
        }
        info!(transports = ?transports, "🧹 Initializing transports");
        tokio::spawn(run_initialize(Arc::downgrade(self), transports, observer));
    }

    pub(crate) fn start_clear_data_pass(self: &Arc<Self>, transport: String, package: String) {
        match self.transports.get_client(&transport, "clear-data") {
            None => {
                warn!(transport = %transport, package = %package, "Transport unavailable; retrying clear later");
                self.post_delayed(
                    BackupCommand::ClearBackupData { transport, package },
                    self.config.transport_retry_interval(),
                );
            }
            Some(client) => {
                let listener = OnTaskFinished::new(self, client, "clear-data");
                tokio::spawn(run_clear_data(Arc::downgrade(self), listener, package));
            }
        }
    }

    /// Forget everything known about the dataset on `transport_name` and
    /// stage every participant for a fresh backup
    pub(crate) fn reset_backup_state(&self, transport_name: &str) -> BackupResult<()> {
        {
            let mut bookkeeping = self.bookkeeping.lock();
            if let Err(e) = bookkeeping.processed.reset() {
                warn!(error = %e, "Unable to clear processed journal");
            }
            bookkeeping.record.current_token = 0;
            bookkeeping.record.write(&bookkeeping.path)?;
        }

        let state_dir = self.transports.state_dir(transport_name)?;
        if let Ok(entries) = fs::read_dir(&state_dir) {
            for entry in entries.flatten() {
                if entry.file_name() == files::INIT_SENTINEL {
                    continue;
                }
                if entry.file_type().is_ok_and(|t| t.is_file()) {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!(path = %entry.path().display(), error = %e, "Unable to delete transport state file");
                    }
                }
            }
        }

        let mut everyone: Vec<String> = self.all_participants().into_iter().collect();
        everyone.push(PACKAGE_MANAGER_SENTINEL.to_string());
        everyone.sort();
        self.queues.lock().pending.restage(&everyone);
        info!(transport = %transport_name, staged = everyone.len(), "Backup state reset");
        self.schedule_key_value_job();
        Ok(())
    }

    /// Refresh `current_token` for a newly selected transport
    pub(crate) async fn update_state_for_transport(&self, transport_name: &str) {
        let token = match self.transports.get_client(transport_name, "select-transport") {
            Some(client) => {
                let token = match client.transport().current_restore_set().await {
                    Ok(token) => token,
                    Err(e) => {
                        warn!(transport = %transport_name, error = %e, "Unable to read current restore set");
                        0
                    }
                };
                self.transports.dispose_client(&client, "select-transport");
                token
            }
            None => {
                warn!(transport = %transport_name, "Selected transport is not registered");
                0
            }
        };

        let mut bookkeeping = self.bookkeeping.lock();
        bookkeeping.record.current_token = token;
        if let Err(e) = bookkeeping.record.write(&bookkeeping.path) {
            error!(error = %e, "Unable to persist current restore token");
        }
    }
}

impl BackupOrchestrator {
    /// A package reports that its data changed
    pub fn data_changed(&self, caller: Caller, package: &str) -> BackupResult<()> {
        let targets = self.inner.data_changed_targets(caller, package);
        if targets.is_empty() {
            warn!(package = %package, uid = caller.uid, "Data change from non-participant");
            return Ok(());
        }
        self.inner.send(BackupCommand::DataChanged {
            package: package.to_string(),
            targets,
        })
    }

    /// Back up an explicit list of packages now. Long-running failures are
    /// reported only through `observer`.
    pub fn request_backup(
        &self,
        caller: Caller,
        packages: &[String],
        observer: Option<Arc<dyn BackupObserver>>,
        non_incremental: bool,
    ) -> BackupStatus {
        let inner = &self.inner;
        if packages.is_empty() {
            return BackupStatus::NoPackages;
        }
        if !caller.privileged {
            warn!(uid = caller.uid, "Unprivileged backup request refused");
            return BackupStatus::NotAllowed;
        }
        if let Err(reason) = inner.policy.check_backup_allowed() {
            info!(reason = %reason, "Requested backup not allowed");
            return BackupStatus::NotAllowed;
        }
        let Some(client) = inner.transports.current_client("request-backup") else {
            warn!("No transport for requested backup");
            return BackupStatus::TransportAborted;
        };

        let mut key_value_packages = Vec::new();
        let mut full_packages = Vec::new();
        for package in packages {
            if package == PACKAGE_MANAGER_SENTINEL {
                key_value_packages.push(package.clone());
                continue;
            }
            match inner.package_info(package) {
                None => {
                    if let Some(observer) = &observer {
                        observer.on_result(package, BackupStatus::PackageNotFound);
                    }
                }
                Some(info) if info.is_key_value_participant() => {
                    key_value_packages.push(package.clone())
                }
                Some(info) if info.gets_full_backup() => full_packages.push(package.clone()),
                Some(_) => {
                    if let Some(observer) = &observer {
                        observer.on_result(package, BackupStatus::PackageNotEligible);
                    }
                }
            }
        }

        let params = BackupParams {
            client,
            key_value_packages,
            full_packages,
            observer,
            non_incremental,
        };
        match inner.send(BackupCommand::RequestBackup { params }) {
            Ok(()) => BackupStatus::Success,
            Err(e) => {
                error!(error = %e, "Unable to dispatch requested backup");
                BackupStatus::TransportAborted
            }
        }
    }

    /// Scheduler tick for the key-value job
    pub fn run_key_value_pass(&self) -> BackupResult<()> {
        self.inner.send(BackupCommand::RunKeyValueBackup)
    }

    /// Run a key-value pass as soon as possible, unless battery saver says
    /// otherwise
    pub fn backup_now(&self) -> BackupResult<()> {
        if self.inner.policy.battery_saver() {
            info!("🔋 Battery saver on; deferring backup");
            self.inner.schedule_key_value_job();
            return Ok(());
        }
        self.run_key_value_pass()
    }

    /// Cancel every running pass and push both jobs back
    pub fn cancel_backups(&self) {
        let tokens = self.inner.operations.pending_tasks();
        info!(passes = tokens.len(), "Canceling running backups");
        for token in tokens {
            self.inner.operations.cancel(token, true);
        }

        let busy = self.inner.config.busy_backoff_min_ms;
        self.inner
            .collaborators
            .jobs
            .schedule_key_value_job(Duration::from_millis(busy));
        self.inner
            .collaborators
            .jobs
            .schedule_full_backup_job(Duration::from_millis(busy.saturating_mul(2)));
    }

    /// Make `name` the current transport. Returns the previous selection, or
    /// the unchanged current one when a mandatory policy refuses the switch.
    pub async fn select_backup_transport(&self, name: &str) -> Option<String> {
        let inner = &self.inner;
        if !inner.policy.is_transport_allowed(name, &inner.transports) {
            warn!(transport = %name, "Transport selection refused by mandatory policy");
            return inner.transports.current_name();
        }
        let previous = inner.transports.select_current(name);
        inner.update_state_for_transport(name).await;
        previous
    }

    pub fn current_transport(&self) -> Option<String> {
        self.inner.transports.current_name()
    }

    pub fn transport_states(&self) -> Vec<TransportState> {
        self.inner.transports.transport_states()
    }

    /// Register a transport; one left marked for initialization is wiped
    /// after a short delay
    pub fn register_transport(
        &self,
        description: TransportDescription,
        transport: Arc<dyn BackupTransport>,
    ) -> BackupResult<()> {
        let name = description.name.clone();
        let pending_init = self.inner.transports.register(description, transport)?;
        if pending_init {
            self.inner.post_delayed(
                BackupCommand::RunInitialize {
                    transports: vec![name],
                    observer: None,
                },
                Duration::from_millis(self.inner.config.transport_init_delay_ms),
            );
        }
        Ok(())
    }

    pub fn unregister_transport(&self, name: &str) -> bool {
        self.inner.transports.unregister(name)
    }

    pub fn initialize_transports(
        &self,
        transports: Vec<String>,
        observer: Option<Arc<dyn BackupObserver>>,
    ) -> BackupResult<()> {
        self.inner.send(BackupCommand::RunInitialize {
            transports,
            observer,
        })
    }

    pub fn reset_backup_state(&self, transport_name: &str) -> BackupResult<()> {
        self.inner.reset_backup_state(transport_name)
    }

    /// Erase `package`'s data on `transport`
    pub fn clear_backup_data(&self, caller: Caller, transport: &str, package: &str) -> BackupResult<()> {
        let info = self
            .inner
            .package_info(package)
            .ok_or_else(|| BackupError::PackageNotFound(package.to_string()))?;
        if !caller.privileged && caller.uid != info.uid {
            return Err(BackupError::PermissionDenied(format!(
                "uid {} may not clear data of {package}",
                caller.uid
            )));
        }
        self.inner.send(BackupCommand::ClearBackupData {
            transport: transport.to_string(),
            package: package.to_string(),
        })
    }

    pub fn set_backup_enabled(&self, enable: bool) -> BackupResult<()> {
        let inner = &self.inner;
        let previous = inner
            .policy
            .set_enabled(enable)
            .map_err(BackupError::PolicyRejected)?;
        info!(enabled = enable, previous = previous, "Backup enable state changed");

        if enable && !previous {
            inner.schedule_key_value_job();
            inner.schedule_next_full_backup_job(0);
        } else if !enable && previous {
            inner.collaborators.jobs.cancel_key_value_job();
            let names = inner.transports.registered_names();
            for name in &names {
                match inner.transports.transport_dir_name(name) {
                    Ok(dir_name) => {
                        if let Err(e) = inner.transports.record_init_pending(true, name, &dir_name) {
                            warn!(transport = %name, error = %e, "Unable to mark transport for initialization");
                        }
                    }
                    Err(e) => warn!(transport = %name, error = %e, "Transport vanished while disabling"),
                }
            }
            inner.post_delayed(
                BackupCommand::RunInitialize {
                    transports: names,
                    observer: None,
                },
                Duration::from_millis(inner.config.initialization_delay_ms),
            );
        }
        Ok(())
    }

    pub fn is_backup_enabled(&self) -> bool {
        self.inner.policy.is_enabled()
    }

    pub fn set_auto_restore(&self, auto_restore: bool) {
        self.inner.policy.set_auto_restore(auto_restore);
    }

    /// Device setup finished (or was reset); finishing setup arms the jobs
    pub fn set_provisioned(&self, provisioned: bool) {
        let was = self.inner.policy.is_provisioned();
        self.inner.policy.set_provisioned(provisioned);
        if provisioned && !was && self.inner.policy.is_enabled() {
            self.inner.schedule_key_value_job();
            self.inner.schedule_next_full_backup_job(0);
        }
    }

    pub fn set_battery_saver(&self, on: bool) {
        self.inner.policy.set_battery_saver(on);
    }

    pub fn set_mandatory_transport(&self, component: Option<String>) {
        self.inner.policy.set_mandatory_transport(component);
    }

    /// A package was installed, or reinstalled when `replacing`
    pub fn on_package_added(&self, package: &str, replacing: bool) {
        let inner = &self.inner;
        let Some(info) = inner.package_info(package) else {
            debug!(package = %package, "Can't resolve new package");
            return;
        };

        {
            let mut participants = inner.participants.lock();
            if replacing {
                for members in participants.values_mut() {
                    members.remove(package);
                }
            }
            if info.is_key_value_participant() {
                participants
                    .entry(info.uid)
                    .or_default()
                    .insert(package.to_string());
            }
        }
        if info.is_key_value_participant() {
            inner.post(BackupCommand::DataChanged {
                package: package.to_string(),
                targets: HashSet::from([package.to_string()]),
            });
        }

        if info.gets_full_backup() {
            inner.enqueue_full_backup(package, inner.now());
            inner.schedule_next_full_backup_job(0);
        } else {
            inner.queues.lock().full_queue.dequeue(package);
            inner.request_schedule_write();
        }

        inner.stage_metadata_change();
        info!(package = %package, replacing = replacing, "📥 Package added");
    }

    /// A package was uninstalled; when `replacing`, an add follows shortly
    pub fn on_package_removed(&self, package: &str, replacing: bool) {
        let inner = &self.inner;
        if !replacing {
            {
                let mut participants = inner.participants.lock();
                for members in participants.values_mut() {
                    members.remove(package);
                }
                participants.retain(|_, members| !members.is_empty());
            }
            inner.queues.lock().pending.remove(package);
            inner.stage_metadata_change();
        }

        for transport in inner.transports.transports_hosted_by(package) {
            inner.transports.unregister(&transport);
        }
        info!(package = %package, replacing = replacing, "📤 Package removed");
    }

    /// A package's components changed; re-evaluate its participation
    pub fn on_package_changed(&self, package: &str) {
        if self.inner.package_info(package).is_some() {
            self.on_package_added(package, true);
        }
    }

    pub fn is_app_eligible_for_backup(&self, package: &str) -> bool {
        self.inner
            .package_info(package)
            .is_some_and(|info| info.is_eligible_for_backup())
    }

    pub fn filter_apps_eligible_for_backup(&self, packages: &[String]) -> Vec<String> {
        packages
            .iter()
            .filter(|p| self.is_app_eligible_for_backup(p))
            .cloned()
            .collect()
    }

    /// Agent-facing completion entry point
    pub fn op_complete(&self, token: OperationToken, result: i64) {
        self.inner.operations.complete(token, result);
    }

    pub fn agent_connected(
        &self,
        caller: Caller,
        package: &str,
        agent: Arc<dyn BackupAgent>,
    ) -> BackupResult<bool> {
        if !caller.is_system() {
            return Err(BackupError::PermissionDenied(
                "only the system may report agent connections".to_string(),
            ));
        }
        Ok(self.inner.agents.agent_connected(package, agent))
    }

    pub fn agent_disconnected(&self, caller: Caller, package: &str) -> BackupResult<()> {
        if !caller.is_system() {
            return Err(BackupError::PermissionDenied(
                "only the system may report agent disconnections".to_string(),
            ));
        }
        self.inner.agents.agent_disconnected(package);
        Ok(())
    }

    pub fn package_info(&self, package: &str) -> Option<PackageInfo> {
        self.inner.package_info(package)
    }
}
