//! # Restore Coordination
//!
//! Restore sessions, restore-at-install and the restore task itself.
//! At most one session is open at a time and it expires after a period of
//! inactivity. Restores run one at a time; a restore requested while
//! another is in progress waits in a queue.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::commands::{BackupCommand, RestoreParams};
use super::core::{BackupOrchestrator, OrchestratorInner};
use super::tasks::{await_agent, OnTaskFinished};
use crate::constants::PACKAGE_MANAGER_SENTINEL;
use crate::error::{BackupError, BackupResult};
use crate::logging::{log_error, log_restore_operation};
use crate::persistence::{AncestralRecord, ProcessedPackagesJournal};
use crate::platform::{AgentMode, Caller};
use crate::state_machine::{OperationType, PassEvent, PassKind, PassStateMachine};
use crate::transport::{RestoreSet, TransportStatus};

/// Restore tokens and the record of what this device has backed up
pub(crate) struct RestoreBookkeeping {
    pub(crate) record: AncestralRecord,
    pub(crate) processed: ProcessedPackagesJournal,
    pub(crate) path: PathBuf,
}

impl RestoreBookkeeping {
    /// The dataset a restore of `package` should come from; 0 when none
    pub(crate) fn available_restore_token(&self, package: &str) -> u64 {
        if self.record.current_token != 0 && self.processed.has_been_processed(package) {
            return self.record.current_token;
        }
        let in_ancestral = self
            .record
            .ancestral_packages
            .as_ref()
            .map_or(true, |packages| packages.contains(package));
        if in_ancestral {
            self.record.ancestral_token
        } else {
            0
        }
    }
}

struct ActiveSession {
    id: Uuid,
    timeout: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RestoreQueue {
    in_progress: bool,
    waiting: VecDeque<RestoreParams>,
}

pub(crate) struct RestoreCoordinator {
    session: Mutex<Option<ActiveSession>>,
    queue: Mutex<RestoreQueue>,
}

impl RestoreCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            session: Mutex::new(None),
            queue: Mutex::new(RestoreQueue::default()),
        }
    }

    pub(crate) fn has_active_session(&self) -> bool {
        self.session.lock().is_some()
    }

    pub(crate) fn is_session(&self, id: Uuid) -> bool {
        self.session.lock().as_ref().is_some_and(|s| s.id == id)
    }

    pub(crate) fn is_restore_in_progress(&self) -> bool {
        self.queue.lock().in_progress
    }

    fn try_open(&self, id: Uuid) -> bool {
        let mut session = self.session.lock();
        if session.is_some() {
            return false;
        }
        *session = Some(ActiveSession { id, timeout: None });
        true
    }

    /// Install a new inactivity timer for session `id`; aborted on mismatch
    fn replace_timeout(&self, id: Uuid, timeout: Option<JoinHandle<()>>) {
        let mut session = self.session.lock();
        match session.as_mut() {
            Some(active) if active.id == id => {
                if let Some(old) = std::mem::replace(&mut active.timeout, timeout) {
                    old.abort();
                }
            }
            _ => {
                if let Some(timeout) = timeout {
                    timeout.abort();
                }
            }
        }
    }

    /// Close session `id`; a stale id leaves the current session alone
    pub(crate) fn clear_session(&self, id: Uuid) -> bool {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| s.id == id) {
            if let Some(timeout) = session.take().and_then(|s| s.timeout) {
                timeout.abort();
            }
            true
        } else {
            false
        }
    }

    pub(crate) fn expire_session(&self, id: Uuid) {
        if self.clear_session(id) {
            info!(session = %id, "⏰ Restore session timed out");
        } else {
            debug!(session = %id, "Stale restore session timeout ignored");
        }
    }
}

impl OrchestratorInner {
    pub(crate) fn get_available_restore_token(&self, package: &str) -> u64 {
        self.bookkeeping.lock().available_restore_token(package)
    }

    pub(crate) fn arm_restore_timeout(&self, session_id: Uuid) {
        let handle = self.post_delayed(
            BackupCommand::RestoreSessionTimeout { session_id },
            self.config.restore_agent_timeout(),
        );
        self.restore.replace_timeout(session_id, Some(handle));
    }

    /// Run `params` now, or queue it behind the restore in progress
    pub(crate) fn start_or_queue_restore(self: &Arc<Self>, params: RestoreParams) {
        if let Some(session_id) = params.session_id {
            // No inactivity expiry while the session's restore is running
            self.restore.replace_timeout(session_id, None);
        }
        {
            let mut queue = self.restore.queue.lock();
            if queue.in_progress {
                info!(packages = params.packages.len(), "Restore in progress; queueing");
                queue.waiting.push_back(params);
                return;
            }
            queue.in_progress = true;
        }
        tokio::spawn(run_restore(Arc::downgrade(self), params));
    }

    pub(crate) fn on_restore_finished(self: &Arc<Self>, session_id: Option<Uuid>) {
        if let Some(session_id) = session_id {
            if self.restore.is_session(session_id) {
                self.arm_restore_timeout(session_id);
            }
        }

        let next = {
            let mut queue = self.restore.queue.lock();
            let next = queue.waiting.pop_front();
            if next.is_none() {
                queue.in_progress = false;
            }
            next
        };
        if let Some(params) = next {
            debug!(packages = params.packages.len(), "Starting queued restore");
            tokio::spawn(run_restore(Arc::downgrade(self), params));
        }
    }
}

async fn run_restore(inner: Weak<OrchestratorInner>, params: RestoreParams) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let RestoreParams {
        client,
        restore_token,
        packages,
        install_token,
        record_ancestral,
        session_id,
    } = params;

    inner.collaborators.wake_lock.acquire();
    let transport_name = client.transport_name().to_string();
    let listener = OnTaskFinished::new(&inner, client, "restore");
    let mut machine = PassStateMachine::new(PassKind::Restore);
    let _ = machine.transition(PassEvent::BindTransport(transport_name.clone()));
    let _ = machine.transition(PassEvent::Dispatch);

    log_restore_operation(
        "restore",
        packages.first().map(String::as_str).filter(|_| packages.len() == 1),
        Some(restore_token),
        "started",
        Some(&format!("{} packages", packages.len())),
    );

    let mut restored = 0usize;
    let outcome = match listener.client() {
        None => Err("transport lease already returned".to_string()),
        Some(client) => match client.transport().start_restore(restore_token, &packages).await {
            Ok(TransportStatus::Ok) => {
                for package in &packages {
                    if package == PACKAGE_MANAGER_SENTINEL {
                        continue;
                    }
                    let Some(info) = inner.package_info(package) else {
                        debug!(package = %package, "Package not installed; skipping restore");
                        continue;
                    };
                    let Some(agent) = inner
                        .agents
                        .bind(&info, AgentMode::Restore, inner.config.agent_bind_timeout())
                        .await
                    else {
                        warn!(package = %package, "Unable to bind restore agent");
                        continue;
                    };

                    let acknowledged = await_agent(
                        &inner,
                        None,
                        OperationType::RestoreWait,
                        package,
                        inner.config.restore_agent_timeout(),
                        |token| agent.do_restore(token, restore_token),
                    )
                    .await;
                    inner.agents.tear_down(&info);

                    if acknowledged {
                        restored += 1;
                    }
                    log_restore_operation(
                        "restore_package",
                        Some(package),
                        Some(restore_token),
                        if acknowledged { "restored" } else { "agent_failure" },
                        None,
                    );
                }
                if let Err(e) = client.transport().finish_restore().await {
                    warn!(transport = %transport_name, error = %e, "finish_restore failed");
                }
                Ok(())
            }
            Ok(status) => Err(format!("start_restore returned {status}")),
            Err(e) => Err(e.to_string()),
        },
    };

    match &outcome {
        Ok(()) => {
            let _ = machine.transition(PassEvent::Complete);
            if record_ancestral {
                let mut bookkeeping = inner.bookkeeping.lock();
                bookkeeping.record.ancestral_token = restore_token;
                bookkeeping.record.ancestral_packages =
                    Some(packages.iter().cloned().collect::<HashSet<_>>());
                if let Err(e) = bookkeeping.record.write(&bookkeeping.path) {
                    log_error("restore", "record_ancestral", &e.to_string(), None);
                }
            }
        }
        Err(reason) => {
            warn!(transport = %transport_name, reason = %reason, "Restore failed");
            let _ = machine.transition(PassEvent::Fail(reason.clone()));
        }
    }

    log_restore_operation(
        "restore",
        None,
        Some(restore_token),
        &machine.current_state().to_string(),
        Some(&format!("{restored} of {} packages restored", packages.len())),
    );

    if let Some(install_token) = install_token {
        inner
            .collaborators
            .installer
            .finish_package_install(install_token, true);
    }
    inner.collaborators.wake_lock.release();
    listener.finish();
    inner.post(BackupCommand::RestoreFinished { session_id });
}

/// Handle to an open restore session. Every call after `end` (or after the
/// session timed out) fails.
#[derive(Debug, Clone)]
pub struct RestoreSession {
    id: Uuid,
    package: Option<String>,
    transport_name: String,
    inner: Weak<OrchestratorInner>,
}

impl RestoreSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    /// Package the session is limited to, if any
    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.restore.is_session(self.id))
    }

    fn live(&self) -> BackupResult<Arc<OrchestratorInner>> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| BackupError::OrchestrationError("orchestrator has shut down".into()))?;
        if !inner.restore.is_session(self.id) {
            return Err(BackupError::StateTransitionError(format!(
                "restore session {} has ended",
                self.id
            )));
        }
        Ok(inner)
    }

    /// Datasets the session's transport can restore from
    pub async fn available_restore_sets(&self) -> BackupResult<Vec<RestoreSet>> {
        let inner = self.live()?;
        let client = inner
            .transports
            .get_client(&self.transport_name, "restore-session")
            .ok_or_else(|| BackupError::TransportNotRegistered(self.transport_name.clone()))?;
        let sets = client.transport().restore_sets().await;
        inner.transports.dispose_client(&client, "restore-session");
        inner.arm_restore_timeout(self.id);
        Ok(sets?)
    }

    /// Restore one package from whichever dataset holds it
    pub fn restore_package(&self, package: &str) -> BackupResult<()> {
        let inner = self.live()?;
        if self.package.as_deref().is_some_and(|p| p != package) {
            return Err(BackupError::PermissionDenied(format!(
                "session is limited to {}",
                self.package.as_deref().unwrap_or_default()
            )));
        }
        let restore_token = inner.get_available_restore_token(package);
        if restore_token == 0 {
            return Err(BackupError::OrchestrationError(format!(
                "no restore set available for {package}"
            )));
        }
        self.submit(&inner, restore_token, vec![package.to_string()], false)
    }

    /// Restore `packages` (every eligible installed package when empty) from
    /// `restore_token`, adopting it as the device's ancestral dataset
    pub fn restore_all(&self, restore_token: u64, packages: &[String]) -> BackupResult<()> {
        let inner = self.live()?;
        if self.package.is_some() {
            return Err(BackupError::PermissionDenied(
                "single-package session cannot restore everything".to_string(),
            ));
        }
        let packages = if packages.is_empty() {
            let mut all: Vec<String> = inner
                .collaborators
                .packages
                .installed_packages()
                .into_iter()
                .filter(|info| info.is_eligible_for_backup())
                .map(|info| info.package_name)
                .collect();
            all.sort();
            all.insert(0, PACKAGE_MANAGER_SENTINEL.to_string());
            all
        } else {
            packages.to_vec()
        };
        self.submit(&inner, restore_token, packages, true)
    }

    fn submit(
        &self,
        inner: &OrchestratorInner,
        restore_token: u64,
        packages: Vec<String>,
        record_ancestral: bool,
    ) -> BackupResult<()> {
        let client = inner
            .transports
            .get_client(&self.transport_name, "restore-session")
            .ok_or_else(|| BackupError::TransportNotRegistered(self.transport_name.clone()))?;
        inner.send(BackupCommand::StartRestore {
            params: RestoreParams {
                client,
                restore_token,
                packages,
                install_token: None,
                record_ancestral,
                session_id: Some(self.id),
            },
        })
    }

    /// Close the session
    pub fn end(&self) {
        if let Some(inner) = self.inner.upgrade() {
            if inner.restore.clear_session(self.id) {
                info!(session = %self.id, "Restore session ended");
            }
        }
    }
}

impl BackupOrchestrator {
    /// Dataset a restore of `package` would come from; 0 when none
    pub fn get_available_restore_token(&self, package: &str) -> u64 {
        self.inner.get_available_restore_token(package)
    }

    /// Open a restore session, or `None` while another session is open or a
    /// backup is running.
    ///
    /// A caller restoring its own package from the current transport needs
    /// no privilege.
    pub fn begin_restore_session(
        &self,
        caller: Caller,
        package: Option<&str>,
        transport: Option<&str>,
    ) -> BackupResult<Option<RestoreSession>> {
        let inner = &self.inner;
        let current = inner.transports.current_name();
        let transport_name = transport
            .map(str::to_string)
            .or_else(|| current.clone())
            .ok_or_else(|| BackupError::TransportNotRegistered("no transport selected".into()))?;

        let mut needs_privilege = true;
        if let Some(package) = package {
            let info = inner
                .package_info(package)
                .ok_or_else(|| BackupError::PackageNotFound(package.to_string()))?;
            if info.uid == caller.uid && current.as_deref() == Some(transport_name.as_str()) {
                needs_privilege = false;
            }
        }
        if needs_privilege && !caller.privileged {
            return Err(BackupError::PermissionDenied(format!(
                "uid {} may not open this restore session",
                caller.uid
            )));
        }

        if inner.is_backup_running() || inner.operations.is_backup_in_progress() {
            info!("Backup in progress; refusing restore session");
            return Ok(None);
        }
        let id = Uuid::new_v4();
        if !inner.restore.try_open(id) {
            info!("Restore session already active");
            return Ok(None);
        }
        inner.arm_restore_timeout(id);

        log_restore_operation("begin_session", package, None, "opened", Some(&transport_name));
        Ok(Some(RestoreSession {
            id,
            package: package.map(str::to_string),
            transport_name,
            inner: Arc::downgrade(inner),
        }))
    }

    /// Restore a freshly installed package's data before first launch. The
    /// installer is always told whether a restore was launched.
    pub fn restore_at_install(&self, caller: Caller, package: &str, install_token: i32) -> BackupResult<()> {
        if !caller.privileged {
            return Err(BackupError::PermissionDenied(
                "restore at install requires the backup capability".to_string(),
            ));
        }
        let inner = &self.inner;
        let restore_token = inner.get_available_restore_token(package);
        let skip = restore_token == 0 || !inner.policy.auto_restore() || !inner.policy.is_provisioned();
        let client = if skip {
            None
        } else {
            inner.transports.current_client("restore-at-install")
        };

        let Some(client) = client else {
            debug!(package = %package, restore_token = restore_token, "Skipping restore at install");
            inner
                .collaborators
                .installer
                .finish_package_install(install_token, false);
            return Ok(());
        };

        let params = RestoreParams {
            client,
            restore_token,
            packages: vec![package.to_string()],
            install_token: Some(install_token),
            record_ancestral: false,
            session_id: None,
        };
        if let Err(e) = inner.send(BackupCommand::StartRestore { params }) {
            error!(package = %package, error = %e, "Unable to start restore at install");
            inner
                .collaborators
                .installer
                .finish_package_install(install_token, false);
            return Err(e);
        }
        Ok(())
    }
}
