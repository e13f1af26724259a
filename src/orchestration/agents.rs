//! Agent binding: ask the host to bring an agent up and wait, bounded, for
//! it to connect. Only one bind is outstanding at a time.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::constants::FIRST_APPLICATION_UID;
use crate::platform::{AgentHost, AgentMode, BackupAgent, PackageInfo};

struct PendingBind {
    package: String,
    connected: oneshot::Sender<Arc<dyn BackupAgent>>,
}

pub(crate) struct AgentConnector {
    host: Arc<dyn AgentHost>,
    confirmation_ui_package: String,
    pending: Mutex<Option<PendingBind>>,
    /// Held for a whole bind and its wait
    bind_lock: AsyncMutex<()>,
}

impl AgentConnector {
    pub(crate) fn new(host: Arc<dyn AgentHost>, confirmation_ui_package: String) -> Self {
        Self {
            host,
            confirmation_ui_package,
            pending: Mutex::new(None),
            bind_lock: AsyncMutex::new(()),
        }
    }

    /// Bind the agent for `package`, waiting at most `timeout` once the host
    /// has been asked. A bind started while another is outstanding waits for
    /// it to connect or expire. On expiry the half-established bind is
    /// abandoned on both sides.
    pub(crate) async fn bind(
        &self,
        package: &PackageInfo,
        mode: AgentMode,
        timeout: Duration,
    ) -> Option<Arc<dyn BackupAgent>> {
        let _serial = self.bind_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingBind {
            package: package.package_name.clone(),
            connected: tx,
        });

        if !self.host.bind_backup_agent(package, mode) {
            warn!(package = %package.package_name, mode = %mode, "Agent bind refused");
            self.pending.lock().take();
            return None;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(agent)) => {
                debug!(package = %package.package_name, mode = %mode, "Agent connected");
                Some(agent)
            }
            Ok(Err(_)) => {
                warn!(package = %package.package_name, "Agent disconnected before binding completed");
                None
            }
            Err(_) => {
                warn!(
                    package = %package.package_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "⏰ Timed out binding agent"
                );
                let mut pending = self.pending.lock();
                if pending
                    .as_ref()
                    .is_some_and(|p| p.package == package.package_name)
                {
                    pending.take();
                }
                drop(pending);
                self.host.clear_pending_backup();
                None
            }
        }
    }

    /// Host callback: the agent for `package` is up
    pub(crate) fn agent_connected(&self, package: &str, agent: Arc<dyn BackupAgent>) -> bool {
        let mut pending = self.pending.lock();
        match pending.take() {
            Some(bind) if bind.package == package => {
                info!(package = %package, "🔌 Agent connected");
                bind.connected.send(agent).is_ok()
            }
            other => {
                *pending = other;
                warn!(package = %package, "Unexpected agent connection ignored");
                false
            }
        }
    }

    /// Host callback: the agent for `package` went away
    pub(crate) fn agent_disconnected(&self, package: &str) {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.package == package) {
            // Dropping the sender wakes the waiter with a failure
            pending.take();
            warn!(package = %package, "Agent disconnected while binding");
        }
    }

    /// Unbind the agent, and kill its process unless it is a system process
    /// or the confirmation UI
    pub(crate) fn tear_down(&self, package: &PackageInfo) {
        self.host.unbind_backup_agent(package);
        if package.uid >= FIRST_APPLICATION_UID
            && package.package_name != self.confirmation_ui_package
        {
            debug!(package = %package.package_name, "Killing agent process");
            self.host.kill_application_process(package);
        } else {
            debug!(package = %package.package_name, "Not killing process after agent session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::OperationToken;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHost {
        binds: AtomicUsize,
        kills: AtomicUsize,
        unbinds: AtomicUsize,
        cleared: AtomicUsize,
    }

    impl AgentHost for CountingHost {
        fn bind_backup_agent(&self, _: &PackageInfo, _: AgentMode) -> bool {
            self.binds.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn unbind_backup_agent(&self, _: &PackageInfo) {
            self.unbinds.fetch_add(1, Ordering::SeqCst);
        }
        fn kill_application_process(&self, _: &PackageInfo) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
        fn clear_pending_backup(&self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct IdleAgent;

    impl BackupAgent for IdleAgent {
        fn do_backup(&self, _: OperationToken, _: bool) {}
        fn do_full_backup(&self, _: OperationToken) {}
        fn do_restore(&self, _: OperationToken, _: u64) {}
    }

    fn connector(host: Arc<CountingHost>) -> Arc<AgentConnector> {
        Arc::new(AgentConnector::new(host, "com.android.backupconfirm".to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_timeout_clears_pending_state() {
        let host = Arc::new(CountingHost::default());
        let connector = connector(host.clone());
        let info = PackageInfo::new("com.slow", 10_010);

        let agent = connector
            .bind(&info, AgentMode::Full, Duration::from_secs(10))
            .await;

        assert!(agent.is_none());
        assert_eq!(host.cleared.load(Ordering::SeqCst), 1);
        // A late connection finds nobody waiting
        assert!(!connector.agent_connected("com.slow", Arc::new(IdleAgent)));
    }

    #[tokio::test]
    async fn test_connection_completes_bind() {
        let host = Arc::new(CountingHost::default());
        let connector = connector(host.clone());
        let info = PackageInfo::new("com.fast", 10_011);

        let waiter = {
            let connector = connector.clone();
            let info = info.clone();
            tokio::spawn(async move {
                connector
                    .bind(&info, AgentMode::Incremental, Duration::from_secs(60))
                    .await
                    .is_some()
            })
        };
        while !connector.agent_connected("com.fast", Arc::new(IdleAgent)) {
            tokio::task::yield_now().await;
        }
        assert!(waiter.await.unwrap());
        assert_eq!(host.binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overlapping_binds_are_served_in_turn() {
        let host = Arc::new(CountingHost::default());
        let connector = connector(host.clone());

        let spawn_bind = |package: &str, uid: u32| {
            let connector = connector.clone();
            let info = PackageInfo::new(package, uid);
            tokio::spawn(async move {
                connector
                    .bind(&info, AgentMode::Incremental, Duration::from_secs(60))
                    .await
                    .is_some()
            })
        };

        let first = spawn_bind("com.a", 10_030);
        while host.binds.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let second = spawn_bind("com.b", 10_031);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // The second bind has not reached the host while the first is open
        assert_eq!(host.binds.load(Ordering::SeqCst), 1);
        assert!(!connector.agent_connected("com.b", Arc::new(IdleAgent)));

        assert!(connector.agent_connected("com.a", Arc::new(IdleAgent)));
        assert!(first.await.unwrap());

        while !connector.agent_connected("com.b", Arc::new(IdleAgent)) {
            tokio::task::yield_now().await;
        }
        assert!(second.await.unwrap());
        assert_eq!(host.binds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connection_for_other_package_is_ignored() {
        let host = Arc::new(CountingHost::default());
        let connector = connector(host);
        assert!(!connector.agent_connected("com.nobody", Arc::new(IdleAgent)));
    }

    #[test]
    fn test_confirmation_ui_is_never_killed() {
        let host = Arc::new(CountingHost::default());
        let connector = AgentConnector::new(host.clone(), "com.android.backupconfirm".to_string());

        connector.tear_down(&PackageInfo::new("com.android.backupconfirm", 10_020));
        connector.tear_down(&PackageInfo::new("android.system", 1_000));
        assert_eq!(host.kills.load(Ordering::SeqCst), 0);

        connector.tear_down(&PackageInfo::new("com.app", 10_021));
        assert_eq!(host.kills.load(Ordering::SeqCst), 1);
        assert_eq!(host.unbinds.load(Ordering::SeqCst), 3);
    }
}
