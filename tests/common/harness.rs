//! A started orchestrator wired to fakes over a temporary state directory.

use backup_core::config::BackupConfig;
use backup_core::platform::{Collaborators, PackageInfo};
use backup_core::transport::TransportDescription;
use backup_core::{BackupOrchestrator, ManualClock, OrchestratorSnapshot};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::fakes::{
    CountingWakeLock, FakeAgentHost, FakeCatalog, FakeTransport, RecordingInstaller, RecordingJobs,
};

pub const LOCAL_TRANSPORT: &str = "local";
pub const LOCAL_COMPONENT: &str = "com.example.transport/.LocalTransport";
pub const START_MILLIS: i64 = 1_700_000_000_000;

pub struct Harness {
    pub dir: TempDir,
    pub orchestrator: BackupOrchestrator,
    pub catalog: Arc<FakeCatalog>,
    pub host: Arc<FakeAgentHost>,
    pub transport: Arc<FakeTransport>,
    pub jobs: Arc<RecordingJobs>,
    pub wake_lock: Arc<CountingWakeLock>,
    pub installer: Arc<RecordingInstaller>,
    pub clock: Arc<ManualClock>,
}

/// Configuration with timeouts short enough for tests to observe expiry
pub fn test_config(base: &Path) -> BackupConfig {
    BackupConfig {
        agent_bind_timeout_ms: 500,
        key_value_agent_timeout_ms: 5_000,
        full_backup_agent_timeout_ms: 5_000,
        restore_agent_timeout_ms: 5_000,
        initialization_delay_ms: 10,
        transport_init_delay_ms: 10,
        ..BackupConfig::with_base_dir(base)
    }
}

impl Harness {
    pub async fn start(packages: Vec<PackageInfo>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        Self::start_with(dir, config, packages).await
    }

    pub async fn start_with(dir: TempDir, config: BackupConfig, packages: Vec<PackageInfo>) -> Self {
        let catalog = Arc::new(FakeCatalog::new(packages));
        let host = Arc::new(FakeAgentHost::default());
        let jobs = Arc::new(RecordingJobs::default());
        let wake_lock = Arc::new(CountingWakeLock::default());
        let installer = Arc::new(RecordingInstaller::default());
        let clock = Arc::new(ManualClock::new(START_MILLIS));

        let collaborators = Collaborators {
            packages: catalog.clone(),
            agents: host.clone(),
            installer: installer.clone(),
            wake_lock: wake_lock.clone(),
            jobs: jobs.clone(),
            clock: clock.clone(),
        };
        let orchestrator = BackupOrchestrator::start(config, collaborators)
            .await
            .unwrap();
        host.attach(orchestrator.clone());

        Self {
            dir,
            orchestrator,
            catalog,
            host,
            transport: Arc::new(FakeTransport::new(77)),
            jobs,
            wake_lock,
            installer,
            clock,
        }
    }

    /// Register and select the fake transport
    pub async fn with_transport(self) -> Self {
        self.orchestrator
            .register_transport(
                TransportDescription::new(LOCAL_TRANSPORT, LOCAL_COMPONENT, "local"),
                self.transport.clone(),
            )
            .unwrap();
        self.orchestrator
            .select_backup_transport(LOCAL_TRANSPORT)
            .await;
        self
    }

    /// Provision the device and switch backup on
    pub fn enable(&self) {
        self.orchestrator.set_provisioned(true);
        self.orchestrator.set_backup_enabled(true).unwrap();
    }

    /// Pretend a metadata pass already completed on the local transport
    pub fn mark_metadata_backed_up(&self) {
        let path = self
            .orchestrator
            .transports()
            .metadata_state_file(LOCAL_TRANSPORT)
            .unwrap();
        std::fs::write(path, b"state").unwrap();
    }

    pub async fn snapshot(&self) -> OrchestratorSnapshot {
        self.orchestrator.snapshot().await.unwrap()
    }

    /// Poll snapshots until one satisfies `condition`, returning it
    pub async fn wait_for_snapshot<F>(&self, what: &str, condition: F) -> OrchestratorSnapshot
    where
        F: Fn(&OrchestratorSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = self.snapshot().await;
            if condition(&snapshot) {
                return snapshot;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop the control loop and break the host's reference cycle
    pub async fn shutdown(self) -> TempDir {
        self.host.detach();
        self.orchestrator.shutdown().await.unwrap();
        self.dir
    }
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn kv_package(name: &str, uid: u32) -> PackageInfo {
    PackageInfo::new(name, uid).with_backup_agent()
}

pub fn full_package(name: &str, uid: u32) -> PackageInfo {
    PackageInfo::new(name, uid)
}
