//! Key-value passes driven through the public orchestrator API.

mod common;

use backup_core::constants::PACKAGE_MANAGER_SENTINEL;
use backup_core::platform::BackupStatus;
use backup_core::transport::TransportStatus;
use backup_core::Caller;
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_data_change_drives_key_value_pass() {
    let h = Harness::start(vec![kv_package("com.a", 10_001)])
        .await
        .with_transport()
        .await;
    h.enable();

    h.orchestrator.data_changed(Caller::system(), "com.a").unwrap();
    h.orchestrator.run_key_value_pass().unwrap();

    wait_until("key-value backup of com.a", || {
        h.transport.key_value_backups().contains(&"com.a".to_string())
    })
    .await;
    wait_until("wake lock released", || {
        h.wake_lock.released.load(Ordering::SeqCst) == 1
    })
    .await;

    // Nothing was ever backed up, so the metadata pass runs first
    assert_eq!(
        h.transport.key_value_backups(),
        vec![PACKAGE_MANAGER_SENTINEL.to_string(), "com.a".to_string()]
    );
    assert_eq!(
        h.host.agent_calls(),
        vec![AgentCall::Backup {
            package: "com.a".to_string(),
            non_incremental: false,
        }]
    );
    assert_eq!(*h.host.kills.lock(), vec!["com.a".to_string()]);
    assert!(h.orchestrator.transports().has_metadata_state(LOCAL_TRANSPORT));
    assert_eq!(h.transport.finish_backups.load(Ordering::SeqCst), 1);

    let snapshot = h.snapshot().await;
    assert!(snapshot.pending_packages.is_empty());
    assert!(!snapshot.backup_running);
    assert_eq!(snapshot.outstanding_leases, 0);
    assert_eq!(snapshot.operations, 0);
    assert_eq!(snapshot.current_token, 77);
    assert!(!h.wake_lock.held());

    // The journal generation consumed by the pass is gone
    let journals = std::fs::read_dir(h.orchestrator.config().journal_dir())
        .unwrap()
        .count();
    assert_eq!(journals, 0);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unprivileged_caller_cannot_stage_other_packages() {
    let h = Harness::start(vec![
        kv_package("com.mine", 10_001),
        kv_package("com.other", 10_002),
    ])
    .await;

    h.orchestrator
        .data_changed(Caller::app(10_001), "com.other")
        .unwrap();
    let snapshot = h.snapshot().await;
    assert!(!snapshot.pending_packages.contains(&"com.other".to_string()));

    h.orchestrator
        .data_changed(Caller::app(10_001), "com.mine")
        .unwrap();
    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.pending_packages, vec!["com.mine".to_string()]);

    // A uid with no participants stages nothing at all
    h.orchestrator
        .data_changed(Caller::app(10_099), "com.mine")
        .unwrap();
    assert_eq!(h.snapshot().await.pending_packages.len(), 1);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabled_gate_leaves_work_pending() {
    let h = Harness::start(vec![kv_package("com.a", 10_001)])
        .await
        .with_transport()
        .await;

    h.orchestrator.data_changed(Caller::system(), "com.a").unwrap();
    h.orchestrator.run_key_value_pass().unwrap();

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.pending_packages, vec!["com.a".to_string()]);
    assert!(!snapshot.backup_running);
    assert!(h.transport.key_value_backups().is_empty());

    // Enabled but not provisioned is still closed
    h.orchestrator.set_backup_enabled(true).unwrap();
    h.orchestrator.run_key_value_pass().unwrap();
    assert_eq!(h.snapshot().await.pending_packages.len(), 1);
    assert_eq!(h.wake_lock.acquired.load(Ordering::SeqCst), 0);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_backup_immediate_statuses() {
    let h = Harness::start(vec![kv_package("com.a", 10_001)]).await;
    let packages = vec!["com.a".to_string()];

    assert_eq!(
        h.orchestrator.request_backup(Caller::system(), &[], None, false),
        BackupStatus::NoPackages
    );
    assert_eq!(
        h.orchestrator
            .request_backup(Caller::app(10_001), &packages, None, false),
        BackupStatus::NotAllowed
    );
    assert_eq!(
        h.orchestrator
            .request_backup(Caller::system(), &packages, None, false),
        BackupStatus::NotAllowed
    );

    h.enable();
    assert_eq!(
        h.orchestrator
            .request_backup(Caller::system(), &packages, None, false),
        BackupStatus::TransportAborted
    );
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requested_backup_reports_per_package() {
    let h = Harness::start(vec![
        kv_package("com.a", 10_001),
        full_package("com.full", 10_002),
    ])
    .await
    .with_transport()
    .await;
    h.enable();

    let observer = Arc::new(RecordingObserver::default());
    let packages = vec![
        "com.a".to_string(),
        "com.full".to_string(),
        "com.missing".to_string(),
    ];
    let status = h
        .orchestrator
        .request_backup(Caller::system(), &packages, Some(observer.clone()), true);
    assert_eq!(status, BackupStatus::Success);
    assert_eq!(
        observer.result_for("com.missing"),
        Some(BackupStatus::PackageNotFound)
    );

    wait_until("requested pass to finish", || observer.finished().is_some()).await;

    assert_eq!(observer.finished(), Some(BackupStatus::Success));
    assert_eq!(observer.result_for("com.a"), Some(BackupStatus::Success));
    assert_eq!(observer.result_for("com.full"), Some(BackupStatus::Success));
    assert_eq!(h.transport.key_value_backups(), vec!["com.a".to_string()]);
    assert_eq!(h.transport.full_backups(), vec!["com.full".to_string()]);
    assert!(h.host.agent_calls().contains(&AgentCall::Backup {
        package: "com.a".to_string(),
        non_incremental: true,
    }));

    // A successful requested full backup moves the package's schedule forward
    let snapshot = h.snapshot().await;
    let entry = snapshot
        .full_backup_queue
        .iter()
        .find(|e| e.package_name == "com.full")
        .unwrap();
    assert_eq!(entry.last_backup, START_MILLIS);
    assert_eq!(snapshot.outstanding_leases, 0);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_requests_run_one_pass_at_a_time() {
    let h = Harness::start(vec![
        kv_package("com.a", 10_001),
        kv_package("com.b", 10_002),
        kv_package("com.c", 10_003),
    ])
    .await
    .with_transport()
    .await;
    h.enable();
    h.mark_metadata_backed_up();
    h.host.make_silent("com.a");

    let first = Arc::new(RecordingObserver::default());
    let second = Arc::new(RecordingObserver::default());
    let status = h.orchestrator.request_backup(
        Caller::system(),
        &["com.a".to_string()],
        Some(first.clone()),
        false,
    );
    assert_eq!(status, BackupStatus::Success);
    let status = h.orchestrator.request_backup(
        Caller::system(),
        &["com.b".to_string()],
        Some(second.clone()),
        false,
    );
    assert_eq!(status, BackupStatus::Success);

    let snapshot = h.snapshot().await;
    assert!(snapshot.backup_running);
    assert_eq!(snapshot.queued_requests, 1);

    // A scheduler tick while a requested pass runs starts nothing new
    h.orchestrator.data_changed(Caller::system(), "com.c").unwrap();
    h.orchestrator.run_key_value_pass().unwrap();
    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.pending_packages, vec!["com.c".to_string()]);
    assert_eq!(snapshot.queued_requests, 1);

    wait_until("agent for com.a to be called", || {
        !h.host.agent_calls().is_empty()
    })
    .await;
    h.orchestrator.cancel_backups();

    wait_until("queued request to finish", || second.finished().is_some()).await;
    assert_eq!(first.finished(), Some(BackupStatus::Cancelled));
    assert_eq!(second.finished(), Some(BackupStatus::Success));
    assert_eq!(h.transport.key_value_backups(), vec!["com.b".to_string()]);

    let snapshot = h
        .wait_for_snapshot("passes to wind down", |s| !s.backup_running)
        .await;
    assert_eq!(snapshot.queued_requests, 0);

    h.orchestrator.run_key_value_pass().unwrap();
    wait_until("key-value backup of com.c", || {
        h.transport.key_value_backups().contains(&"com.c".to_string())
    })
    .await;
    let called: Vec<String> = h
        .host
        .agent_calls()
        .into_iter()
        .filter_map(|call| match call {
            AgentCall::Backup { package, .. } => Some(package),
            _ => None,
        })
        .collect();
    assert_eq!(called, vec!["com.a", "com.b", "com.c"]);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_backups_stops_waiting_pass() {
    let h = Harness::start(vec![kv_package("com.a", 10_001)])
        .await
        .with_transport()
        .await;
    h.enable();
    h.mark_metadata_backed_up();
    h.host.make_silent("com.a");

    h.orchestrator.data_changed(Caller::system(), "com.a").unwrap();
    h.orchestrator.run_key_value_pass().unwrap();
    wait_until("agent to receive the backup call", || {
        !h.host.agent_calls().is_empty()
    })
    .await;

    h.orchestrator.cancel_backups();
    wait_until("canceled pass to wind down", || {
        h.wake_lock.released.load(Ordering::SeqCst) == 1
    })
    .await;

    let busy = h.orchestrator.config().busy_backoff_min_ms;
    assert!(h
        .jobs
        .key_value
        .lock()
        .contains(&Duration::from_millis(busy)));
    assert_eq!(h.jobs.last_full(), Some(Duration::from_millis(busy * 2)));
    assert!(h.transport.key_value_backups().is_empty());

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.pending_packages, vec!["com.a".to_string()]);
    assert!(!snapshot.backup_running);
    assert_eq!(snapshot.operations, 0);
    assert_eq!(snapshot.outstanding_leases, 0);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_pass_restages_and_reschedules() {
    let h = Harness::start(vec![kv_package("com.a", 10_001)])
        .await
        .with_transport()
        .await;
    h.enable();
    h.transport.set_backup_status(TransportStatus::Error);
    let scheduled_before = h.jobs.key_value.lock().len();

    h.orchestrator.data_changed(Caller::system(), "com.a").unwrap();
    h.orchestrator.run_key_value_pass().unwrap();
    wait_until("failed pass to finish", || {
        h.wake_lock.released.load(Ordering::SeqCst) == 1
    })
    .await;

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.pending_packages, vec!["com.a".to_string()]);
    assert_eq!(snapshot.outstanding_leases, 0);
    // One for the data change and one for the failure
    assert!(h.jobs.key_value.lock().len() >= scheduled_before + 2);
    assert_eq!(h.transport.finish_backups.load(Ordering::SeqCst), 0);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uninitialized_transport_is_marked_for_wipe() {
    let h = Harness::start(vec![kv_package("com.a", 10_001)])
        .await
        .with_transport()
        .await;
    h.enable();
    h.transport.set_backup_status(TransportStatus::NotInitialized);

    h.orchestrator.data_changed(Caller::system(), "com.a").unwrap();
    h.orchestrator.run_key_value_pass().unwrap();
    wait_until("pass to finish", || {
        h.wake_lock.released.load(Ordering::SeqCst) == 1
    })
    .await;

    assert!(h.orchestrator.transports().is_init_pending(LOCAL_TRANSPORT));
    let sentinel = h
        .orchestrator
        .transports()
        .state_dir(LOCAL_TRANSPORT)
        .unwrap()
        .join(backup_core::constants::files::INIT_SENTINEL);
    assert!(sentinel.exists());

    // Later passes refuse to touch the transport until it is wiped
    h.transport.set_backup_status(TransportStatus::Ok);
    h.orchestrator.run_key_value_pass().unwrap();
    wait_until("second pass to finish", || {
        h.wake_lock.released.load(Ordering::SeqCst) == 2
    })
    .await;
    assert!(h.transport.key_value_backups().is_empty());
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_battery_saver_defers_backup_now() {
    let h = Harness::start(vec![kv_package("com.a", 10_001)])
        .await
        .with_transport()
        .await;
    h.enable();
    h.orchestrator.set_battery_saver(true);
    h.orchestrator.data_changed(Caller::system(), "com.a").unwrap();
    let scheduled = h.jobs.key_value.lock().len();

    h.orchestrator.backup_now().unwrap();

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.pending_packages, vec!["com.a".to_string()]);
    assert!(h.jobs.key_value.lock().len() > scheduled);
    assert_eq!(h.wake_lock.acquired.load(Ordering::SeqCst), 0);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_package_lifecycle_updates_participation() {
    let h = Harness::start(vec![kv_package("com.a", 10_001)]).await;

    h.catalog.add(kv_package("com.new", 10_050));
    h.orchestrator.on_package_added("com.new", false);
    let snapshot = h.snapshot().await;
    assert!(snapshot.pending_packages.contains(&"com.new".to_string()));
    assert!(snapshot
        .pending_packages
        .contains(&PACKAGE_MANAGER_SENTINEL.to_string()));

    // The new participant can now signal its own changes
    h.orchestrator
        .data_changed(Caller::app(10_050), "com.new")
        .unwrap();

    h.catalog.add(full_package("com.full", 10_060));
    h.orchestrator.on_package_added("com.full", false);
    let snapshot = h.snapshot().await;
    let entry = snapshot
        .full_backup_queue
        .iter()
        .find(|e| e.package_name == "com.full")
        .unwrap();
    assert_eq!(entry.last_backup, START_MILLIS);

    // Gaining an agent moves the package from the full schedule to key-value
    h.catalog.add(kv_package("com.full", 10_060));
    h.orchestrator.on_package_changed("com.full");
    h.orchestrator.on_package_changed("com.unknown");
    let snapshot = h.snapshot().await;
    assert!(snapshot
        .full_backup_queue
        .iter()
        .all(|e| e.package_name != "com.full"));
    assert!(snapshot.pending_packages.contains(&"com.full".to_string()));

    h.catalog.remove("com.new");
    h.orchestrator.on_package_removed("com.new", false);
    let snapshot = h.snapshot().await;
    assert!(!snapshot.pending_packages.contains(&"com.new".to_string()));

    assert!(h.orchestrator.is_app_eligible_for_backup("com.a"));
    assert_eq!(
        h.orchestrator.filter_apps_eligible_for_backup(&[
            "com.a".to_string(),
            "com.new".to_string(),
        ]),
        vec!["com.a".to_string()]
    );
    h.shutdown().await;
}
