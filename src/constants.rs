//! # System Constants
//!
//! Fixed names, file layout and timing defaults that define the operational
//! boundaries of the backup engine. Tunable values live in
//! [`crate::config::BackupConfig`]; the values here are either format
//! constants or the defaults those tunables start from.

/// Pseudo-package under which package-manager metadata is backed up.
///
/// It always routes to the key-value path and is never recorded in the
/// processed-packages journal.
pub const PACKAGE_MANAGER_SENTINEL: &str = "@pm@";

/// Package hosting the user confirmation UI. Its process is never killed on
/// agent teardown.
pub const DEFAULT_CONFIRMATION_UI_PACKAGE: &str = "com.android.backupconfirm";

/// First uid assigned to ordinary applications. Processes below it are
/// system processes and are never killed after an agent session.
pub const FIRST_APPLICATION_UID: u32 = 10_000;

/// Uid of the system server; agent connection callbacks must come from it.
pub const SYSTEM_UID: u32 = 1_000;

/// On-disk layout under the base state directory
pub mod files {
    pub const ANCESTRAL_RECORD: &str = "ancestral";
    pub const FULL_BACKUP_SCHEDULE: &str = "fb-schedule";
    pub const PROCESSED_PACKAGES: &str = "processed";
    pub const JOURNAL_DIR: &str = "pending";
    pub const JOURNAL_PREFIX: &str = "journal-";
    pub const BACKUP_ENABLED: &str = "backup_enabled";
    /// Lives inside a transport's own state directory
    pub const INIT_SENTINEL: &str = "_need_init_";
}

/// Versions of the persisted record formats
pub mod versions {
    pub const ANCESTRAL_RECORD: i32 = 1;
    pub const FULL_BACKUP_SCHEDULE: i32 = 1;
}

/// Default timings, all in milliseconds
pub mod timing {
    /// Wait for an agent to bind before giving up on it
    pub const AGENT_BIND_TIMEOUT_MS: u64 = 10_000;
    pub const KEY_VALUE_AGENT_TIMEOUT_MS: u64 = 30_000;
    pub const FULL_BACKUP_AGENT_TIMEOUT_MS: u64 = 5 * 60_000;
    pub const RESTORE_AGENT_TIMEOUT_MS: u64 = 60_000;

    pub const HOUR_MS: u64 = 60 * 60_000;
    pub const DAY_MS: u64 = 24 * HOUR_MS;

    /// Minimum back-off after a cancel or a foreground-busy deferral
    pub const BUSY_BACKOFF_MIN_MS: u64 = HOUR_MS;
    /// Random spread added on top of the minimum back-off
    pub const BUSY_BACKOFF_FUZZ_MS: u64 = 2 * HOUR_MS;

    pub const KEY_VALUE_BACKUP_INTERVAL_MS: u64 = 4 * HOUR_MS;
    pub const KEY_VALUE_BACKUP_FUZZ_MS: u64 = 10 * 60_000;
    pub const FULL_BACKUP_INTERVAL_MS: u64 = DAY_MS;

    /// Retry cadence for work that found its transport unregistered
    pub const TRANSPORT_RETRY_INTERVAL_MS: u64 = HOUR_MS;
    /// Delay before running transport initialization after startup
    pub const INITIALIZATION_DELAY_MS: u64 = 3_000;
    /// Delay before initializing a transport that registered with a sentinel
    pub const TRANSPORT_INIT_DELAY_MS: u64 = 60_000;
}
