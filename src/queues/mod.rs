//! Work queues feeding backup passes: packages with changed key-value data,
//! and the time-ordered full-backup schedule.

pub mod full_backup;
pub mod pending;

pub use full_backup::{FullBackupEntry, FullBackupScheduleQueue, LoadedSchedule};
pub use pending::{BackupRequest, DrainedPass, PendingRequestSet};
