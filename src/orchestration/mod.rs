//! # Orchestration Engine
//!
//! The [`BackupOrchestrator`] ties the registries and queues together and
//! drives every pass.
//!
//! ## Architecture
//!
//! - **Control loop**: a single tokio task handles posted [`BackupCommand`]s
//!   and operation events in arrival order
//! - **Queue lock**: pending key-value requests, the full backup schedule
//!   and the running-full-backup slot share one mutex
//! - **Passes**: key-value, full, initialize, clear-data and restore work runs
//!   as separate tokio tasks; blocking agent waits go through
//!   `spawn_blocking`
//! - **Leases**: every transport client a pass takes is returned exactly once
//!   when the pass ends

mod agents;
mod backup;
pub mod commands;
mod core;
pub mod full_backup;
pub mod restore;
mod tasks;

pub use commands::{BackupCommand, BackupParams, CommandResponder, OrchestratorSnapshot, RestoreParams};
pub use self::core::BackupOrchestrator;
pub use full_backup::FullBackupOutcome;
pub use restore::RestoreSession;
