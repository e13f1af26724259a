#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Backup Core Rust
//!
//! Device backup orchestration engine: decides when per-application data is
//! backed up, to which transport, and how it is restored.
//!
//! ## Overview
//!
//! Applications report data changes; the engine journals them durably and
//! runs periodic key-value passes over everything pending. Applications
//! without their own agent are backed up whole on a separate, slower
//! schedule, one package at a time. Restores run from a restore session or
//! automatically when a package is installed.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - The orchestrator, its control loop and all passes
//! - [`operations`] - Tokens, deadlines and completion of async agent work
//! - [`queues`] - Pending key-value requests and the full backup schedule
//! - [`persistence`] - Journals and record files under the state directory
//! - [`transport`] - Transport interface, leases and the transport registry
//! - [`policy`] - Enable, provisioning, battery saver and mandatory transport
//! - [`platform`] - Interfaces to the package catalog, agents, installer,
//!   wake lock and job scheduler
//! - [`state_machine`] - Operation and pass lifecycles
//! - [`config`] - Configuration loading and validation
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backup_core::config::ConfigLoader;
//! use backup_core::orchestration::BackupOrchestrator;
//! use backup_core::platform::Collaborators;
//!
//! # async fn example(collaborators: Collaborators) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load(None)?;
//! let orchestrator = BackupOrchestrator::start(config, collaborators).await?;
//! orchestrator.set_provisioned(true);
//! orchestrator.set_backup_enabled(true)?;
//! orchestrator.backup_now()?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod operations;
pub mod orchestration;
pub mod persistence;
pub mod platform;
pub mod policy;
pub mod queues;
pub mod state_machine;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackupConfig, ConfigLoader, ConfigurationError};
pub use error::{BackupError, BackupResult};
pub use operations::{OperationRegistry, OperationToken};
pub use orchestration::{BackupOrchestrator, FullBackupOutcome, OrchestratorSnapshot, RestoreSession};
pub use platform::{BackupStatus, Caller, Collaborators, PackageInfo};
pub use policy::{PolicyGate, PolicyRejection};
pub use queues::{FullBackupScheduleQueue, PendingRequestSet};
pub use transport::{BackupTransport, TransportDescription, TransportRegistry, TransportStatus};
