//! # Persistence
//!
//! Flat-file records that let the engine resume after a restart: restore
//! tokens, the processed-packages set, and data-changed journals. The full
//! backup schedule file is owned by [`crate::queues::full_backup`].

pub mod ancestral;
pub mod atomic;
pub mod codec;
pub mod data_changed;
pub mod processed;

pub use ancestral::AncestralRecord;
pub use data_changed::DataChangedJournal;
pub use processed::ProcessedPackagesJournal;
