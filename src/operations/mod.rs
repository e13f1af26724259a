//! Asynchronous operation tracking: tokens, deadlines, completion and cancel.

pub mod registry;
pub mod token;

pub use registry::{BackupRestoreTask, OperationEvent, OperationRegistry};
pub use token::{OperationToken, TokenGenerator};
