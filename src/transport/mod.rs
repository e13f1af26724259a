//! Pluggable remote storage: the transport interface, leased clients and the
//! registry that tracks selection and per-transport state.

pub mod client;
pub mod registry;
pub mod traits;

pub use client::TransportClient;
pub use registry::{TransportRegistry, TransportState};
pub use traits::{
    BackupTransport, RestoreSet, TransportDescription, TransportError, TransportResult,
    TransportStatus,
};
