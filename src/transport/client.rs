use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::traits::BackupTransport;

/// A lease on a registered transport. Every lease handed out by
/// [`super::TransportRegistry`] must be returned through
/// `dispose_client` exactly once.
pub struct TransportClient {
    id: Uuid,
    transport_name: String,
    caller: String,
    transport: Arc<dyn BackupTransport>,
}

impl TransportClient {
    pub(crate) fn new(
        transport_name: String,
        caller: String,
        transport: Arc<dyn BackupTransport>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport_name,
            caller,
            transport,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    /// Who asked for the lease, for leak diagnostics
    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn transport(&self) -> &Arc<dyn BackupTransport> {
        &self.transport
    }
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("id", &self.id)
            .field("transport", &self.transport_name)
            .field("caller", &self.caller)
            .finish()
    }
}
