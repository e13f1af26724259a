//! # Transport Registry
//!
//! Set of registered transports, the current selection, per-transport state
//! directories with their init-pending sentinels, and the lease table that
//! makes sure every handed-out [`TransportClient`] is disposed exactly once.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::TransportClient;
use super::traits::{BackupTransport, TransportDescription};
use crate::constants::{files, PACKAGE_MANAGER_SENTINEL};
use crate::error::{BackupError, BackupResult};
use crate::logging::log_transport_operation;
use crate::persistence::atomic::{atomic_write, remove_if_exists};

/// Snapshot of one registered transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportState {
    pub name: String,
    pub component: String,
    pub selected: bool,
    pub state_dir: PathBuf,
    pub pending_init: bool,
}

struct RegisteredTransport {
    description: TransportDescription,
    transport: Arc<dyn BackupTransport>,
}

#[derive(Debug, Clone)]
struct Lease {
    transport_name: String,
    caller: String,
}

pub struct TransportRegistry {
    base_state_dir: PathBuf,
    transports: DashMap<String, RegisteredTransport>,
    selected: RwLock<Option<String>>,
    pending_inits: Mutex<HashSet<String>>,
    leases: DashMap<Uuid, Lease>,
}

impl TransportRegistry {
    pub fn new(base_state_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_state_dir: base_state_dir.into(),
            transports: DashMap::new(),
            selected: RwLock::new(None),
            pending_inits: Mutex::new(HashSet::new()),
            leases: DashMap::new(),
        }
    }

    /// Register a transport, creating its state directory.
    ///
    /// Returns true when the transport's init sentinel is present and it must
    /// be initialized before its next backup.
    pub fn register(
        &self,
        description: TransportDescription,
        transport: Arc<dyn BackupTransport>,
    ) -> BackupResult<bool> {
        let state_dir = self.base_state_dir.join(&description.dir_name);
        fs::create_dir_all(&state_dir)?;

        let pending_init = state_dir.join(files::INIT_SENTINEL).exists();
        if pending_init {
            self.pending_inits.lock().insert(description.name.clone());
        }

        let name = description.name.clone();
        if self
            .transports
            .insert(
                name.clone(),
                RegisteredTransport {
                    description,
                    transport,
                },
            )
            .is_some()
        {
            warn!(transport = %name, "Transport re-registered; replacing previous binding");
        }

        log_transport_operation(
            "register",
            Some(&name),
            "registered",
            pending_init.then_some("init pending"),
        );
        Ok(pending_init)
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.transports.remove(name).is_some();
        if removed {
            self.pending_inits.lock().remove(name);
            log_transport_operation("unregister", Some(name), "unregistered", None);
        }
        removed
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.transports.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transports.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Make `name` the current transport, returning the previous selection
    pub fn select_current(&self, name: &str) -> Option<String> {
        let previous = self.selected.write().replace(name.to_string());
        log_transport_operation(
            "select",
            Some(name),
            "selected",
            previous.as_deref(),
        );
        previous
    }

    pub fn current_name(&self) -> Option<String> {
        self.selected.read().clone()
    }

    /// Lease a client for `name`, or `None` if it is not registered
    pub fn get_client(&self, name: &str, caller: &str) -> Option<TransportClient> {
        let transport = self.transports.get(name)?.transport.clone();
        let client = TransportClient::new(name.to_string(), caller.to_string(), transport);
        self.leases.insert(
            client.id(),
            Lease {
                transport_name: name.to_string(),
                caller: caller.to_string(),
            },
        );
        debug!(transport = %name, caller = %caller, lease = %client.id(), "Transport client leased");
        Some(client)
    }

    pub fn current_client(&self, caller: &str) -> Option<TransportClient> {
        let name = self.current_name()?;
        self.get_client(&name, caller)
    }

    /// Return a lease. A second dispose of the same lease is logged and
    /// ignored; returns whether this call released it.
    pub fn dispose_client(&self, client: &TransportClient, caller: &str) -> bool {
        match self.leases.remove(&client.id()) {
            Some((_, lease)) => {
                debug!(
                    transport = %lease.transport_name,
                    leased_by = %lease.caller,
                    disposed_by = %caller,
                    "Transport client disposed"
                );
                true
            }
            None => {
                warn!(
                    lease = %client.id(),
                    transport = %client.transport_name(),
                    caller = %caller,
                    "Transport client disposed more than once"
                );
                false
            }
        }
    }

    /// Leases handed out and not yet disposed
    pub fn outstanding_leases(&self) -> usize {
        self.leases.len()
    }

    pub fn transport_dir_name(&self, name: &str) -> BackupResult<String> {
        self.transports
            .get(name)
            .map(|t| t.description.dir_name.clone())
            .ok_or_else(|| BackupError::TransportNotRegistered(name.to_string()))
    }

    pub fn state_dir(&self, name: &str) -> BackupResult<PathBuf> {
        Ok(self.base_state_dir.join(self.transport_dir_name(name)?))
    }

    pub fn transport_name_for_component(&self, component: &str) -> Option<String> {
        self.transports
            .iter()
            .find(|t| t.description.component == component)
            .map(|t| t.key().clone())
    }

    /// Names of transports hosted by `package`
    pub fn transports_hosted_by(&self, package: &str) -> Vec<String> {
        self.transports
            .iter()
            .filter(|t| t.description.host_package() == package)
            .map(|t| t.key().clone())
            .collect()
    }

    /// Set or clear the init-pending mark, on disk and in memory
    pub fn record_init_pending(&self, pending: bool, name: &str, dir_name: &str) -> BackupResult<()> {
        let sentinel = self
            .base_state_dir
            .join(dir_name)
            .join(files::INIT_SENTINEL);

        if pending {
            self.pending_inits.lock().insert(name.to_string());
            atomic_write(&sentinel, &[])?;
            info!(transport = %name, "🧹 Transport marked for initialization");
        } else {
            self.pending_inits.lock().remove(name);
            remove_if_exists(&sentinel)?;
        }
        Ok(())
    }

    pub fn is_init_pending(&self, name: &str) -> bool {
        self.pending_inits.lock().contains(name)
    }

    pub fn pending_inits(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending_inits.lock().iter().cloned().collect();
        names.sort();
        names
    }

    /// Where the package-metadata pass keeps its state for `name`
    pub fn metadata_state_file(&self, name: &str) -> BackupResult<PathBuf> {
        Ok(self.state_dir(name)?.join(PACKAGE_MANAGER_SENTINEL))
    }

    /// Whether a metadata pass has completed on this transport
    pub fn has_metadata_state(&self, name: &str) -> bool {
        self.metadata_state_file(name)
            .ok()
            .and_then(|path| fs::metadata(path).ok())
            .map(|meta| meta.len() > 0)
            .unwrap_or(false)
    }

    pub fn transport_states(&self) -> Vec<TransportState> {
        let selected = self.current_name();
        let pending = self.pending_inits.lock().clone();
        let mut states: Vec<TransportState> = self
            .transports
            .iter()
            .map(|t| TransportState {
                name: t.key().clone(),
                component: t.description.component.clone(),
                selected: selected.as_deref() == Some(t.key().as_str()),
                state_dir: self.base_state_dir.join(&t.description.dir_name),
                pending_init: pending.contains(t.key()),
            })
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub fn base_state_dir(&self) -> &Path {
        &self.base_state_dir
    }
}
