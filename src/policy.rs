//! # Policy Gate
//!
//! Device-level switches every pass consults before doing work: whether
//! backup is enabled, whether setup has finished, battery saver, automatic
//! restore, and an optional administrator-mandated transport.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::constants::files;
use crate::persistence::atomic::{atomic_write, read_if_exists};
use crate::transport::TransportRegistry;

/// Why a request was turned away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRejection {
    Disabled,
    NotProvisioned,
    BatterySaver,
    NotPrivileged,
    /// A mandatory transport policy forbids the change
    MandatoryTransport { required: String },
}

impl fmt::Display for PolicyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "backup is disabled"),
            Self::NotProvisioned => write!(f, "device setup has not completed"),
            Self::BatterySaver => write!(f, "battery saver is on"),
            Self::NotPrivileged => write!(f, "caller lacks the backup capability"),
            Self::MandatoryTransport { required } => {
                write!(f, "mandatory transport {required} is in force")
            }
        }
    }
}

#[derive(Debug)]
pub struct PolicyGate {
    enable_file: PathBuf,
    enabled: AtomicBool,
    provisioned: AtomicBool,
    auto_restore: AtomicBool,
    battery_saver: AtomicBool,
    /// Component identity of the required transport
    mandatory_transport: RwLock<Option<String>>,
}

impl PolicyGate {
    /// Restore the persisted enable switch from `base_dir`; everything else
    /// starts from conservative defaults (not provisioned, auto-restore on)
    pub fn load(base_dir: &Path) -> Self {
        let enable_file = base_dir.join(files::BACKUP_ENABLED);
        let enabled = match read_if_exists(&enable_file) {
            Ok(Some(bytes)) => bytes.first().copied() == Some(1),
            Ok(None) => false,
            Err(e) => {
                warn!(path = %enable_file.display(), error = %e, "Unable to read backup enable state");
                false
            }
        };
        info!(enabled = enabled, "🛡️ Backup policy loaded");

        Self {
            enable_file,
            enabled: AtomicBool::new(enabled),
            provisioned: AtomicBool::new(false),
            auto_restore: AtomicBool::new(true),
            battery_saver: AtomicBool::new(false),
            mandatory_transport: RwLock::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn auto_restore(&self) -> bool {
        self.auto_restore.load(Ordering::SeqCst)
    }

    pub fn battery_saver(&self) -> bool {
        self.battery_saver.load(Ordering::SeqCst)
    }

    /// Flip the enable switch, persisting it. Disabling is refused while a
    /// mandatory transport is in force. Returns the previous value.
    pub fn set_enabled(&self, enable: bool) -> Result<bool, PolicyRejection> {
        if !enable {
            if let Some(required) = self.mandatory_transport() {
                return Err(PolicyRejection::MandatoryTransport { required });
            }
        }

        let previous = self.enabled.swap(enable, Ordering::SeqCst);
        if let Err(e) = atomic_write(&self.enable_file, &[u8::from(enable)]) {
            warn!(path = %self.enable_file.display(), error = %e, "Unable to persist backup enable state");
        }
        Ok(previous)
    }

    pub fn set_provisioned(&self, provisioned: bool) {
        self.provisioned.store(provisioned, Ordering::SeqCst);
    }

    pub fn set_auto_restore(&self, auto_restore: bool) {
        self.auto_restore.store(auto_restore, Ordering::SeqCst);
    }

    pub fn set_battery_saver(&self, on: bool) {
        self.battery_saver.store(on, Ordering::SeqCst);
    }

    pub fn set_mandatory_transport(&self, component: Option<String>) {
        *self.mandatory_transport.write() = component;
    }

    pub fn mandatory_transport(&self) -> Option<String> {
        self.mandatory_transport.read().clone()
    }

    /// Gate for any backup pass
    pub fn check_backup_allowed(&self) -> Result<(), PolicyRejection> {
        if !self.is_enabled() {
            return Err(PolicyRejection::Disabled);
        }
        if !self.is_provisioned() {
            return Err(PolicyRejection::NotProvisioned);
        }
        Ok(())
    }

    /// Whether `transport_name` may be selected under the mandatory policy.
    /// With a policy in force, only its registered transport qualifies.
    pub fn is_transport_allowed(&self, transport_name: &str, transports: &TransportRegistry) -> bool {
        match self.mandatory_transport() {
            None => true,
            Some(component) => transports
                .transport_name_for_component(&component)
                .is_some_and(|name| name == transport_name),
        }
    }
}
