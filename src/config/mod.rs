//! # Backup Engine Configuration
//!
//! Tunable timings and the on-disk location of the engine's state. Values are
//! layered by [`ConfigLoader`]: built-in defaults, then an optional TOML file,
//! then `BACKUP__*` environment variables.
//!
//! ```rust,no_run
//! use backup_core::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load(None)?;
//! println!("state lives in {}", config.base_state_dir.display());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{timing, DEFAULT_CONFIRMATION_UI_PACKAGE};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Root of all persisted engine state
    pub base_state_dir: PathBuf,

    pub key_value_backup_interval_ms: u64,
    pub key_value_backup_fuzz_ms: u64,
    pub full_backup_interval_ms: u64,

    pub busy_backoff_min_ms: u64,
    pub busy_backoff_fuzz_ms: u64,

    pub agent_bind_timeout_ms: u64,
    pub key_value_agent_timeout_ms: u64,
    pub full_backup_agent_timeout_ms: u64,
    /// Also bounds how long an idle restore session may stay open
    pub restore_agent_timeout_ms: u64,

    pub transport_retry_interval_ms: u64,
    pub initialization_delay_ms: u64,
    pub transport_init_delay_ms: u64,

    pub confirmation_ui_package: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            base_state_dir: PathBuf::from("backup-state"),
            key_value_backup_interval_ms: timing::KEY_VALUE_BACKUP_INTERVAL_MS,
            key_value_backup_fuzz_ms: timing::KEY_VALUE_BACKUP_FUZZ_MS,
            full_backup_interval_ms: timing::FULL_BACKUP_INTERVAL_MS,
            busy_backoff_min_ms: timing::BUSY_BACKOFF_MIN_MS,
            busy_backoff_fuzz_ms: timing::BUSY_BACKOFF_FUZZ_MS,
            agent_bind_timeout_ms: timing::AGENT_BIND_TIMEOUT_MS,
            key_value_agent_timeout_ms: timing::KEY_VALUE_AGENT_TIMEOUT_MS,
            full_backup_agent_timeout_ms: timing::FULL_BACKUP_AGENT_TIMEOUT_MS,
            restore_agent_timeout_ms: timing::RESTORE_AGENT_TIMEOUT_MS,
            transport_retry_interval_ms: timing::TRANSPORT_RETRY_INTERVAL_MS,
            initialization_delay_ms: timing::INITIALIZATION_DELAY_MS,
            transport_init_delay_ms: timing::TRANSPORT_INIT_DELAY_MS,
            confirmation_ui_package: DEFAULT_CONFIRMATION_UI_PACKAGE.to_string(),
        }
    }
}

impl BackupConfig {
    /// Default configuration rooted at a specific directory
    pub fn with_base_dir(base_state_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_state_dir: base_state_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_state_dir.as_os_str().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "base_state_dir",
                "backup configuration",
            ));
        }

        let positive = [
            ("key_value_backup_interval_ms", self.key_value_backup_interval_ms),
            ("full_backup_interval_ms", self.full_backup_interval_ms),
            ("busy_backoff_min_ms", self.busy_backoff_min_ms),
            ("agent_bind_timeout_ms", self.agent_bind_timeout_ms),
            ("key_value_agent_timeout_ms", self.key_value_agent_timeout_ms),
            ("full_backup_agent_timeout_ms", self.full_backup_agent_timeout_ms),
            ("restore_agent_timeout_ms", self.restore_agent_timeout_ms),
            ("transport_retry_interval_ms", self.transport_retry_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "0",
                    "must be greater than zero",
                ));
            }
        }

        // i64 epoch arithmetic on due times must not overflow
        if self.full_backup_interval_ms > i64::MAX as u64 / 2 {
            return Err(ConfigurationError::invalid_value(
                "full_backup_interval_ms",
                self.full_backup_interval_ms.to_string(),
                "interval is out of range",
            ));
        }

        if self.confirmation_ui_package.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "confirmation_ui_package",
                "backup configuration",
            ));
        }

        Ok(())
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.base_state_dir.join(crate::constants::files::JOURNAL_DIR)
    }

    pub fn agent_bind_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_bind_timeout_ms)
    }

    pub fn key_value_agent_timeout(&self) -> Duration {
        Duration::from_millis(self.key_value_agent_timeout_ms)
    }

    pub fn full_backup_agent_timeout(&self) -> Duration {
        Duration::from_millis(self.full_backup_agent_timeout_ms)
    }

    pub fn restore_agent_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_agent_timeout_ms)
    }

    pub fn transport_retry_interval(&self) -> Duration {
        Duration::from_millis(self.transport_retry_interval_ms)
    }
}
