//! Configuration Loader
//!
//! Layers built-in defaults, an optional TOML file and `BACKUP__*` environment
//! overrides, then validates the merged result.

use std::env;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::BackupConfig;

/// Environment variable naming the TOML file when no path is passed
pub const CONFIG_PATH_ENV: &str = "BACKUP_CONFIG_PATH";
/// Prefix for per-field overrides, e.g. `BACKUP__FULL_BACKUP_INTERVAL_MS`
pub const ENV_PREFIX: &str = "BACKUP";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from `path`, `$BACKUP_CONFIG_PATH`, or defaults only
    pub fn load(path: Option<&Path>) -> ConfigResult<BackupConfig> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
        let config = Self::build(path.as_deref(), true)?;

        info!(
            base_state_dir = %config.base_state_dir.display(),
            full_backup_interval_ms = config.full_backup_interval_ms,
            key_value_backup_interval_ms = config.key_value_backup_interval_ms,
            "⚙️ Backup configuration loaded"
        );
        Ok(config)
    }

    /// Load a single TOML file without consulting the environment
    pub fn load_file(path: &Path) -> ConfigResult<BackupConfig> {
        if !path.is_file() {
            return Err(ConfigurationError::load_error(
                path.display().to_string(),
                "not a regular file",
            ));
        }
        Self::build(Some(path), false)
    }

    /// Parse TOML text directly; used by tooling and tests
    pub fn from_toml_str(toml: &str) -> ConfigResult<BackupConfig> {
        let merged = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .map_err(|e| ConfigurationError::load_error("inline", e))?;
        Self::finish(merged)
    }

    fn build(path: Option<&Path>, with_env: bool) -> ConfigResult<BackupConfig> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading backup configuration file");
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        if with_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let source_name = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".to_string());
        let merged = builder
            .build()
            .map_err(|e| ConfigurationError::load_error(source_name, e))?;
        Self::finish(merged)
    }

    fn finish(merged: Config) -> ConfigResult<BackupConfig> {
        let config: BackupConfig = merged
            .try_deserialize()
            .map_err(|e| ConfigurationError::TypeMismatch {
                error: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }
}
