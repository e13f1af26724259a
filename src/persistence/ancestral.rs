//! Restore-token bookkeeping.
//!
//! The ancestral token names the dataset the device was originally restored
//! from; the current token names the dataset being written by this device on
//! the selected transport. Zero means "none".

use bytes::{BufMut, BytesMut};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

use super::atomic::{atomic_write, read_if_exists};
use super::codec::{put_utf, RecordReader};
use crate::constants::versions;
use crate::error::{BackupError, BackupResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AncestralRecord {
    pub ancestral_token: u64,
    pub current_token: u64,
    /// Packages present in the ancestral dataset; `None` when unknown
    pub ancestral_packages: Option<HashSet<String>>,
}

impl AncestralRecord {
    /// Load from disk. Absent, stale-version and corrupt files all yield an
    /// empty record.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(Some(record)) => {
                debug!(
                    ancestral = record.ancestral_token,
                    current = record.current_token,
                    "Restore tokens loaded"
                );
                record
            }
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unable to read restore tokens; starting empty");
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> BackupResult<Option<Self>> {
        let Some(data) = read_if_exists(path)? else {
            return Ok(None);
        };
        let mut reader = RecordReader::new(data, path.display().to_string());

        let version = reader.read_i32()?;
        if version != versions::ANCESTRAL_RECORD {
            return Err(BackupError::corrupt(
                path.display().to_string(),
                format!("unsupported version {version}"),
            ));
        }

        let ancestral_token = reader.read_i64()? as u64;
        let current_token = reader.read_i64()? as u64;
        let count = reader.read_i32()?;
        let ancestral_packages = if count >= 0 {
            let mut packages = HashSet::new();
            for _ in 0..count {
                packages.insert(reader.read_utf()?);
            }
            Some(packages)
        } else {
            None
        };

        Ok(Some(Self {
            ancestral_token,
            current_token,
            ancestral_packages,
        }))
    }

    pub fn encode(&self) -> BackupResult<BytesMut> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_i32(versions::ANCESTRAL_RECORD);
        buf.put_i64(self.ancestral_token as i64);
        buf.put_i64(self.current_token as i64);
        match &self.ancestral_packages {
            Some(packages) => {
                let count = i32::try_from(packages.len()).map_err(|_| {
                    BackupError::Persistence("too many ancestral packages".to_string())
                })?;
                buf.put_i32(count);
                let mut sorted: Vec<&String> = packages.iter().collect();
                sorted.sort();
                for package in sorted {
                    put_utf(&mut buf, package)?;
                }
            }
            None => buf.put_i32(-1),
        }
        Ok(buf)
    }

    /// Persist synchronously
    pub fn write(&self, path: &Path) -> BackupResult<()> {
        atomic_write(path, &self.encode()?)
    }
}
