//! Append-only record of packages that have been backed up at least once in
//! the current dataset.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::atomic::{durable_append, read_if_exists, remove_if_exists};
use super::codec::{utf_record, RecordReader};
use crate::constants::{files, PACKAGE_MANAGER_SENTINEL};
use crate::error::BackupResult;

#[derive(Debug)]
pub struct ProcessedPackagesJournal {
    path: PathBuf,
    processed: HashSet<String>,
}

impl ProcessedPackagesJournal {
    /// Open the journal in `base_dir`, loading whatever survived on disk
    pub fn open(base_dir: &Path) -> Self {
        let path = base_dir.join(files::PROCESSED_PACKAGES);
        let processed = match read_if_exists(&path) {
            Ok(Some(data)) => RecordReader::new(data, path.display().to_string())
                .read_utf_sequence()
                .into_iter()
                .collect(),
            Ok(None) => HashSet::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unable to read processed journal");
                HashSet::new()
            }
        };
        debug!(count = processed.len(), "Processed packages loaded");
        Self { path, processed }
    }

    pub fn has_been_processed(&self, package: &str) -> bool {
        self.processed.contains(package)
    }

    /// Record a package as backed up. The metadata sentinel is never recorded.
    /// In-memory state is updated even if the append fails.
    pub fn add_package(&mut self, package: &str) -> BackupResult<()> {
        if package == PACKAGE_MANAGER_SENTINEL || !self.processed.insert(package.to_string()) {
            return Ok(());
        }
        durable_append(&self.path, &utf_record(package)?)
    }

    pub fn packages(&self) -> HashSet<String> {
        self.processed.clone()
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    /// Forget everything; used when the dataset is wiped
    pub fn reset(&mut self) -> BackupResult<()> {
        self.processed.clear();
        remove_if_exists(&self.path)
    }
}
