//! Durable log of packages that announced a data change.
//!
//! Each generation is a separate file under the journal directory holding a
//! sequence of package-name records. A generation is superseded once the
//! pass that consumed it succeeds; anything left behind at startup belongs to
//! a pass that never finished and is replayed.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::atomic::{durable_append, read_if_exists, remove_if_exists};
use super::codec::{utf_record, RecordReader};
use crate::constants::files;
use crate::error::BackupResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataChangedJournal {
    path: PathBuf,
}

impl DataChangedJournal {
    /// Allocate a new, empty generation in `dir`
    pub fn create(dir: &Path) -> BackupResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}{}", files::JOURNAL_PREFIX, Uuid::new_v4().simple()));
        fs::File::create(&path)?;
        debug!(journal = %path.display(), "Opened data-changed journal");
        Ok(Self { path })
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_package(&self, package: &str) -> BackupResult<()> {
        durable_append(&self.path, &utf_record(package)?)
    }

    /// All package names recorded in this generation, in write order
    pub fn packages(&self) -> BackupResult<Vec<String>> {
        let data = read_if_exists(&self.path)?.unwrap_or_default();
        Ok(RecordReader::new(data, self.path.display().to_string()).read_utf_sequence())
    }

    pub fn delete(&self) -> BackupResult<()> {
        remove_if_exists(&self.path)
    }

    /// Every journal generation currently on disk in `dir`
    pub fn list(dir: &Path) -> Vec<DataChangedJournal> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Unable to list journals");
                return Vec::new();
            }
        };

        let mut journals: Vec<DataChangedJournal> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(files::JOURNAL_PREFIX)
            })
            .map(|entry| Self::from_path(entry.path()))
            .collect();
        journals.sort_by(|a, b| a.path.cmp(&b.path));
        journals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = DataChangedJournal::create(dir.path()).unwrap();
        journal.add_package("com.b").unwrap();
        journal.add_package("com.a").unwrap();
        assert_eq!(journal.packages().unwrap(), vec!["com.b", "com.a"]);
    }

    #[test]
    fn test_list_only_returns_journals() {
        let dir = tempfile::tempdir().unwrap();
        let first = DataChangedJournal::create(dir.path()).unwrap();
        let second = DataChangedJournal::create(dir.path()).unwrap();
        fs::write(dir.path().join("unrelated"), b"x").unwrap();

        let listed = DataChangedJournal::list(dir.path());
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first));
        assert!(listed.contains(&second));
    }

    #[test]
    fn test_list_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DataChangedJournal::list(&dir.path().join("pending")).is_empty());
    }

    #[test]
    fn test_delete_removes_generation() {
        let dir = tempfile::tempdir().unwrap();
        let journal = DataChangedJournal::create(dir.path()).unwrap();
        journal.delete().unwrap();
        assert!(!journal.path().exists());
        assert!(journal.packages().unwrap().is_empty());
    }
}
