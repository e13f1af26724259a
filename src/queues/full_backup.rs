//! Time-ordered queue of packages due for a full-data backup.
//!
//! Entries are ordered by due time, ascending, ties in insertion order. A
//! package that has never been backed up (`last_backup == 0`) is due
//! immediately and goes to the front.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::constants::versions;
use crate::error::{BackupError, BackupResult};
use crate::persistence::atomic::{atomic_write, read_if_exists, remove_if_exists};
use crate::persistence::codec::{put_utf, RecordReader};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBackupEntry {
    pub package_name: String,
    /// Epoch millis of the last successful full backup, 0 if never
    pub last_backup: i64,
    /// Epoch millis at which the entry becomes eligible to run
    pub due_at: i64,
}

/// Result of reading the schedule file at startup
#[derive(Debug)]
pub struct LoadedSchedule {
    pub queue: FullBackupScheduleQueue,
    /// The in-memory queue differs from disk and should be rewritten
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct FullBackupScheduleQueue {
    entries: Vec<FullBackupEntry>,
    interval_ms: i64,
}

impl FullBackupScheduleQueue {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            interval_ms: i64::try_from(interval_ms).unwrap_or(i64::MAX),
        }
    }

    /// Build a queue from `(package, last_backup)` pairs, stably sorted by due time
    pub fn from_entries<I>(interval_ms: u64, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        let mut queue = Self::new(interval_ms);
        let mut seen = HashSet::new();
        for (package_name, last_backup) in entries {
            if !seen.insert(package_name.clone()) {
                continue;
            }
            let due_at = queue.due_for(last_backup);
            queue.entries.push(FullBackupEntry {
                package_name,
                last_backup,
                due_at,
            });
        }
        queue.entries.sort_by_key(|entry| entry.due_at);
        queue
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    fn due_for(&self, last_backup: i64) -> i64 {
        if last_backup <= 0 {
            0
        } else {
            last_backup.saturating_add(self.interval_ms)
        }
    }

    /// Schedule `package` after a backup at `last_backup`, replacing any
    /// existing entry
    pub fn enqueue(&mut self, package: &str, last_backup: i64) {
        self.dequeue(package);
        let entry = FullBackupEntry {
            package_name: package.to_string(),
            last_backup,
            due_at: self.due_for(last_backup),
        };
        if last_backup <= 0 {
            self.entries.insert(0, entry);
        } else {
            self.insert_ordered(entry);
        }
    }

    /// Push `package` back to an explicit due time without touching its
    /// backup history
    pub fn defer(&mut self, package: &str, last_backup: i64, due_at: i64) {
        self.dequeue(package);
        self.insert_ordered(FullBackupEntry {
            package_name: package.to_string(),
            last_backup,
            due_at,
        });
    }

    // After the last entry due no later than the new one
    fn insert_ordered(&mut self, entry: FullBackupEntry) {
        let position = self
            .entries
            .iter()
            .rposition(|existing| existing.due_at <= entry.due_at)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.entries.insert(position, entry);
    }

    pub fn dequeue(&mut self, package: &str) -> Option<FullBackupEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.package_name == package)?;
        Some(self.entries.remove(index))
    }

    pub fn dequeue_head(&mut self) -> Option<FullBackupEntry> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn head(&self) -> Option<&FullBackupEntry> {
        self.entries.first()
    }

    pub fn next_due_at(&self) -> Option<i64> {
        self.head().map(|entry| entry.due_at)
    }

    pub fn contains(&self, package: &str) -> bool {
        self.entries.iter().any(|entry| entry.package_name == package)
    }

    pub fn get(&self, package: &str) -> Option<&FullBackupEntry> {
        self.entries.iter().find(|entry| entry.package_name == package)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FullBackupEntry> {
        self.entries.iter()
    }

    pub fn package_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.package_name.clone()).collect()
    }

    pub fn encode(&self) -> BackupResult<BytesMut> {
        let mut buf = BytesMut::with_capacity(8 + self.entries.len() * 48);
        buf.put_i32(versions::FULL_BACKUP_SCHEDULE);
        let count = i32::try_from(self.entries.len())
            .map_err(|_| BackupError::Persistence("schedule too large".to_string()))?;
        buf.put_i32(count);
        for entry in &self.entries {
            put_utf(&mut buf, &entry.package_name)?;
            buf.put_i64(entry.last_backup);
        }
        Ok(buf)
    }

    pub fn write(&self, path: &Path) -> BackupResult<()> {
        atomic_write(path, &self.encode()?)
    }

    /// Read the schedule, reconciled against the packages currently eligible
    /// for full backup.
    ///
    /// Entries for packages no longer eligible are dropped; eligible packages
    /// missing from the file are added as never backed up. An unreadable or
    /// stale-version file is deleted and the queue rebuilt from `eligible`.
    pub fn load(path: &Path, interval_ms: u64, eligible: &[String]) -> LoadedSchedule {
        let eligible_set: HashSet<&str> = eligible.iter().map(String::as_str).collect();

        let (stored, mut changed) = match Self::read_entries(path) {
            Ok(Some(entries)) => (entries, false),
            Ok(None) => (Vec::new(), true),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable full backup schedule");
                if let Err(e) = remove_if_exists(path) {
                    warn!(path = %path.display(), error = %e, "Unable to delete schedule file");
                }
                (Vec::new(), true)
            }
        };

        let mut found = HashSet::new();
        let mut entries = Vec::with_capacity(eligible.len());
        for (package, last_backup) in stored {
            if eligible_set.contains(package.as_str()) {
                found.insert(package.clone());
                entries.push((package, last_backup));
            } else {
                debug!(package = %package, "Dropping package no longer eligible for full backup");
                changed = true;
            }
        }

        for package in eligible {
            if !found.contains(package) {
                debug!(package = %package, "Scheduling newly eligible package");
                entries.push((package.clone(), 0));
                changed = true;
            }
        }

        let queue = Self::from_entries(interval_ms, entries);
        info!(entries = queue.len(), changed = changed, "🗓️ Full backup schedule loaded");
        LoadedSchedule { queue, changed }
    }

    fn read_entries(path: &Path) -> BackupResult<Option<Vec<(String, i64)>>> {
        let Some(data) = read_if_exists(path)? else {
            return Ok(None);
        };
        let file = path.display().to_string();
        let mut reader = RecordReader::new(data, file.clone());

        let version = reader.read_i32()?;
        if version != versions::FULL_BACKUP_SCHEDULE {
            return Err(BackupError::corrupt(file, format!("unknown version {version}")));
        }
        let count = reader.read_i32()?;
        if count < 0 {
            return Err(BackupError::corrupt(file, format!("negative count {count}")));
        }

        let mut entries = Vec::new();
        for _ in 0..count {
            let package = reader.read_utf()?;
            let last_backup = reader.read_i64()?;
            entries.push((package, last_backup));
        }
        Ok(Some(entries))
    }
}
