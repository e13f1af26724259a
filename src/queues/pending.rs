//! Packages waiting for the next key-value pass, mirrored to the
//! data-changed journal so a crash cannot lose them.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::persistence::DataChangedJournal;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub package_name: String,
}

/// Work handed to a key-value pass by [`PendingRequestSet::drain_for_pass`]
#[derive(Debug)]
pub struct DrainedPass {
    pub packages: Vec<String>,
    journal: Option<DataChangedJournal>,
}

impl DrainedPass {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Close out the pass: on failure its packages go back into `pending`
    /// (and so into a newer generation) before this generation is deleted
    pub fn finish(self, success: bool, pending: &mut PendingRequestSet) {
        if !success && !self.packages.is_empty() {
            debug!(packages = self.packages.len(), "Re-staging packages from failed pass");
            pending.restage(&self.packages);
        }
        self.retire();
    }

    /// Delete the generation this pass consumed. Call only once the packages
    /// are either backed up or re-staged into a newer generation.
    pub fn retire(self) {
        if let Some(journal) = self.journal {
            if let Err(e) = journal.delete() {
                warn!(journal = %journal.path().display(), error = %e, "Unable to delete retired journal");
            }
        }
    }
}

#[derive(Debug)]
pub struct PendingRequestSet {
    journal_dir: PathBuf,
    requests: HashMap<String, BackupRequest>,
    journal: Option<DataChangedJournal>,
}

impl PendingRequestSet {
    pub fn new(journal_dir: impl Into<PathBuf>) -> Self {
        Self {
            journal_dir: journal_dir.into(),
            requests: HashMap::new(),
            journal: None,
        }
    }

    /// Stage `package` if the caller is authorized for it.
    ///
    /// Returns true when the package was newly staged (and journaled).
    pub fn record_change(&mut self, package: &str, authorized_targets: &HashSet<String>) -> bool {
        if !authorized_targets.contains(package) {
            debug!(package = %package, "Data change from unauthorized or non-participant package ignored");
            return false;
        }
        self.stage(package)
    }

    /// Put back packages from a pass that did not finish
    pub fn restage(&mut self, packages: &[String]) {
        for package in packages {
            self.stage(package);
        }
    }

    fn stage(&mut self, package: &str) -> bool {
        let added = self
            .requests
            .insert(
                package.to_string(),
                BackupRequest {
                    package_name: package.to_string(),
                },
            )
            .is_none();
        if added {
            self.write_to_journal(package);
        }
        added
    }

    fn write_to_journal(&mut self, package: &str) {
        if self.journal.is_none() {
            match DataChangedJournal::create(&self.journal_dir) {
                Ok(journal) => self.journal = Some(journal),
                Err(e) => {
                    error!(package = %package, error = %e, "Can't create data-changed journal");
                    return;
                }
            }
        }

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.add_package(package) {
                // Next change allocates a fresh generation
                error!(package = %package, error = %e, "Can't write to data-changed journal");
                self.journal = None;
            }
        }
    }

    /// Atomically take every pending package and rotate the journal
    pub fn drain_for_pass(&mut self) -> DrainedPass {
        let mut packages: Vec<String> = self.requests.drain().map(|(name, _)| name).collect();
        packages.sort();
        DrainedPass {
            packages,
            journal: self.journal.take(),
        }
    }

    /// Replay journals left behind by an earlier run, then delete them.
    ///
    /// Returns the number of journals replayed.
    pub fn replay_stale_journals(&mut self, authorized_targets: &HashSet<String>) -> usize {
        let mut replayed = 0;
        for journal in DataChangedJournal::list(&self.journal_dir) {
            if self.journal.as_ref() == Some(&journal) {
                continue;
            }

            match journal.packages() {
                Ok(packages) => {
                    info!(
                        journal = %journal.path().display(),
                        packages = packages.len(),
                        "📒 Replaying leftover data-changed journal"
                    );
                    for package in &packages {
                        self.record_change(package, authorized_targets);
                    }
                    if let Err(e) = journal.delete() {
                        warn!(journal = %journal.path().display(), error = %e, "Unable to delete replayed journal");
                    }
                    replayed += 1;
                }
                Err(e) => {
                    warn!(journal = %journal.path().display(), error = %e, "Skipping unreadable journal");
                }
            }
        }
        replayed
    }

    pub fn remove(&mut self, package: &str) -> bool {
        self.requests.remove(package).is_some()
    }

    pub fn contains(&self, package: &str) -> bool {
        self.requests.contains_key(package)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn package_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.requests.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn current_journal(&self) -> Option<&DataChangedJournal> {
        self.journal.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn drained_path(drained: &DrainedPass) -> PathBuf {
        drained.journal.as_ref().unwrap().path().to_path_buf()
    }

    #[test]
    fn test_successful_pass_deletes_its_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = PendingRequestSet::new(dir.path().join("pending"));
        set.record_change("com.a", &targets(&["com.a"]));

        let drained = set.drain_for_pass();
        let consumed = drained_path(&drained);
        drained.finish(true, &mut set);

        assert!(set.is_empty());
        assert!(!consumed.exists());
    }

    #[test]
    fn test_unauthorized_change_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = PendingRequestSet::new(dir.path().join("pending"));

        assert!(!set.record_change("com.other", &targets(&["com.mine"])));
        assert!(set.is_empty());
        assert!(set.current_journal().is_none());
    }

    #[test]
    fn test_duplicate_change_is_journaled_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = PendingRequestSet::new(dir.path().join("pending"));
        let allowed = targets(&["com.a"]);

        assert!(set.record_change("com.a", &allowed));
        assert!(!set.record_change("com.a", &allowed));
        assert_eq!(set.len(), 1);
        let journal = set.current_journal().unwrap();
        assert_eq!(journal.packages().unwrap(), vec!["com.a"]);
    }

    #[test]
    fn test_drain_rotates_journal() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = PendingRequestSet::new(dir.path().join("pending"));
        let allowed = targets(&["com.a", "com.b"]);
        set.record_change("com.b", &allowed);
        set.record_change("com.a", &allowed);

        let drained = set.drain_for_pass();
        assert_eq!(drained.packages, vec!["com.a", "com.b"]);
        assert!(set.is_empty());
        assert!(set.current_journal().is_none());

        set.record_change("com.a", &allowed);
        let new_journal = set.current_journal().unwrap().clone();
        drained.retire();

        let on_disk = DataChangedJournal::list(&dir.path().join("pending"));
        assert_eq!(on_disk, vec![new_journal]);
    }

    #[test]
    fn test_restage_after_failed_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = PendingRequestSet::new(dir.path().join("pending"));
        set.record_change("com.a", &targets(&["com.a"]));

        let drained = set.drain_for_pass();
        let consumed = drained_path(&drained);
        drained.finish(false, &mut set);

        assert!(set.contains("com.a"));
        assert!(!consumed.exists());
        let journal = set.current_journal().unwrap();
        assert_eq!(journal.packages().unwrap(), vec!["com.a"]);
    }

    #[test]
    fn test_replay_unions_leftover_journals() {
        let dir = tempfile::tempdir().unwrap();
        let journal_dir = dir.path().join("pending");
        let j1 = DataChangedJournal::create(&journal_dir).unwrap();
        j1.add_package("A").unwrap();
        j1.add_package("B").unwrap();
        let j2 = DataChangedJournal::create(&journal_dir).unwrap();
        j2.add_package("B").unwrap();
        j2.add_package("C").unwrap();

        let mut set = PendingRequestSet::new(&journal_dir);
        let replayed = set.replay_stale_journals(&targets(&["A", "B", "C"]));

        assert_eq!(replayed, 2);
        assert_eq!(set.package_names(), vec!["A", "B", "C"]);
        assert!(!j1.path().exists());
        assert!(!j2.path().exists());
        // Replayed entries live on in the new generation
        let current = set.current_journal().unwrap();
        assert_eq!(current.packages().unwrap().len(), 3);
    }
}
