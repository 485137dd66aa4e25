//! Dependency graph over stored backups.
//!
//! An edge runs from a backup to every backup that references it. Deleting
//! a full backup takes everything reachable from it along those edges with
//! it; a backup whose dependency is missing (or itself broken) cannot be
//! restored and is reported by [`RetentionGraph::bad_deps`].

use crate::model::{naming, BackupRecord};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct RetentionGraph {
    existing: BTreeSet<String>,
    /// dependency -> dependents
    forward: BTreeMap<String, BTreeSet<String>>,
    /// dependent -> dependencies
    backward: BTreeMap<String, BTreeSet<String>>,
}

impl RetentionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a BackupRecord>) -> Self {
        let mut graph = Self::new();
        for record in records {
            graph.add(&record.name, &record.reference);
        }
        graph
    }

    /// Register `name` and the backups it references. Names outside the
    /// naming scheme are ignored.
    pub fn add(&mut self, name: &str, deps: &[String]) {
        if !naming::is_backup_name(name) {
            return;
        }
        self.existing.insert(name.to_string());
        for dep in deps.iter().filter(|d| naming::is_backup_name(d) && d.as_str() != name) {
            self.forward.entry(dep.clone()).or_default().insert(name.to_string());
            self.backward.entry(name.to_string()).or_default().insert(dep.clone());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.existing.contains(name)
    }

    /// Full backups, oldest first.
    pub fn fulls(&self) -> Vec<String> {
        self.existing.iter().filter(|n| naming::is_full(n)).cloned().collect()
    }

    /// The oldest fulls beyond the newest `keep`.
    pub fn fulls_for_delete(&self, keep: usize) -> Vec<String> {
        let fulls = self.fulls();
        let excess = fulls.len().saturating_sub(keep);
        fulls[..excess].to_vec()
    }

    /// The newest `keep` fulls.
    pub fn fulls_for_store(&self, keep: usize) -> Vec<String> {
        let fulls = self.fulls();
        let excess = fulls.len().saturating_sub(keep);
        fulls[excess..].to_vec()
    }

    /// Every backup that depends on `name`, directly or through other
    /// dependents.
    pub fn dependents(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            if let Some(next) = self.forward.get(&current) {
                for dependent in next {
                    if found.insert(dependent.clone()) {
                        pending.push(dependent.clone());
                    }
                }
            }
        }
        found.remove(name);
        found
    }

    /// Fulls to delete followed by their dependents, each name once.
    pub fn backups_for_delete(&self, keep: usize) -> Vec<String> {
        self.expand(self.fulls_for_delete(keep))
    }

    /// Fulls to keep followed by their dependents, each name once.
    pub fn backups_for_store(&self, keep: usize) -> Vec<String> {
        self.expand(self.fulls_for_store(keep))
    }

    fn expand(&self, fulls: Vec<String>) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for full in fulls {
            let dependents = self.dependents(&full);
            for name in std::iter::once(full).chain(dependents) {
                if seen.insert(name.clone()) {
                    out.push(name);
                }
            }
        }
        out
    }

    /// Backups with a dependency that is missing or itself bad, sorted.
    pub fn bad_deps(&self) -> Vec<String> {
        let mut bad: BTreeSet<String> = BTreeSet::new();
        loop {
            let before = bad.len();
            for name in &self.existing {
                if bad.contains(name) {
                    continue;
                }
                let broken = self
                    .backward
                    .get(name)
                    .is_some_and(|deps| deps.iter().any(|d| !self.existing.contains(d) || bad.contains(d)));
                if broken {
                    bad.insert(name.clone());
                }
            }
            if bad.len() == before {
                break;
            }
        }
        bad.into_iter().collect()
    }
}
