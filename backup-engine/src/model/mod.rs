//! Backup record model.
//!
//! A backup is a tree of aggregates: files roll up into tables, tables into
//! databases, databases into the backup. Every level carries a [`Counter`]
//! and the set of backup names it points into. The whole tree is serialized
//! as the run's `backup.json`.

pub mod naming;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use naming::BackupKind;

/// Current `backup.json` format version.
pub const RECORD_VERSION: u32 = 1;

/// Database name to table names selected for a run. An empty table list
/// selects every table of that database.
pub type BackupFilter = BTreeMap<String, Vec<String>>;

/// Byte counters.
///
/// `size`/`bsize` are logical (uncompressed) and stored (compressed) bytes of
/// everything the aggregate describes; the `repo_*` pair counts only bytes
/// physically written by this backup, so `repo_size <= size` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub bsize: i64,
    #[serde(default)]
    pub repo_size: i64,
    #[serde(default)]
    pub repo_bsize: i64,
}

impl Counter {
    pub fn add(&mut self, rhs: &Counter) {
        self.size += rhs.size;
        self.bsize += rhs.bsize;
        self.repo_size += rhs.repo_size;
        self.repo_bsize += rhs.repo_bsize;
    }

    pub fn sub(&mut self, rhs: &Counter) {
        self.size -= rhs.size;
        self.bsize -= rhs.bsize;
        self.repo_size -= rhs.repo_size;
        self.repo_bsize -= rhs.repo_bsize;
    }

    pub fn is_consistent(&self) -> bool {
        self.repo_size <= self.size && self.repo_bsize <= self.bsize
    }
}

/// One stored file.
///
/// A record with a `reference` is a pointer: the bytes live in the archive of
/// the named backup, which always holds the original (never another pointer).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: i64,
    pub bsize: i64,
    pub sha1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

impl FileRecord {
    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// What this file adds to its table's counters.
    pub fn contribution(&self) -> Counter {
        let (repo_size, repo_bsize) = if self.is_reference() {
            (0, 0)
        } else {
            (self.size, self.bsize)
        };
        Counter {
            size: self.size,
            bsize: self.bsize,
            repo_size,
            repo_bsize,
        }
    }
}

/// Normalize a storage (disk) tag; the default disk is recorded as absent.
pub fn storage_tag(storage: Option<&str>) -> Option<String> {
    match storage {
        None | Some("") | Some("default") => None,
        Some(other) => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    #[default]
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "bad")]
    Bad,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    #[serde(flatten)]
    pub counter: Counter,
    #[serde(default)]
    pub db_dir: String,
    #[serde(default)]
    pub table_dir: String,
    #[serde(default)]
    pub backup_status: BackupStatus,
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    /// Stored schema (DDL) of the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storages: Vec<String>,
}

impl TableRecord {
    pub fn new(db_dir: impl Into<String>, table_dir: impl Into<String>) -> Self {
        Self {
            db_dir: db_dir.into(),
            table_dir: table_dir.into(),
            ..Default::default()
        }
    }

    /// Record a file, replacing any earlier record under the same name.
    pub fn add_file(&mut self, name: impl Into<String>, file: FileRecord) {
        let name = name.into();
        let replaced = match self.files.remove(&name) {
            Some(old) => {
                self.counter.sub(&old.contribution());
                true
            }
            None => false,
        };

        self.counter.add(&file.contribution());
        if let Some(reference) = &file.reference {
            insert_unique(&mut self.reference, reference);
        }
        if let Some(storage) = &file.storage {
            insert_unique(&mut self.storages, storage);
        }
        self.files.insert(name, file);

        if replaced {
            self.rebuild_sets();
        }
    }

    pub fn add_partition(&mut self, partition: impl AsRef<str>) {
        insert_unique(&mut self.partitions, partition.as_ref());
    }

    pub fn add_dir(&mut self, dir: impl AsRef<str>) {
        insert_unique(&mut self.dirs, dir.as_ref());
    }

    pub fn mark_bad(&mut self) {
        self.backup_status = BackupStatus::Bad;
    }

    pub fn is_ok(&self) -> bool {
        self.backup_status == BackupStatus::Ok
    }

    fn rebuild_sets(&mut self) {
        self.reference.clear();
        self.storages.clear();
        for file in self.files.values() {
            if let Some(reference) = &file.reference {
                insert_unique(&mut self.reference, reference);
            }
            if let Some(storage) = &file.storage {
                insert_unique(&mut self.storages, storage);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    #[serde(flatten)]
    pub counter: Counter,
    #[serde(default)]
    pub tables: BTreeMap<String, TableRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference: Vec<String>,
}

impl DatabaseRecord {
    pub fn add_table(&mut self, name: impl Into<String>, table: TableRecord) {
        let name = name.into();
        if let Some(old) = self.tables.remove(&name) {
            self.counter.sub(&old.counter);
        }
        self.counter.add(&table.counter);
        self.tables.insert(name, table);
        self.reference = merged_references(self.tables.values().map(|t| &t.reference));
    }
}

/// The persisted description of one backup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    #[serde(flatten)]
    pub counter: Counter,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    #[serde(default)]
    pub version: u32,
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference: Vec<String>,
    #[serde(default)]
    pub dbs: BTreeMap<String, DatabaseRecord>,
    #[serde(rename = "filter", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter: BackupFilter,
}

impl BackupRecord {
    pub fn new(name: impl Into<String>, kind: BackupKind, filter: BackupFilter, now: DateTime<Utc>) -> Self {
        Self {
            counter: Counter::default(),
            name: name.into(),
            kind,
            version: RECORD_VERSION,
            start_date: now,
            stop_date: None,
            reference: Vec::new(),
            dbs: BTreeMap::new(),
            filter,
        }
    }

    pub fn add_database(&mut self, name: impl Into<String>, db: DatabaseRecord) {
        let name = name.into();
        if let Some(old) = self.dbs.remove(&name) {
            self.counter.sub(&old.counter);
        }
        self.counter.add(&db.counter);
        self.dbs.insert(name, db);
        self.reference = merged_references(self.dbs.values().map(|d| &d.reference));
    }

    pub fn table(&self, db: &str, table: &str) -> Option<&TableRecord> {
        self.dbs.get(db).and_then(|d| d.tables.get(table))
    }

    pub fn file(&self, db: &str, table: &str, name: &str) -> Option<&FileRecord> {
        self.table(db, table).and_then(|t| t.files.get(name))
    }

    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.stop_date = Some(now);
    }

    pub fn is_finished(&self) -> bool {
        self.stop_date.is_some()
    }

    /// Total number of file records across all tables.
    pub fn file_count(&self) -> usize {
        self.dbs
            .values()
            .flat_map(|d| d.tables.values())
            .map(|t| t.files.len())
            .sum()
    }
}

fn insert_unique(set: &mut Vec<String>, item: &str) {
    if !set.iter().any(|s| s == item) {
        set.push(item.to_string());
    }
}

fn merged_references<'a>(sets: impl Iterator<Item = &'a Vec<String>>) -> Vec<String> {
    let mut merged = Vec::new();
    for set in sets {
        for name in set {
            insert_unique(&mut merged, name);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(size: i64, bsize: i64, sha1: &str) -> FileRecord {
        FileRecord {
            size,
            bsize,
            sha1: sha1.to_string(),
            reference: None,
            storage: None,
        }
    }

    fn pointer(size: i64, bsize: i64, sha1: &str, to: &str) -> FileRecord {
        FileRecord {
            reference: Some(to.to_string()),
            ..stored(size, bsize, sha1)
        }
    }

    #[test]
    fn test_table_aggregation() {
        let mut table = TableRecord::new("data/db", "data/db/t");
        table.add_file("p1/a.bin", stored(100, 40, "aa"));
        table.add_file("p1/b.bin", pointer(50, 20, "bb", "20240101_000000F"));
        table.add_file("p2/c.bin", pointer(10, 5, "cc", "20240101_000000F"));

        assert_eq!(table.counter.size, 160);
        assert_eq!(table.counter.bsize, 65);
        assert_eq!(table.counter.repo_size, 100);
        assert_eq!(table.counter.repo_bsize, 40);
        assert_eq!(table.reference, vec!["20240101_000000F".to_string()]);
        assert!(table.counter.is_consistent());
    }

    #[test]
    fn test_replacing_file_withdraws_old_contribution() {
        let mut table = TableRecord::new("d", "t");
        table.add_file("a.bin", pointer(100, 40, "aa", "20240101_000000F"));
        table.add_file("a.bin", stored(120, 50, "ab"));

        assert_eq!(table.files.len(), 1);
        assert_eq!(table.counter.size, 120);
        assert_eq!(table.counter.repo_size, 120);
        assert!(table.reference.is_empty());
    }

    #[test]
    fn test_counters_bubble_up() {
        let mut t1 = TableRecord::new("d", "t1");
        t1.add_file("a", stored(10, 4, "a"));
        let mut t2 = TableRecord::new("d", "t2");
        t2.add_file("b", pointer(20, 8, "b", "20240101_000000F"));
        t2.add_file("c", pointer(30, 9, "c", "20240102_000000I"));

        let mut db = DatabaseRecord::default();
        db.add_table("t1", t1);
        db.add_table("t2", t2);

        let mut backup = BackupRecord::new("20240103_000000I", BackupKind::Incr, BackupFilter::new(), Utc::now());
        backup.add_database("db", db);

        assert_eq!(backup.counter.size, 60);
        assert_eq!(backup.counter.bsize, 21);
        assert_eq!(backup.counter.repo_size, 10);
        assert_eq!(backup.reference.len(), 2);
        assert_eq!(backup.file_count(), 3);
        assert_eq!(backup.file("db", "t2", "c").and_then(|f| f.reference.as_deref()), Some("20240102_000000I"));
        assert!(backup.file("db", "t3", "c").is_none());
    }

    #[test]
    fn test_counter_add_is_associative() {
        let a = Counter { size: 1, bsize: 2, repo_size: 1, repo_bsize: 1 };
        let b = Counter { size: 10, bsize: 20, repo_size: 0, repo_bsize: 0 };
        let c = Counter { size: 100, bsize: 200, repo_size: 50, repo_bsize: 60 };

        let mut left = a;
        left.add(&b);
        left.add(&c);

        let mut bc = b;
        bc.add(&c);
        let mut right = a;
        right.add(&bc);

        assert_eq!(left, right);
    }

    #[test]
    fn test_json_shape() {
        let mut table = TableRecord::new("data/db/", "data/db/t/");
        table.add_file("all_1_1_0/data.bin", stored(7, 3, "ff"));
        let mut db = DatabaseRecord::default();
        db.add_table("t", table);
        let mut backup = BackupRecord::new("20240101_120000F", BackupKind::Full, BackupFilter::new(), Utc::now());
        backup.add_database("db", db);

        let json = serde_json::to_value(&backup).unwrap();
        assert_eq!(json["type"], "full");
        assert_eq!(json["size"], 7);
        assert_eq!(json["repo_bsize"], 3);
        assert!(json.get("stop_date").is_none());
        assert!(json.get("reference").is_none());
        assert!(json.get("filter").is_none());
        let file = &json["dbs"]["db"]["tables"]["t"]["files"]["all_1_1_0/data.bin"];
        assert_eq!(file["sha1"], "ff");
        assert!(file.get("reference").is_none());
        assert_eq!(json["dbs"]["db"]["tables"]["t"]["backup_status"], "OK");

        let back: BackupRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, backup);
    }

    #[test]
    fn test_storage_tag() {
        assert_eq!(storage_tag(Some("default")), None);
        assert_eq!(storage_tag(None), None);
        assert_eq!(storage_tag(Some("cold")), Some("cold".to_string()));
    }
}
