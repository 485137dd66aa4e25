//! Deduplication against earlier backups.
//!
//! A file is stored again only when no backup in the chain already holds the
//! same bytes under the same name. Matches must be originals: a record that
//! is itself a reference is never pointed at, so every reference resolves in
//! one hop.

pub mod chain;

use crate::model::{BackupRecord, FileRecord};
use crate::transfer::pipeline;
use crate::utils::errors::Result;
use std::path::Path;

/// What to do with one snapshot file.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// An identical original exists; record this pointer instead.
    Reference(FileRecord),
    /// Store the file; nothing in the chain matches.
    Transfer,
}

/// Newest unreferenced record for `(db, table, file)` with digest `sha1`.
pub fn find_original<'a>(
    chain: &'a [BackupRecord],
    db: &str,
    table: &str,
    file: &str,
    sha1: &str,
) -> Option<(&'a str, &'a FileRecord)> {
    chain.iter().rev().find_map(|backup| {
        backup
            .file(db, table, file)
            .filter(|record| !record.is_reference() && record.sha1 == sha1)
            .map(|record| (backup.name.as_str(), record))
    })
}

/// Pointer to `original`, stored in backup `owner`.
pub fn reference_to(owner: &str, original: &FileRecord, storage: Option<String>) -> FileRecord {
    FileRecord {
        size: original.size,
        bsize: original.bsize,
        sha1: original.sha1.clone(),
        reference: Some(owner.to_string()),
        storage,
    }
}

/// Hash the local file and look it up in the chain. Makes no backend calls.
pub async fn decide(
    chain: &[BackupRecord],
    db: &str,
    table: &str,
    file: &str,
    source: &Path,
    storage: Option<String>,
) -> Result<Decision> {
    if chain.is_empty() {
        return Ok(Decision::Transfer);
    }
    let (_, sha1) = pipeline::digest_file(source).await?;
    Ok(match find_original(chain, db, table, file, &sha1) {
        Some((owner, original)) => Decision::Reference(reference_to(owner, original, storage)),
        None => Decision::Transfer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackupFilter, BackupKind, DatabaseRecord, TableRecord};
    use chrono::Utc;

    fn backup(name: &str, files: &[(&str, FileRecord)]) -> BackupRecord {
        let mut table = TableRecord::new("db", "db/t");
        for (file, record) in files {
            table.add_file(*file, record.clone());
        }
        let mut db = DatabaseRecord::default();
        db.add_table("t", table);
        let kind = crate::model::naming::kind_of(name).unwrap_or(BackupKind::Full);
        let mut record = BackupRecord::new(name, kind, BackupFilter::new(), Utc::now());
        record.add_database("db", db);
        record
    }

    fn original(sha1: &str) -> FileRecord {
        FileRecord {
            size: 10,
            bsize: 4,
            sha1: sha1.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_match_requires_same_digest_and_original() {
        let pointer = FileRecord {
            reference: Some("20240101_000000F".into()),
            ..original("bb")
        };
        let chain = vec![
            backup("20240101_000000F", &[("a", original("aa")), ("b", original("bb"))]),
            backup("20240102_000000I", &[("a", original("a2")), ("b", pointer)]),
        ];

        let (owner, _) = find_original(&chain, "db", "t", "a", "a2").unwrap();
        assert_eq!(owner, "20240102_000000I");
        let (owner, _) = find_original(&chain, "db", "t", "a", "aa").unwrap();
        assert_eq!(owner, "20240101_000000F");
        // the pointer in the incr is skipped in favour of the original
        let (owner, _) = find_original(&chain, "db", "t", "b", "bb").unwrap();
        assert_eq!(owner, "20240101_000000F");

        assert!(find_original(&chain, "db", "t", "a", "zz").is_none());
        assert!(find_original(&chain, "db", "t2", "a", "aa").is_none());
    }

    #[tokio::test]
    async fn test_decide_hashes_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let sha1 = pipeline::sha1_hex(b"hello");

        let chain = vec![backup("20240101_000000F", &[("a", original(&sha1))])];
        match decide(&chain, "db", "t", "a", &path, None).await.unwrap() {
            Decision::Reference(record) => {
                assert_eq!(record.reference.as_deref(), Some("20240101_000000F"));
                assert_eq!((record.size, record.bsize), (10, 4));
                assert_eq!(record.sha1, sha1);
            }
            Decision::Transfer => panic!("expected a reference"),
        }

        tokio::fs::write(&path, b"changed").await.unwrap();
        assert_eq!(decide(&chain, "db", "t", "a", &path, None).await.unwrap(), Decision::Transfer);
        assert_eq!(decide(&[], "db", "t", "a", &path, None).await.unwrap(), Decision::Transfer);
    }
}
