//! Storage backends.
//!
//! Every backend moves files through the same gzip + SHA-1 [`pipeline`] and
//! exposes one capability set, [`TransportBackend`]. The backend is picked
//! once per run from the tagged storage configuration by [`connect`].

pub mod counting_stream;
pub mod local;
pub mod pipeline;
pub mod progress;
pub mod sftp;
pub mod sftp_pool;
pub mod webdav;

#[cfg(test)]
pub mod memory;

use crate::config::StorageConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub use local::LocalBackend;
pub use sftp::SftpBackend;
pub use webdav::WebDavBackend;

/// Name of the per-backup record file.
pub const BACKUP_RECORD: &str = "backup.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Snapshot file to archive.
    Backup,
    /// Archive to restore directory.
    Restore,
}

/// One file to move.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub direction: Direction,
    pub db: String,
    pub table: String,
    /// Path of the file relative to the table, as recorded in `files`.
    pub file: String,
    /// Snapshot file for a backup, destination file for a restore.
    pub local_path: PathBuf,
    /// Backup whose directory holds the archive.
    pub owner: String,
    /// Digest the restored bytes must match.
    pub expected_sha1: Option<String>,
}

impl TransferJob {
    pub fn backup(owner: &str, db: &str, table: &str, file: &str, source: PathBuf) -> Self {
        Self {
            direction: Direction::Backup,
            db: db.to_string(),
            table: table.to_string(),
            file: file.to_string(),
            local_path: source,
            owner: owner.to_string(),
            expected_sha1: None,
        }
    }

    pub fn restore(owner: &str, db: &str, table: &str, file: &str, dest: PathBuf, sha1: &str) -> Self {
        Self {
            direction: Direction::Restore,
            db: db.to_string(),
            table: table.to_string(),
            file: file.to_string(),
            local_path: dest,
            owner: owner.to_string(),
            expected_sha1: Some(sha1.to_string()),
        }
    }

    /// `<owner>/<db>/<table>/<file>.gz`, relative to the storage root.
    pub fn archive_path(&self) -> String {
        format!("{}/{}/{}/{}.gz", self.owner, self.db, self.table, self.file)
    }

    /// Compare a restored digest with the recorded one.
    pub fn verify(&self, stat: &TransferStat) -> Result<()> {
        match &self.expected_sha1 {
            Some(expected) if !expected.is_empty() && *expected != stat.sha1 => {
                Err(EngineError::DigestMismatch {
                    path: self.archive_path(),
                    expected: expected.clone(),
                    actual: stat.sha1.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Result of one transfer: uncompressed size, compressed size and the digest
/// of the uncompressed bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStat {
    pub size: i64,
    pub bsize: i64,
    pub sha1: String,
}

/// The capability set every storage backend provides.
///
/// Metadata paths are relative to the storage root and use `/` separators.
#[async_trait]
pub trait TransportBackend: Send + Sync {
    /// Short backend tag for logs.
    fn kind(&self) -> &'static str;

    /// Move one file in the job's direction, creating missing directories.
    /// A missing source yields [`EngineError::SourceNotFound`].
    async fn transfer_file(&self, job: &TransferJob) -> Result<TransferStat>;

    async fn read_metadata(&self, path: &str) -> Result<Vec<u8>>;

    async fn write_metadata(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Immediate children of the storage root that are backup names, sorted.
    async fn list_backup_names(&self) -> Result<Vec<String>>;

    /// Remove a backup's whole subtree. Removing a missing backup succeeds.
    async fn delete_backup(&self, name: &str) -> Result<()>;
}

/// Read a metadata file, falling back to its gzip-compressed `<path>.gz`.
pub async fn read_metadata_any(backend: &dyn TransportBackend, path: &str) -> Result<Vec<u8>> {
    match backend.read_metadata(path).await {
        Err(EngineError::SourceNotFound(_)) => {
            let packed = backend.read_metadata(&format!("{path}.gz")).await?;
            pipeline::gunzip(&packed).await
        }
        other => other,
    }
}

/// Build the backend named by the storage configuration and check it can be
/// reached.
pub async fn connect(storage: &StorageConfig, workers: usize, level: u32) -> Result<Arc<dyn TransportBackend>> {
    let backend: Arc<dyn TransportBackend> = match storage {
        StorageConfig::Local(local) => Arc::new(LocalBackend::new(&local.backup_dir, level)),
        StorageConfig::Sftp(sftp) => Arc::new(SftpBackend::connect(sftp.clone(), workers, level).await?),
        StorageConfig::Webdav(dav) => Arc::new(WebDavBackend::new(dav, level)?),
    };
    info!("Using {} storage", backend.kind());
    Ok(backend)
}

pub(crate) fn join_remote(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if root.is_empty() {
        format!("/{path}")
    } else {
        format!("{root}/{path}")
    }
}

/// Parent directory of a `/`-separated path, if any.
pub(crate) fn remote_parent(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx]).filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_path() {
        let job = TransferJob::backup("20240101_000000F", "db", "t", "all_1_1_0/data.bin", PathBuf::from("/x"));
        assert_eq!(job.archive_path(), "20240101_000000F/db/t/all_1_1_0/data.bin.gz");
    }

    #[test]
    fn test_verify_digest() {
        let job = TransferJob::restore("20240101_000000F", "db", "t", "a", PathBuf::from("/x"), "aa");
        let good = TransferStat { size: 1, bsize: 1, sha1: "aa".into() };
        let bad = TransferStat { sha1: "bb".into(), ..good.clone() };

        assert!(job.verify(&good).is_ok());
        let err = job.verify(&bad).unwrap_err();
        assert!(matches!(err, EngineError::DigestMismatch { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_remote_paths() {
        assert_eq!(join_remote("/data/", "/b/backup.json"), "/data/b/backup.json");
        assert_eq!(join_remote("", "b"), "/b");
        assert_eq!(remote_parent("/data/b/x.gz"), Some("/data/b"));
        assert_eq!(remote_parent("x.gz"), None);
    }

    #[tokio::test]
    async fn test_metadata_falls_back_to_gzip() {
        let backend = memory::MemoryBackend::new();
        let packed = pipeline::gzip(b"{}", 6).await.unwrap();
        backend.write_metadata("20240101_000000F/backup.json.gz", &packed).await.unwrap();

        let content = read_metadata_any(&backend, "20240101_000000F/backup.json").await.unwrap();
        assert_eq!(content, b"{}");

        let missing = read_metadata_any(&backend, "20240102_000000F/backup.json").await.unwrap_err();
        assert!(matches!(missing, EngineError::SourceNotFound(_)));
    }
}
