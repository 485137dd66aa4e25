//! Persistence of backup records and table schemas.

use crate::model::{naming, BackupRecord, FileRecord};
use crate::transfer::{pipeline, read_metadata_any, TransportBackend, BACKUP_RECORD};
use crate::utils::errors::{EngineError, Result};
use crate::workerpool::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub fn record_path(name: &str) -> String {
    format!("{name}/{BACKUP_RECORD}")
}

pub fn schema_path(name: &str, db: &str, table: &str) -> String {
    format!("{name}/{db}/{table}.sql")
}

pub async fn read_backup(backend: &dyn TransportBackend, name: &str) -> Result<BackupRecord> {
    naming::validate(name)?;
    let content = read_metadata_any(backend, &record_path(name)).await?;
    let record: BackupRecord = serde_json::from_slice(&content)?;
    if record.name != name {
        warn!("Backup {} describes itself as {}", name, record.name);
    }
    Ok(record)
}

/// Store the record: first as `backup.json.copy`, then under its final name.
pub async fn write_backup(
    backend: &dyn TransportBackend,
    record: &BackupRecord,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let content = serde_json::to_vec_pretty(record)?;
    let path = record_path(&record.name);
    let copy = format!("{path}.copy");

    let (copy_ref, path_ref, body) = (copy.as_str(), path.as_str(), content.as_slice());
    retry
        .run(cancel, &format!("write {path}"), || async move {
            backend.write_metadata(copy_ref, body).await?;
            backend.write_metadata(path_ref, body).await
        })
        .await?;
    debug!("Stored {} ({} bytes)", path, content.len());
    Ok(())
}

/// Store a table's schema and describe it as a file record.
pub async fn write_schema(
    backend: &dyn TransportBackend,
    name: &str,
    db: &str,
    table: &str,
    schema: &str,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<FileRecord> {
    let path = schema_path(name, db, table);
    let path_ref = path.as_str();
    retry
        .run(cancel, &format!("write {path}"), || backend.write_metadata(path_ref, schema.as_bytes()))
        .await?;
    Ok(FileRecord {
        size: schema.len() as i64,
        bsize: schema.len() as i64,
        sha1: pipeline::sha1_hex(schema.as_bytes()),
        reference: None,
        storage: None,
    })
}

/// Read a schema stored by [`write_schema`] and check it against `record`.
pub async fn read_schema(
    backend: &dyn TransportBackend,
    name: &str,
    db: &str,
    table: &str,
    record: Option<&FileRecord>,
) -> Result<String> {
    let path = schema_path(name, db, table);
    let content = read_metadata_any(backend, &path).await?;
    if let Some(expected) = record {
        let actual = pipeline::sha1_hex(&content);
        if !expected.sha1.is_empty() && expected.sha1 != actual {
            return Err(EngineError::DigestMismatch {
                path,
                expected: expected.sha1.clone(),
                actual,
            });
        }
    }
    String::from_utf8(content).map_err(|e| EngineError::Catalog(format!("schema of {db}.{table} is not UTF-8: {e}")))
}

/// Whether a failed [`read_backup`] means the record is missing or corrupt,
/// as opposed to storage being unreachable.
pub fn is_unreadable(err: &EngineError) -> bool {
    matches!(err, EngineError::SourceNotFound(_) | EngineError::Serialization(_))
}

/// Every backup in storage, split into readable records and names whose
/// record is missing or corrupt.
pub struct Inventory {
    pub readable: Vec<BackupRecord>,
    pub unreadable: Vec<String>,
}

/// Read every backup record. Errors other than a missing or corrupt record
/// abort the scan, so a flaky connection never makes a backup look broken.
pub async fn scan(backend: &dyn TransportBackend) -> Result<Inventory> {
    let mut inventory = Inventory {
        readable: Vec::new(),
        unreadable: Vec::new(),
    };
    for name in backend.list_backup_names().await? {
        match read_backup(backend, &name).await {
            Ok(record) => inventory.readable.push(record),
            Err(e) if is_unreadable(&e) => {
                warn!("Backup {} is unreadable: {}", name, e);
                inventory.unreadable.push(name);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackupFilter, BackupKind};
    use crate::transfer::memory::MemoryBackend;
    use chrono::Utc;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_write_then_read_backup() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let record = BackupRecord::new("20240101_000000F", BackupKind::Full, BackupFilter::new(), Utc::now());

        write_backup(&backend, &record, &policy(), &cancel).await.unwrap();

        assert!(backend.object("20240101_000000F/backup.json.copy").is_some());
        let back = read_backup(&backend, "20240101_000000F").await.unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn test_write_retries_transient_failures() {
        struct Flaky {
            inner: MemoryBackend,
            failures: std::sync::atomic::AtomicU32,
        }

        #[async_trait::async_trait]
        impl TransportBackend for Flaky {
            fn kind(&self) -> &'static str {
                "flaky"
            }
            async fn transfer_file(&self, job: &crate::transfer::TransferJob) -> Result<crate::transfer::TransferStat> {
                self.inner.transfer_file(job).await
            }
            async fn read_metadata(&self, path: &str) -> Result<Vec<u8>> {
                self.inner.read_metadata(path).await
            }
            async fn write_metadata(&self, path: &str, content: &[u8]) -> Result<()> {
                let ord = std::sync::atomic::Ordering::SeqCst;
                if self.failures.fetch_update(ord, ord, |n| n.checked_sub(1)).is_ok() {
                    return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into());
                }
                self.inner.write_metadata(path, content).await
            }
            async fn list_backup_names(&self) -> Result<Vec<String>> {
                self.inner.list_backup_names().await
            }
            async fn delete_backup(&self, name: &str) -> Result<()> {
                self.inner.delete_backup(name).await
            }
        }

        let backend = Flaky {
            inner: MemoryBackend::new(),
            failures: std::sync::atomic::AtomicU32::new(2),
        };
        let record = BackupRecord::new("20240101_000000F", BackupKind::Full, BackupFilter::new(), Utc::now());
        write_backup(&backend, &record, &policy(), &CancellationToken::new()).await.unwrap();
        assert!(read_backup(&backend, "20240101_000000F").await.is_ok());
    }

    #[tokio::test]
    async fn test_schema_round_trip() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let schema = "CREATE TABLE db.t (x UInt8) ENGINE = MergeTree ORDER BY x";

        let record = write_schema(&backend, "20240101_000000F", "db", "t", schema, &policy(), &cancel)
            .await
            .unwrap();
        assert_eq!(record.size, schema.len() as i64);
        assert!(backend.object("20240101_000000F/db/t.sql").is_some());

        let back = read_schema(&backend, "20240101_000000F", "db", "t", Some(&record)).await.unwrap();
        assert_eq!(back, schema);

        let tampered = FileRecord { sha1: "00".into(), ..record };
        assert!(read_schema(&backend, "20240101_000000F", "db", "t", Some(&tampered)).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_separates_unreadable() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let record = BackupRecord::new("20240101_000000F", BackupKind::Full, BackupFilter::new(), Utc::now());
        write_backup(&backend, &record, &policy(), &cancel).await.unwrap();
        backend.put("20240102_000000I/backup.json", b"{".to_vec());
        backend.put("20240103_000000I/db/t/a.gz", Vec::new());

        let inventory = scan(&backend).await.unwrap();
        assert_eq!(inventory.readable.len(), 1);
        assert_eq!(inventory.unreadable, vec!["20240102_000000I", "20240103_000000I"]);
    }
}
