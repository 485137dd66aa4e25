//! In-memory backend that records every call, for tests.

use super::{pipeline, Direction, TransferJob, TransferStat, TransportBackend};
use crate::model::naming;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    transfers: Mutex<Vec<String>>,
    failures: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` transfers fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Archive paths of every transfer attempted, in call order.
    pub fn transfers(&self) -> Vec<String> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn put(&self, path: &str, content: Vec<u8>) {
        self.objects.lock().unwrap().insert(path.to_string(), content);
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TransportBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn transfer_file(&self, job: &TransferJob) -> Result<TransferStat> {
        let path = job.archive_path();
        self.transfers.lock().unwrap().push(path.clone());
        if self.take_failure() {
            return Err(EngineError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "injected")));
        }

        match job.direction {
            Direction::Backup => {
                let source = tokio::fs::File::open(&job.local_path)
                    .await
                    .map_err(|e| EngineError::from_io(e, job.local_path.display().to_string()))?;
                let mut archive = Vec::new();
                let stat = pipeline::compress(source, &mut archive, 6).await?;
                self.put(&path, archive);
                Ok(stat)
            }
            Direction::Restore => {
                let archive = self.object(&path).ok_or_else(|| EngineError::SourceNotFound(path.clone()))?;
                if let Some(parent) = job.local_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut dest = tokio::fs::File::create(&job.local_path).await?;
                let stat = pipeline::decompress(&archive[..], &mut dest).await?;
                job.verify(&stat)?;
                Ok(stat)
            }
        }
    }

    async fn read_metadata(&self, path: &str) -> Result<Vec<u8>> {
        self.object(path).ok_or_else(|| EngineError::SourceNotFound(path.to_string()))
    }

    async fn write_metadata(&self, path: &str, content: &[u8]) -> Result<()> {
        self.put(path, content.to_vec());
        Ok(())
    }

    async fn list_backup_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .paths()
            .iter()
            .filter_map(|p| p.split('/').next())
            .filter(|n| naming::is_backup_name(n))
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn delete_backup(&self, name: &str) -> Result<()> {
        naming::validate(name)?;
        let prefix = format!("{name}/");
        self.objects.lock().unwrap().retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }
}
