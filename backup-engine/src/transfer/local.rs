//! Local filesystem backend.

use super::{pipeline, Direction, TransferJob, TransferStat, TransportBackend};
use crate::model::naming;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub struct LocalBackend {
    root: PathBuf,
    level: u32,
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>, level: u32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            level,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl TransportBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn transfer_file(&self, job: &TransferJob) -> Result<TransferStat> {
        let archive = self.resolve(&job.archive_path());
        match job.direction {
            Direction::Backup => {
                let source = fs::File::open(&job.local_path)
                    .await
                    .map_err(|e| EngineError::from_io(e, job.local_path.display().to_string()))?;
                create_parent(&archive).await?;
                let mut dest = fs::File::create(&archive).await?;
                let stat = pipeline::compress(source, &mut dest, self.level).await?;
                dest.sync_all().await?;
                debug!("Stored {} ({} -> {} bytes)", archive.display(), stat.size, stat.bsize);
                Ok(stat)
            }
            Direction::Restore => {
                let source = fs::File::open(&archive)
                    .await
                    .map_err(|e| EngineError::from_io(e, archive.display().to_string()))?;
                create_parent(&job.local_path).await?;
                let mut dest = fs::File::create(&job.local_path).await?;
                let stat = pipeline::decompress(source, &mut dest).await?;
                job.verify(&stat)?;
                Ok(stat)
            }
        }
    }

    async fn read_metadata(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        fs::read(&full)
            .await
            .map_err(|e| EngineError::from_io(e, full.display().to_string()))
    }

    async fn write_metadata(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        create_parent(&full).await?;
        fs::write(&full, content).await?;
        Ok(())
    }

    async fn list_backup_names(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if naming::is_backup_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_backup(&self, name: &str) -> Result<()> {
        naming::validate(name)?;
        match fs::remove_dir_all(self.root.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
