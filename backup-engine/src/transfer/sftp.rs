//! SFTP backend.
//!
//! ssh2 is blocking, so every remote call runs in `spawn_blocking` with a
//! pooled session. File bodies are bridged to the async gzip pipeline with
//! [`SyncIoBridge`].

use super::sftp_pool::{self, SftpPool};
use super::{join_remote, pipeline, remote_parent, Direction, TransferJob, TransferStat, TransportBackend};
use crate::config::SftpStorage;
use crate::model::naming;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::io::{Read, Write};
use std::path::Path;
use tokio::fs;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info};

// LIBSSH2_FX_NO_SUCH_FILE
const SFTP_NO_SUCH_FILE: i32 = 2;
const BRIDGE_BUFFER: usize = 256 * 1024;

pub struct SftpBackend {
    pool: SftpPool,
    root: String,
    level: u32,
}

fn is_missing(err: &ssh2::Error) -> bool {
    err.code() == ssh2::ErrorCode::SFTP(SFTP_NO_SUCH_FILE)
}

fn map_missing(err: ssh2::Error, what: &str) -> EngineError {
    if is_missing(&err) {
        EngineError::SourceNotFound(what.to_string())
    } else {
        EngineError::Ssh(err)
    }
}

/// `mkdir -p` over SFTP.
fn make_dirs(sftp: &ssh2::Sftp, dir: &str) -> Result<()> {
    let mut current = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        let path = Path::new(&current);
        if sftp.stat(path).is_ok() {
            continue;
        }
        if let Err(e) = sftp.mkdir(path, 0o755) {
            // another worker may have created it meanwhile
            if sftp.stat(path).is_err() {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

fn remove_tree(sftp: &ssh2::Sftp, dir: &Path) -> Result<()> {
    for (path, stat) in sftp.readdir(dir)? {
        if stat.is_dir() {
            remove_tree(sftp, &path)?;
        } else {
            sftp.unlink(&path)?;
        }
    }
    sftp.rmdir(dir)?;
    Ok(())
}

impl SftpBackend {
    /// Build the pool and open one session to fail fast on bad settings.
    pub async fn connect(settings: SftpStorage, workers: usize, level: u32) -> Result<Self> {
        let root = settings.backup_dir.trim_end_matches('/').to_string();
        let host = settings.hostname.clone();
        let pool = tokio::task::spawn_blocking(move || {
            let pool = sftp_pool::create_pool(settings, workers)?;
            drop(sftp_pool::checkout(&pool)?);
            Ok::<_, EngineError>(pool)
        })
        .await??;
        info!(host = %host, root = %root, "Connected to SFTP storage");
        Ok(Self { pool, root, level })
    }

    fn remote(&self, path: &str) -> String {
        join_remote(&self.root, path)
    }

    async fn store(&self, job: &TransferJob) -> Result<TransferStat> {
        let source = fs::File::open(&job.local_path)
            .await
            .map_err(|e| EngineError::from_io(e, job.local_path.display().to_string()))?;
        let (encoder, probe) = pipeline::encoder(source, self.level);
        let mut body = SyncIoBridge::new(encoder);

        let pool = self.pool.clone();
        let remote = self.remote(&job.archive_path());
        let bsize = tokio::task::spawn_blocking(move || {
            let conn = sftp_pool::checkout(&pool)?;
            if let Some(parent) = remote_parent(&remote) {
                make_dirs(&conn.sftp, parent)?;
            }
            let mut file = conn.sftp.create(Path::new(&remote))?;
            let written = std::io::copy(&mut body, &mut file)?;
            file.flush()?;
            Ok::<_, EngineError>(written)
        })
        .await??;

        Ok(TransferStat {
            size: probe.bytes() as i64,
            bsize: bsize as i64,
            sha1: probe.hex_digest(),
        })
    }

    async fn fetch(&self, job: &TransferJob) -> Result<TransferStat> {
        let (reader, writer) = tokio::io::duplex(BRIDGE_BUFFER);
        let mut sink = SyncIoBridge::new(writer);

        let pool = self.pool.clone();
        let archive = job.archive_path();
        let remote = self.remote(&archive);
        let download = tokio::task::spawn_blocking(move || {
            let conn = sftp_pool::checkout(&pool)?;
            let mut file = conn
                .sftp
                .open(Path::new(&remote))
                .map_err(|e| map_missing(e, &archive))?;
            let copied = std::io::copy(&mut file, &mut sink)?;
            sink.shutdown()?;
            Ok::<_, EngineError>(copied)
        });

        if let Some(parent) = job.local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut dest = fs::File::create(&job.local_path).await?;
        let unpacked = pipeline::decompress(reader, &mut dest).await;

        // a failed download looks like a truncated stream to the decoder and
        // a corrupt archive looks like a broken pipe to the download
        let downloaded = download.await?;
        let stat = match (downloaded, unpacked) {
            (Ok(_), Ok(stat)) => stat,
            (Err(e @ EngineError::SourceNotFound(_)), _) => return Err(e),
            (_, Err(e)) => return Err(e),
            (Err(e), Ok(_)) => return Err(e),
        };
        job.verify(&stat)?;
        Ok(stat)
    }
}

#[async_trait]
impl TransportBackend for SftpBackend {
    fn kind(&self) -> &'static str {
        "sftp"
    }

    async fn transfer_file(&self, job: &TransferJob) -> Result<TransferStat> {
        let stat = match job.direction {
            Direction::Backup => self.store(job).await?,
            Direction::Restore => self.fetch(job).await?,
        };
        debug!("sftp {:?} {} ({} bytes)", job.direction, job.archive_path(), stat.size);
        Ok(stat)
    }

    async fn read_metadata(&self, path: &str) -> Result<Vec<u8>> {
        let pool = self.pool.clone();
        let remote = self.remote(path);
        let what = path.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let conn = sftp_pool::checkout(&pool)?;
            let mut file = conn.sftp.open(Path::new(&remote)).map_err(|e| map_missing(e, &what))?;
            let mut content = Vec::new();
            file.read_to_end(&mut content)?;
            Ok(content)
        })
        .await?
    }

    async fn write_metadata(&self, path: &str, content: &[u8]) -> Result<()> {
        let pool = self.pool.clone();
        let remote = self.remote(path);
        let content = content.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = sftp_pool::checkout(&pool)?;
            if let Some(parent) = remote_parent(&remote) {
                make_dirs(&conn.sftp, parent)?;
            }
            let mut file = conn.sftp.create(Path::new(&remote))?;
            file.write_all(&content)?;
            file.flush()?;
            Ok(())
        })
        .await?
    }

    async fn list_backup_names(&self) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        let root = if self.root.is_empty() { "/".to_string() } else { self.root.clone() };
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = sftp_pool::checkout(&pool)?;
            let entries = match conn.sftp.readdir(Path::new(&root)) {
                Ok(entries) => entries,
                Err(e) if is_missing(&e) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut names: Vec<String> = entries
                .into_iter()
                .filter(|(_, stat)| stat.is_dir())
                .filter_map(|(path, _)| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
                .filter(|name| naming::is_backup_name(name))
                .collect();
            names.sort();
            Ok(names)
        })
        .await?
    }

    async fn delete_backup(&self, name: &str) -> Result<()> {
        naming::validate(name)?;
        let pool = self.pool.clone();
        let dir = self.remote(name);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = sftp_pool::checkout(&pool)?;
            match conn.sftp.stat(Path::new(&dir)) {
                Err(e) if is_missing(&e) => Ok(()),
                Err(e) => Err(e.into()),
                Ok(_) => remove_tree(&conn.sftp, Path::new(&dir)),
            }
        })
        .await?
    }
}
