//! Listing of stored backups.

use super::metadata;
use crate::context::RunContext;
use crate::model::BackupRecord;
use crate::transfer::progress::format_bytes;
use crate::transfer::TransportBackend;
use crate::utils::errors::Result;
use crate::utils::status::Failure;
use tracing::warn;

#[derive(Debug)]
pub enum BackupInfo {
    Readable(BackupRecord),
    Unreadable { name: String, reason: String },
}

impl BackupInfo {
    pub fn name(&self) -> &str {
        match self {
            BackupInfo::Readable(record) => &record.name,
            BackupInfo::Unreadable { name, .. } => name,
        }
    }

    /// One line for the `info` command.
    pub fn describe(&self) -> String {
        match self {
            BackupInfo::Readable(record) => {
                let state = if record.is_finished() { "done" } else { "incomplete" };
                let references = if record.reference.is_empty() {
                    "-".to_string()
                } else {
                    record.reference.join(",")
                };
                format!(
                    "{}  {:<4}  {:<10}  {:>6} files  {:>10} -> {:>10}  stored {:>10}  refs {}",
                    record.name,
                    record.kind.as_str(),
                    state,
                    record.file_count(),
                    format_bytes(record.counter.size.max(0) as u64),
                    format_bytes(record.counter.bsize.max(0) as u64),
                    format_bytes(record.counter.repo_bsize.max(0) as u64),
                    references,
                )
            }
            BackupInfo::Unreadable { name, reason } => format!("{name}  unreadable: {reason}"),
        }
    }
}

/// Every backup in storage, oldest first.
pub async fn list(backend: &dyn TransportBackend) -> Result<Vec<BackupInfo>> {
    let mut infos = Vec::new();
    for name in backend.list_backup_names().await? {
        match metadata::read_backup(backend, &name).await {
            Ok(record) => infos.push(BackupInfo::Readable(record)),
            Err(e) if metadata::is_unreadable(&e) => infos.push(BackupInfo::Unreadable {
                name,
                reason: e.to_string(),
            }),
            Err(e) => return Err(e),
        }
    }
    Ok(infos)
}

pub async fn run(ctx: &RunContext) -> Result<Vec<BackupInfo>> {
    let infos = list(ctx.backend.as_ref()).await.inspect_err(|_| ctx.fail(Failure::Run))?;
    for info in &infos {
        if let BackupInfo::Unreadable { name, reason } = info {
            warn!("Backup {} is unreadable: {}", name, reason);
            ctx.fail(Failure::Metadata);
        }
    }
    Ok(infos)
}
