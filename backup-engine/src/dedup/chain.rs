//! Chain resolution: which earlier backups a diff or incr run deduplicates
//! against.
//!
//! Backup names sort chronologically, so the nearest readable full backup is
//! the last full name in the listing. A diff chain is that full alone; an
//! incr chain adds every diff/incr name after it, up to the next full.

use crate::executor::metadata;
use crate::model::{naming, BackupKind, BackupRecord};
use crate::transfer::TransportBackend;
use crate::utils::errors::{EngineError, Result};
use tracing::{info, warn};

/// Resolve the chain for a run of `kind` named `current`, oldest first.
/// Part and full runs have an empty chain.
pub async fn resolve(backend: &dyn TransportBackend, kind: BackupKind, current: &str) -> Result<Vec<BackupRecord>> {
    if !kind.needs_chain() {
        return Ok(Vec::new());
    }

    let names: Vec<String> = backend
        .list_backup_names()
        .await?
        .into_iter()
        .filter(|name| name != current)
        .collect();

    let mut chain = Vec::new();
    let mut full_pos = None;
    for (pos, name) in names.iter().enumerate().rev() {
        if !naming::is_full(name) {
            continue;
        }
        match metadata::read_backup(backend, name).await {
            Ok(record) => {
                chain.push(record);
                full_pos = Some(pos);
                break;
            }
            Err(e) => warn!("Skipping unreadable full backup {}: {}", name, e),
        }
    }
    let Some(full_pos) = full_pos else {
        return Err(EngineError::NoPreviousBackups);
    };

    if kind == BackupKind::Incr {
        for name in &names[full_pos + 1..] {
            match naming::kind_of(name) {
                Some(BackupKind::Full) => break,
                Some(BackupKind::Diff) | Some(BackupKind::Incr) => match metadata::read_backup(backend, name).await {
                    Ok(record) => chain.push(record),
                    Err(e) => warn!("Skipping unreadable backup {}: {}", name, e),
                },
                _ => {}
            }
        }
    }

    info!(
        "Previous backups for {} run: {}",
        kind,
        chain.iter().map(|b| b.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(chain)
}
