//! Retention run: remove backups that cannot be restored and fulls beyond
//! the configured count, together with everything depending on them.

use super::metadata;
use crate::context::RunContext;
use crate::retention::RetentionGraph;
use crate::transfer::TransportBackend;
use crate::utils::errors::{EngineError, Result};
use crate::utils::status::Failure;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Names to delete, grouped by reason.
#[derive(Debug, Default, PartialEq)]
pub struct RetentionPlan {
    /// Record missing or corrupt.
    pub unreadable: Vec<String>,
    /// A dependency is missing or itself bad.
    pub bad_deps: Vec<String>,
    /// Fulls beyond the kept count and their dependents.
    pub expired: Vec<String>,
}

impl RetentionPlan {
    /// Every name in deletion order, each once.
    pub fn deletions(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.unreadable
            .iter()
            .chain(&self.bad_deps)
            .chain(&self.expired)
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Build the plan from what is stored now. `keep == 0` disables the
/// count-based part.
pub async fn plan(backend: &dyn TransportBackend, keep: usize) -> Result<RetentionPlan> {
    let inventory = metadata::scan(backend).await?;
    let graph = RetentionGraph::from_records(&inventory.readable);
    let expired = if keep > 0 {
        graph.backups_for_delete(keep)
    } else {
        Vec::new()
    };
    Ok(RetentionPlan {
        unreadable: inventory.unreadable,
        bad_deps: graph.bad_deps(),
        expired,
    })
}

/// Apply the plan and return the names actually deleted.
pub async fn run(ctx: &RunContext, keep: usize) -> Result<Vec<String>> {
    let plan = plan(ctx.backend.as_ref(), keep).await.inspect_err(|e| {
        warn!("Cannot scan backups for retention: {}", e);
        ctx.fail(Failure::Metadata);
    })?;

    let mut deleted = Vec::new();
    for name in plan.deletions() {
        let target = name.as_str();
        match ctx
            .retry
            .run(&ctx.cancel, &format!("delete {name}"), || ctx.backend.delete_backup(target))
            .await
        {
            Ok(()) => {
                info!("Deleted backup {}", name);
                deleted.push(name);
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                warn!("Cannot delete backup {}: {}", name, e);
                ctx.fail(Failure::Metadata);
            }
        }
    }
    if deleted.is_empty() {
        info!("Retention: nothing to delete");
    }
    Ok(deleted)
}
