//! Per-invocation state shared by the orchestrators.

use crate::catalog::{Catalog, ShadowCatalog};
use crate::config::Config;
use crate::dedup::chain;
use crate::model::{BackupKind, BackupRecord};
use crate::transfer::{self, TransportBackend};
use crate::utils::errors::Result;
use crate::utils::status::{Failure, RunStatus};
use crate::workerpool::RetryPolicy;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Everything one run needs. Built once, passed by reference.
pub struct RunContext {
    pub config: Arc<Config>,
    pub backend: Arc<dyn TransportBackend>,
    pub catalog: Arc<dyn Catalog>,
    pub status: RunStatus,
    pub cancel: CancellationToken,
    pub retry: RetryPolicy,
    chain: OnceCell<Arc<Vec<BackupRecord>>>,
}

impl RunContext {
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn TransportBackend>,
        catalog: Arc<dyn Catalog>,
        cancel: CancellationToken,
    ) -> Self {
        let retry = config.worker_pool.retry_policy();
        Self {
            config,
            backend,
            catalog,
            status: RunStatus::new(),
            cancel,
            retry,
            chain: OnceCell::new(),
        }
    }

    /// Connect the configured storage and open the configured catalog.
    pub async fn connect(config: Config, cancel: CancellationToken) -> Result<Self> {
        let backend = transfer::connect(&config.storage, config.worker_pool.workers(), config.compression.level).await?;
        let catalog = Arc::new(ShadowCatalog::new(&config.catalog.data_dir, &config.catalog.shadow_dir));
        Ok(Self::new(Arc::new(config), backend, catalog, cancel))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Previous backups for a `kind` run named `current`, resolved on first
    /// use and reused for the rest of the run.
    pub async fn chain(&self, kind: BackupKind, current: &str) -> Result<Arc<Vec<BackupRecord>>> {
        let chain = self
            .chain
            .get_or_try_init(|| async {
                chain::resolve(self.backend.as_ref(), kind, current).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(chain))
    }

    pub fn fail(&self, failure: Failure) {
        self.status.raise(failure);
    }
}
