//! Backup run.
//!
//! Per table: freeze, store the schema, then an enumerator walks the frozen
//! snapshot and feeds a worker pool while this task drains the results into
//! the table's record. Diff and incr runs hash every file first and store a
//! reference instead of the bytes when the chain already holds them.

use super::{metadata, retention};
use crate::catalog::{self, FrozenTable, Snapshot};
use crate::context::RunContext;
use crate::dedup::{self, Decision};
use crate::fs::walker::{walk_directory_with_callback, WalkOptions};
use crate::model::{naming, storage_tag, BackupFilter, BackupKind, BackupRecord, DatabaseRecord, FileRecord, TableRecord};
use crate::transfer::progress::{format_bytes, TableProgress};
use crate::transfer::{TransferJob, TransportBackend};
use crate::utils::errors::{EngineError, Result};
use crate::utils::status::Failure;
use crate::workerpool::{RetryPolicy, WorkerPool};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub kind: BackupKind,
    /// Explicit backup name; generated from the clock when absent.
    pub name: Option<String>,
    /// Only freeze parts of this partition.
    pub partition: Option<String>,
    /// Overrides the configured filter when not empty.
    pub filter: BackupFilter,
}

impl BackupOptions {
    pub fn new(kind: BackupKind) -> Self {
        Self {
            kind,
            name: None,
            partition: None,
            filter: BackupFilter::new(),
        }
    }
}

fn backup_name(options: &BackupOptions) -> Result<String> {
    match &options.name {
        Some(name) if naming::kind_of(name) == Some(options.kind) => Ok(name.clone()),
        Some(name) => Err(EngineError::InvalidBackupName(name.clone())),
        None => Ok(naming::generate(options.kind, Utc::now())),
    }
}

/// Run one backup and return its stored record.
pub async fn run(ctx: &RunContext, options: BackupOptions) -> Result<BackupRecord> {
    let name = backup_name(&options).inspect_err(|_| ctx.fail(Failure::Config))?;

    let filter = if options.filter.is_empty() {
        ctx.config.filter.clone()
    } else {
        options.filter.clone()
    };
    let objects = match catalog::backup_objects(ctx.catalog.as_ref(), &filter).await {
        Ok(objects) => objects,
        Err(e) => {
            error!("Cannot resolve backup objects: {}", e);
            ctx.fail(Failure::Run);
            ctx.fail(match e {
                EngineError::BadFilter(_) => Failure::Config,
                _ => Failure::Catalog,
            });
            return Err(e);
        }
    };

    let keep = ctx.config.retention.backup_full;
    if keep > 0 {
        if let Err(e) = retention::run(ctx, keep).await {
            warn!("Retention before backup failed: {}", e);
            ctx.fail(Failure::Metadata);
        }
    }

    let chain = if options.kind.needs_chain() {
        ctx.chain(options.kind, &name).await.inspect_err(|e| {
            error!("Cannot start {} backup {}: {}", options.kind, name, e);
            ctx.fail(Failure::Run);
        })?
    } else {
        Arc::new(Vec::new())
    };

    info!("Starting {} backup {}", options.kind, name);
    let mut record = BackupRecord::new(&name, options.kind, filter, Utc::now());

    for (db, tables) in &objects {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let mut db_record = DatabaseRecord::default();
        for table in tables {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match backup_table(ctx, &name, &chain, db, table, options.partition.as_deref()).await {
                Ok(table_record) => db_record.add_table(table, table_record),
                Err(EngineError::Cancelled) => break,
                Err(e) => {
                    error!("Backup of {}.{} failed: {}", db, table, e);
                    ctx.fail(Failure::Table);
                }
            }
        }
        if ctx.cancel.is_cancelled() {
            break;
        }
        record.add_database(db, db_record);
        if let Err(e) = metadata::write_backup(ctx.backend.as_ref(), &record, &ctx.retry, &ctx.cancel).await {
            warn!("Checkpoint of {} after database {} failed: {}", name, db, e);
            ctx.fail(Failure::Metadata);
        }
    }

    if ctx.cancel.is_cancelled() {
        warn!("Backup {} cancelled; its last checkpoint has no stop date", name);
        ctx.fail(Failure::Run);
        return Err(EngineError::Cancelled);
    }

    record.finish(Utc::now());
    metadata::write_backup(ctx.backend.as_ref(), &record, &ctx.retry, &ctx.cancel)
        .await
        .inspect_err(|e| {
            error!("Cannot store record of {}: {}", name, e);
            ctx.fail(Failure::Metadata);
            ctx.fail(Failure::Run);
        })?;

    info!(
        "Backup {} finished: {} files, {} ({} stored by this backup)",
        name,
        record.file_count(),
        format_bytes(record.counter.size.max(0) as u64),
        format_bytes(record.counter.repo_bsize.max(0) as u64),
    );
    Ok(record)
}

async fn backup_table(
    ctx: &RunContext,
    name: &str,
    chain: &Arc<Vec<BackupRecord>>,
    db: &str,
    table: &str,
    partition: Option<&str>,
) -> Result<TableRecord> {
    let frozen = ctx
        .catalog
        .freeze(db, table, partition)
        .await
        .inspect_err(|_| ctx.fail(Failure::Catalog))?;

    let result = store_table(ctx, name, chain, &frozen).await;

    if let Err(e) = ctx.catalog.release(&frozen).await {
        warn!("Cannot release snapshot of {}.{}: {}", db, table, e);
        ctx.fail(Failure::Catalog);
    }
    result
}

async fn store_table(
    ctx: &RunContext,
    name: &str,
    chain: &Arc<Vec<BackupRecord>>,
    frozen: &FrozenTable,
) -> Result<TableRecord> {
    let (db, table) = (frozen.db.as_str(), frozen.table.as_str());
    let mut table_record = TableRecord::new(&frozen.db_dir, &frozen.table_dir);
    for partition in &frozen.partitions {
        table_record.add_partition(partition);
    }
    for dir in &frozen.dirs {
        table_record.add_dir(dir);
    }

    let backend = ctx.backend.as_ref();
    match metadata::write_schema(backend, name, db, table, &frozen.schema, &ctx.retry, &ctx.cancel).await {
        Ok(schema) => table_record.metadata = Some(schema),
        Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
        Err(e) => {
            warn!("Cannot store schema of {}.{}: {}", db, table, e);
            ctx.fail(Failure::Metadata);
            table_record.mark_bad();
        }
    }

    let task = Arc::new(FileTask {
        backend: Arc::clone(&ctx.backend),
        chain: Arc::clone(chain),
        retry: ctx.retry.clone(),
        cancel: ctx.cancel.clone(),
        owner: name.to_string(),
        db: db.to_string(),
        table: table.to_string(),
    });
    let pool = WorkerPool::start(ctx.config.worker_pool.pool_options(), ctx.cancel.clone(), move |job: FileJob| {
        let task = Arc::clone(&task);
        async move {
            let result = task.run(&job).await;
            (job.file, result)
        }
    });
    let (jobs, mut results) = pool.into_parts();
    let enumerator = spawn_enumerator(frozen.snapshots.clone(), jobs, ctx.cancel.clone());

    let mut progress = TableProgress::start();
    while let Some((file, result)) = results.next().await {
        match result {
            Ok(record) => {
                progress.record(record.size, record.bsize, record.is_reference());
                table_record.add_file(file, record);
            }
            Err(EngineError::Cancelled) => {}
            Err(e) => {
                warn!("File {} of {}.{} failed: {}", file, db, table, e);
                progress.record_failure();
                ctx.fail(Failure::File);
                table_record.mark_bad();
            }
        }
    }
    let processed = results.finish().await;

    match enumerator.await {
        Ok(Ok(queued)) => debug!("{}.{}: {} files queued, {} processed", db, table, queued, processed),
        Ok(Err(e)) => {
            warn!("Walking snapshot of {}.{} failed: {}", db, table, e);
            ctx.fail(Failure::Table);
            table_record.mark_bad();
        }
        Err(e) => {
            warn!("Enumerator of {}.{} failed: {}", db, table, e);
            ctx.fail(Failure::Table);
            table_record.mark_bad();
        }
    }

    if ctx.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    info!("{}.{}: {}", db, table, progress.summary());
    Ok(table_record)
}

/// One snapshot file handed to the pool.
struct FileJob {
    /// Path relative to the snapshot root.
    file: String,
    source: PathBuf,
    storage: Option<String>,
}

/// What every worker of a table shares.
struct FileTask {
    backend: Arc<dyn TransportBackend>,
    chain: Arc<Vec<BackupRecord>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    owner: String,
    db: String,
    table: String,
}

impl FileTask {
    async fn run(&self, job: &FileJob) -> Result<FileRecord> {
        if !self.chain.is_empty() {
            let decision = self
                .retry
                .run(&self.cancel, &format!("hash {}", job.source.display()), || {
                    dedup::decide(&self.chain, &self.db, &self.table, &job.file, &job.source, job.storage.clone())
                })
                .await?;
            if let Decision::Reference(record) = decision {
                debug!("{} is unchanged since {:?}", job.file, record.reference);
                return Ok(record);
            }
        }

        let transfer = TransferJob::backup(&self.owner, &self.db, &self.table, &job.file, job.source.clone());
        let stat = self
            .retry
            .run(&self.cancel, &transfer.archive_path(), || self.backend.transfer_file(&transfer))
            .await?;
        Ok(FileRecord {
            size: stat.size,
            bsize: stat.bsize,
            sha1: stat.sha1,
            reference: None,
            storage: job.storage.clone(),
        })
    }
}

/// Walk every snapshot root on a blocking thread and queue its files. The
/// input queue closes when the returned task ends.
fn spawn_enumerator(
    snapshots: Vec<Snapshot>,
    jobs: mpsc::Sender<FileJob>,
    cancel: CancellationToken,
) -> JoinHandle<std::io::Result<usize>> {
    tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
        let mut queued = 0usize;
        for snapshot in snapshots {
            let storage = storage_tag(snapshot.storage.as_deref());
            let mut closed = false;
            walk_directory_with_callback(&snapshot.root, WalkOptions::default(), |file| {
                if cancel.is_cancelled() {
                    return false;
                }
                let job = FileJob {
                    file: file.relative_path.clone(),
                    source: file.path.clone(),
                    storage: storage.clone(),
                };
                if jobs.blocking_send(job).is_err() {
                    closed = true;
                    return false;
                }
                queued += 1;
                true
            })?;
            if closed || cancel.is_cancelled() {
                break;
            }
        }
        Ok(queued)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::testing::{context_over, memory_context, test_config};
    use crate::transfer::memory::MemoryBackend;
    use std::fs;
    use std::path::Path;

    pub const FULL: &str = "20240101_000000F";
    pub const INCR: &str = "20240102_000000I";

    /// `db.t` with two parts and a schema, `db.u` with one part.
    pub fn seed_tables(root: &Path) {
        let table = root.join("data/db/t");
        fs::create_dir_all(table.join("202401_1_1_0")).unwrap();
        fs::create_dir_all(table.join("202402_2_2_0")).unwrap();
        fs::write(table.join("202401_1_1_0/data.bin"), b"january january january").unwrap();
        fs::write(table.join("202401_1_1_0/checksums.txt"), b"sums for january").unwrap();
        fs::write(table.join("202402_2_2_0/data.bin"), b"february").unwrap();
        fs::write(root.join("data/db/t.sql"), "CREATE TABLE db.t (x UInt8)").unwrap();

        let other = root.join("data/db/u/all_1_1_0");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("data.bin"), b"u").unwrap();
    }

    pub fn named(kind: BackupKind, name: &str) -> BackupOptions {
        BackupOptions {
            name: Some(name.to_string()),
            ..BackupOptions::new(kind)
        }
    }

    #[tokio::test]
    async fn test_full_backup_stores_every_file() {
        let dir = tempfile::tempdir().unwrap();
        seed_tables(dir.path());
        let (ctx, backend) = memory_context(dir.path());

        let record = run(&ctx, named(BackupKind::Full, FULL)).await.unwrap();

        assert!(ctx.status.is_clean(), "{:?}", ctx.status.raised());
        assert_eq!(record.file_count(), 4);
        assert!(record.is_finished());
        assert_eq!(record.counter.size, record.counter.repo_size);
        assert!(backend.object("20240101_000000F/db/t/202402_2_2_0/data.bin.gz").is_some());
        assert!(backend.object("20240101_000000F/db/t.sql").is_some());

        let table = record.table("db", "t").unwrap();
        assert!(table.is_ok());
        assert_eq!(table.dirs, vec!["202401_1_1_0", "202402_2_2_0"]);
        assert_eq!(table.partitions, vec!["202401", "202402"]);
        assert!(table.metadata.is_some());
        assert_eq!(table.table_dir, "data/db/t/");

        let stored = metadata::read_backup(&*backend, FULL).await.unwrap();
        assert_eq!(stored, record);
        // snapshots are released
        assert!(!dir.path().join("shadow/1").exists());
    }

    #[tokio::test]
    async fn test_incr_references_unchanged_files() {
        let dir = tempfile::tempdir().unwrap();
        seed_tables(dir.path());
        let backend = Arc::new(MemoryBackend::new());

        let ctx = context_over(dir.path(), backend.clone(), test_config(dir.path()));
        run(&ctx, named(BackupKind::Full, FULL)).await.unwrap();
        let after_full = backend.transfers().len();
        assert_eq!(after_full, 4);

        fs::write(dir.path().join("data/db/t/202402_2_2_0/data.bin"), b"february, revised").unwrap();

        let ctx = context_over(dir.path(), backend.clone(), test_config(dir.path()));
        let record = run(&ctx, named(BackupKind::Incr, INCR)).await.unwrap();
        assert!(ctx.status.is_clean());

        // only the changed file touched the backend
        let transfers = backend.transfers();
        assert_eq!(&transfers[after_full..], ["20240102_000000I/db/t/202402_2_2_0/data.bin.gz"]);

        let unchanged = record.file("db", "t", "202401_1_1_0/data.bin").unwrap();
        assert_eq!(unchanged.reference.as_deref(), Some(FULL));
        let full = metadata::read_backup(&*backend, FULL).await.unwrap();
        let original = full.file("db", "t", "202401_1_1_0/data.bin").unwrap();
        assert_eq!((unchanged.size, unchanged.bsize), (original.size, original.bsize));

        let changed = record.file("db", "t", "202402_2_2_0/data.bin").unwrap();
        assert!(changed.reference.is_none());
        assert_eq!(record.reference, vec![FULL]);
        assert!(record.counter.repo_size < record.counter.size);
    }

    #[tokio::test]
    async fn test_diff_needs_a_full() {
        let dir = tempfile::tempdir().unwrap();
        seed_tables(dir.path());
        let (ctx, backend) = memory_context(dir.path());

        let err = run(&ctx, BackupOptions::new(BackupKind::Diff)).await.unwrap_err();
        assert!(matches!(err, EngineError::NoPreviousBackups));
        assert!(ctx.status.is_raised(Failure::Run));
        assert!(backend.paths().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_table_in_filter() {
        let dir = tempfile::tempdir().unwrap();
        seed_tables(dir.path());
        let (ctx, _backend) = memory_context(dir.path());

        let mut options = BackupOptions::new(BackupKind::Full);
        options.filter = catalog::parse_filter(&["db.missing"]).unwrap();
        assert!(matches!(run(&ctx, options).await, Err(EngineError::BadFilter(_))));
        assert!(ctx.status.is_raised(Failure::Config));
    }

    #[tokio::test]
    async fn test_filter_and_partition() {
        let dir = tempfile::tempdir().unwrap();
        seed_tables(dir.path());
        let (ctx, _backend) = memory_context(dir.path());

        let mut options = named(BackupKind::Part, "20240101_000000P");
        options.filter = catalog::parse_filter(&["db.t"]).unwrap();
        options.partition = Some("202402".to_string());
        let record = run(&ctx, options).await.unwrap();

        assert!(record.table("db", "u").is_none());
        let table = record.table("db", "t").unwrap();
        assert_eq!(table.files.keys().collect::<Vec<_>>(), ["202402_2_2_0/data.bin"]);
        assert_eq!(record.filter["db"], vec!["t"]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        seed_tables(dir.path());
        let (ctx, backend) = memory_context(dir.path());
        backend.fail_next(2);

        let record = run(&ctx, named(BackupKind::Full, FULL)).await.unwrap();
        assert_eq!(record.file_count(), 4);
        assert!(ctx.status.is_clean());
        assert_eq!(backend.transfers().len(), 6);
    }

    #[tokio::test]
    async fn test_name_must_match_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _backend) = memory_context(dir.path());
        let err = run(&ctx, named(BackupKind::Full, INCR)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidBackupName(_)));
        assert!(ctx.status.is_raised(Failure::Config));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        seed_tables(dir.path());
        let (ctx, _backend) = memory_context(dir.path());
        ctx.cancel.cancel();

        assert!(matches!(run(&ctx, named(BackupKind::Full, FULL)).await, Err(EngineError::Cancelled)));
        assert!(ctx.status.is_raised(Failure::Run));
    }
}
