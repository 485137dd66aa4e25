//! Restore run.

use super::metadata;
use crate::context::RunContext;
use crate::model::{naming, BackupFilter, BackupRecord, TableRecord};
use crate::transfer::progress::TableProgress;
use crate::transfer::TransferJob;
use crate::utils::errors::{EngineError, Result};
use crate::utils::status::Failure;
use crate::workerpool::WorkerPool;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Backup to restore; the newest one when absent.
    pub name: Option<String>,
    pub filter: BackupFilter,
}

type Selection<'a> = Vec<(&'a str, Vec<(&'a str, &'a TableRecord)>)>;

/// Restore the selected databases and tables of one backup.
pub async fn run(ctx: &RunContext, options: RestoreOptions) -> Result<BackupRecord> {
    let name = match options.name {
        Some(name) => {
            naming::validate(&name).inspect_err(|_| ctx.fail(Failure::Config))?;
            name
        }
        None => latest(ctx).await.inspect_err(|_| ctx.fail(Failure::Run))?,
    };

    let record = metadata::read_backup(ctx.backend.as_ref(), &name)
        .await
        .inspect_err(|e| {
            error!("Cannot read backup {}: {}", name, e);
            ctx.fail(Failure::Metadata);
            ctx.fail(Failure::Run);
        })?;
    if !record.is_finished() {
        warn!("Backup {} never finished; restoring what it recorded", name);
    }

    let selection = select(&record, &options.filter).inspect_err(|_| ctx.fail(Failure::Config))?;
    info!("Restoring {} backup {} ({} files)", record.kind, name, record.file_count());

    'dbs: for (db, tables) in selection {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if let Err(e) = ctx.catalog.create_database(db).await {
            error!("Cannot create database {}: {}", db, e);
            ctx.fail(Failure::Catalog);
            ctx.fail(Failure::Database);
            continue;
        }
        for (table, table_record) in tables {
            if ctx.cancel.is_cancelled() {
                break 'dbs;
            }
            match restore_table(ctx, &record.name, db, table, table_record).await {
                Ok(()) => {}
                Err(EngineError::Cancelled) => break 'dbs,
                Err(e) => {
                    error!("Restore of {}.{} failed: {}", db, table, e);
                    ctx.fail(Failure::Table);
                }
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        ctx.fail(Failure::Run);
        return Err(EngineError::Cancelled);
    }
    Ok(record)
}

async fn latest(ctx: &RunContext) -> Result<String> {
    ctx.backend
        .list_backup_names()
        .await?
        .pop()
        .ok_or(EngineError::NoPreviousBackups)
}

/// Databases and tables of `record` picked by `filter`; an empty filter
/// picks everything, a name missing from the backup is an error.
fn select<'a>(record: &'a BackupRecord, filter: &BackupFilter) -> Result<Selection<'a>> {
    let all_tables = |tables: &'a std::collections::BTreeMap<String, TableRecord>| {
        tables.iter().map(|(t, r)| (t.as_str(), r)).collect::<Vec<_>>()
    };

    if filter.is_empty() {
        return Ok(record
            .dbs
            .iter()
            .map(|(db, db_record)| (db.as_str(), all_tables(&db_record.tables)))
            .collect());
    }

    let mut selection = Vec::new();
    for (db, wanted) in filter {
        let Some((db, db_record)) = record.dbs.get_key_value(db) else {
            return Err(EngineError::BadFilter(format!("database {db} is not in backup {}", record.name)));
        };
        let tables = if wanted.is_empty() {
            all_tables(&db_record.tables)
        } else {
            wanted
                .iter()
                .map(|table| {
                    db_record
                        .tables
                        .get_key_value(table)
                        .map(|(t, r)| (t.as_str(), r))
                        .ok_or_else(|| EngineError::BadFilter(format!("table {db}.{table} is not in backup {}", record.name)))
                })
                .collect::<Result<Vec<_>>>()?
        };
        selection.push((db.as_str(), tables));
    }
    Ok(selection)
}

/// Stored file and part names must be relative paths without `..`, so that
/// they land under the restore directory.
fn stays_inside(file: &str) -> bool {
    let mut normal = false;
    for component in Path::new(file).components() {
        match component {
            Component::Normal(_) => normal = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    normal
}

async fn restore_table(ctx: &RunContext, name: &str, db: &str, table: &str, record: &TableRecord) -> Result<()> {
    if !record.is_ok() {
        warn!("{}.{} was backed up with errors; restoring what was stored", db, table);
    }

    let schema = match &record.metadata {
        Some(stored) => metadata::read_schema(ctx.backend.as_ref(), name, db, table, Some(stored))
            .await
            .inspect_err(|_| ctx.fail(Failure::Metadata))?,
        None => String::new(),
    };
    ctx.catalog
        .create_table(db, table, &schema)
        .await
        .inspect_err(|_| ctx.fail(Failure::Catalog))?;

    let dest = ctx.catalog.restore_dir(db, table);
    let mut progress = TableProgress::start();
    let mut jobs = Vec::with_capacity(record.files.len());
    for (file, stored) in &record.files {
        if !stays_inside(file) {
            warn!("{}.{}: refusing to restore {:?} outside {}", db, table, file, dest.display());
            progress.record_failure();
            ctx.fail(Failure::File);
            continue;
        }
        let owner = stored.reference.as_deref().unwrap_or(name);
        jobs.push(TransferJob::restore(owner, db, table, file, dest.join(file), &stored.sha1));
    }

    let backend = Arc::clone(&ctx.backend);
    let retry = ctx.retry.clone();
    let cancel = ctx.cancel.clone();
    let pool = WorkerPool::start(ctx.config.worker_pool.pool_options(), ctx.cancel.clone(), move |job: TransferJob| {
        let backend = Arc::clone(&backend);
        let retry = retry.clone();
        let cancel = cancel.clone();
        async move {
            let result = retry
                .run(&cancel, &job.archive_path(), || backend.transfer_file(&job))
                .await;
            (job, result)
        }
    });
    let (tx, mut results) = pool.into_parts();
    tokio::spawn(async move {
        for job in jobs {
            if tx.send(job).await.is_err() {
                break;
            }
        }
    });

    while let Some((job, result)) = results.next().await {
        match result {
            Ok(stat) => progress.record(stat.size, stat.bsize, false),
            Err(EngineError::Cancelled) => {}
            Err(e) => {
                warn!("Cannot restore {}: {}", job.archive_path(), e);
                progress.record_failure();
                ctx.fail(Failure::File);
            }
        }
    }
    results.finish().await;

    if ctx.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    if progress.failed > 0 {
        warn!(
            "{}.{}: {} files failed, parts left in {}",
            db,
            table,
            progress.failed,
            dest.display()
        );
        ctx.fail(Failure::Table);
        return Ok(());
    }

    if let Some(dir) = record.dirs.iter().find(|dir| !stays_inside(dir)) {
        warn!("{}.{}: refusing to attach {:?}, parts left in {}", db, table, dir, dest.display());
        ctx.fail(Failure::Table);
        return Ok(());
    }
    ctx.catalog
        .attach(db, table, &record.dirs)
        .await
        .inspect_err(|_| ctx.fail(Failure::Catalog))?;
    info!("{}.{}: {}", db, table, progress.summary());
    Ok(())
}
