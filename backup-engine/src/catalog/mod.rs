//! The database side of a backup.
//!
//! The engine never talks to the database directly. It asks a [`Catalog`]
//! for databases and tables, for a frozen snapshot of a table to read files
//! from, and on restore for a directory to write files into and a way to
//! attach them.

pub mod shadow;

use crate::model::BackupFilter;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub use shadow::ShadowCatalog;

/// One snapshot root; tables spread over several disks have several.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Disk name; `None` is the default disk.
    pub storage: Option<String>,
    pub root: PathBuf,
}

/// A point-in-time copy of a table, valid until released.
#[derive(Debug, Clone)]
pub struct FrozenTable {
    pub db: String,
    pub table: String,
    pub db_dir: String,
    pub table_dir: String,
    pub partitions: Vec<String>,
    /// Part directories in the snapshot.
    pub dirs: Vec<String>,
    pub snapshots: Vec<Snapshot>,
    /// Statement that recreates the table.
    pub schema: String,
    /// Catalog-specific handle used by `release`.
    pub increment: u64,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn databases(&self) -> Result<Vec<String>>;

    async fn tables(&self, db: &str) -> Result<Vec<String>>;

    /// Freeze a table, or only its parts in `partition`.
    async fn freeze(&self, db: &str, table: &str, partition: Option<&str>) -> Result<FrozenTable>;

    async fn release(&self, frozen: &FrozenTable) -> Result<()>;

    async fn create_database(&self, db: &str) -> Result<()>;

    async fn create_table(&self, db: &str, table: &str, schema: &str) -> Result<()>;

    /// Where restored part directories are written before `attach`.
    fn restore_dir(&self, db: &str, table: &str) -> PathBuf;

    async fn attach(&self, db: &str, table: &str, dirs: &[String]) -> Result<()>;
}

/// Databases and tables to back up: everything when `filter` is empty,
/// otherwise the filter checked against the catalog. A database listed with
/// no tables selects all of its tables.
pub async fn backup_objects(catalog: &dyn Catalog, filter: &BackupFilter) -> Result<BTreeMap<String, Vec<String>>> {
    let databases = catalog.databases().await?;
    let mut objects = BTreeMap::new();

    if filter.is_empty() {
        for db in databases {
            let tables = catalog.tables(&db).await?;
            objects.insert(db, tables);
        }
        return Ok(objects);
    }

    for (db, wanted) in filter {
        if !databases.contains(db) {
            return Err(EngineError::BadFilter(format!("database {db} not found")));
        }
        let tables = catalog.tables(db).await?;
        if wanted.is_empty() {
            objects.insert(db.clone(), tables);
            continue;
        }
        if let Some(missing) = wanted.iter().find(|t| !tables.contains(t)) {
            return Err(EngineError::BadFilter(format!("table {db}.{missing} not found")));
        }
        objects.insert(db.clone(), wanted.clone());
    }
    Ok(objects)
}

/// Parse `db` / `db.table` selectors into a filter.
pub fn parse_filter<S: AsRef<str>>(selectors: &[S]) -> Result<BackupFilter> {
    let mut filter = BackupFilter::new();
    let mut whole = Vec::new();
    for selector in selectors {
        let selector = selector.as_ref();
        match selector.split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() => {
                let tables = filter.entry(db.to_string()).or_default();
                if !tables.iter().any(|t| t == table) {
                    tables.push(table.to_string());
                }
            }
            None if !selector.is_empty() => {
                filter.entry(selector.to_string()).or_default();
                whole.push(selector.to_string());
            }
            _ => return Err(EngineError::BadFilter(format!("cannot parse selector {selector:?}"))),
        }
    }
    // a whole-database selector wins over table selectors
    for db in whole {
        if let Some(tables) = filter.get_mut(&db) {
            tables.clear();
        }
    }
    Ok(filter)
}
