//! Catalog over a plain on-disk table layout.
//!
//! ```text
//! <data_dir>/<db>/<table>.sql          schema
//! <data_dir>/<db>/<table>/<part>/...   part directories
//! <data_dir>/<db>/<table>/detached/    restored parts before attach
//! <shadow_dir>/increment.txt           last freeze number
//! <shadow_dir>/<n>/<db>/<table>/...    frozen copy number n
//! ```

use super::{Catalog, FrozenTable, Snapshot};
use crate::fs::walker::{subdirectories, walk_directory, WalkOptions};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DETACHED: &str = "detached";
const INCREMENT_FILE: &str = "increment.txt";

#[derive(Debug, Clone)]
pub struct ShadowCatalog {
    data_dir: PathBuf,
    shadow_dir: PathBuf,
}

impl ShadowCatalog {
    pub fn new(data_dir: impl Into<PathBuf>, shadow_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            shadow_dir: shadow_dir.into(),
        }
    }

    fn table_path(&self, db: &str, table: &str) -> PathBuf {
        self.data_dir.join(db).join(table)
    }

    fn schema_path(&self, db: &str, table: &str) -> PathBuf {
        self.data_dir.join(db).join(format!("{table}.sql"))
    }
}

fn catalog_err(what: impl std::fmt::Display, err: io::Error) -> EngineError {
    EngineError::Catalog(format!("{what}: {err}"))
}

fn visible_dirs(root: &Path) -> io::Result<Vec<String>> {
    Ok(subdirectories(root)?
        .into_iter()
        .filter(|name| name != DETACHED && !name.starts_with('.'))
        .collect())
}

/// Partition id of a part directory: the name up to the first `_`.
pub fn partition_of(part: &str) -> &str {
    part.split('_').next().unwrap_or(part)
}

fn next_increment(shadow_dir: &Path) -> io::Result<u64> {
    std::fs::create_dir_all(shadow_dir)?;
    let path = shadow_dir.join(INCREMENT_FILE);
    let last = match std::fs::read_to_string(&path) {
        Ok(content) => content.trim().parse::<u64>().unwrap_or(0),
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e),
    };
    let next = last + 1;
    std::fs::write(&path, next.to_string())?;
    Ok(next)
}

/// Hard-link `src` to `dst`, copying when linking is not possible.
fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::hard_link(src, dst).is_err() {
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

struct FreezeRequest {
    db: String,
    table: String,
    partition: Option<String>,
    table_path: PathBuf,
    schema_path: PathBuf,
    shadow_dir: PathBuf,
}

fn freeze_blocking(req: FreezeRequest) -> Result<FrozenTable> {
    let FreezeRequest {
        db,
        table,
        partition,
        table_path,
        schema_path,
        shadow_dir,
    } = req;

    if !table_path.is_dir() {
        return Err(EngineError::Catalog(format!("table {db}.{table} not found")));
    }

    let increment = next_increment(&shadow_dir).map_err(|e| catalog_err("cannot advance freeze increment", e))?;
    let root = shadow_dir.join(increment.to_string()).join(&db).join(&table);
    std::fs::create_dir_all(&root).map_err(|e| catalog_err(root.display(), e))?;

    let mut partitions: Vec<String> = Vec::new();
    let mut dirs = Vec::new();
    for part in visible_dirs(&table_path).map_err(|e| catalog_err(table_path.display(), e))? {
        let id = partition_of(&part);
        if partition.as_deref().is_some_and(|wanted| wanted != id) {
            continue;
        }
        let part_path = table_path.join(&part);
        let files = walk_directory(&part_path, WalkOptions::default()).map_err(|e| catalog_err(part_path.display(), e))?;
        for file in files {
            let dst = root.join(&part).join(&file.relative_path);
            link_or_copy(&file.path, &dst).map_err(|e| catalog_err(file.path.display(), e))?;
        }
        if !partitions.iter().any(|p| p == id) {
            partitions.push(id.to_string());
        }
        dirs.push(part);
    }

    let schema = match std::fs::read_to_string(&schema_path) {
        Ok(schema) => schema,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("No schema for {}.{} at {}", db, table, schema_path.display());
            String::new()
        }
        Err(e) => return Err(catalog_err(schema_path.display(), e)),
    };

    debug!("Froze {}.{} as increment {} ({} parts)", db, table, increment, dirs.len());
    Ok(FrozenTable {
        db_dir: format!("data/{db}/"),
        table_dir: format!("data/{db}/{table}/"),
        db,
        table,
        partitions,
        dirs,
        snapshots: vec![Snapshot { storage: None, root }],
        schema,
        increment,
    })
}

#[async_trait]
impl Catalog for ShadowCatalog {
    async fn databases(&self) -> Result<Vec<String>> {
        let data_dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || visible_dirs(&data_dir).map_err(|e| catalog_err(data_dir.display(), e)))
            .await?
    }

    async fn tables(&self, db: &str) -> Result<Vec<String>> {
        let db_path = self.data_dir.join(db);
        tokio::task::spawn_blocking(move || visible_dirs(&db_path).map_err(|e| catalog_err(db_path.display(), e)))
            .await?
    }

    async fn freeze(&self, db: &str, table: &str, partition: Option<&str>) -> Result<FrozenTable> {
        let req = FreezeRequest {
            db: db.to_string(),
            table: table.to_string(),
            partition: partition.map(str::to_string),
            table_path: self.table_path(db, table),
            schema_path: self.schema_path(db, table),
            shadow_dir: self.shadow_dir.clone(),
        };
        tokio::task::spawn_blocking(move || freeze_blocking(req)).await?
    }

    async fn release(&self, frozen: &FrozenTable) -> Result<()> {
        let path = self.shadow_dir.join(frozen.increment.to_string());
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(catalog_err(path.display(), e)),
        }
    }

    async fn create_database(&self, db: &str) -> Result<()> {
        let path = self.data_dir.join(db);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| catalog_err(path.display(), e))
    }

    async fn create_table(&self, db: &str, table: &str, schema: &str) -> Result<()> {
        let path = self.table_path(db, table);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| catalog_err(path.display(), e))?;

        let schema_path = self.schema_path(db, table);
        if !schema.is_empty() && !tokio::fs::try_exists(&schema_path).await.unwrap_or(false) {
            tokio::fs::write(&schema_path, schema)
                .await
                .map_err(|e| catalog_err(schema_path.display(), e))?;
            info!("Created table {}.{}", db, table);
        }
        Ok(())
    }

    fn restore_dir(&self, db: &str, table: &str) -> PathBuf {
        self.table_path(db, table).join(DETACHED)
    }

    async fn attach(&self, db: &str, table: &str, dirs: &[String]) -> Result<()> {
        let detached = self.restore_dir(db, table);
        let table_path = self.table_path(db, table);
        for dir in dirs {
            let src = detached.join(dir);
            let dst = table_path.join(dir);
            if tokio::fs::try_exists(&dst).await.unwrap_or(false) {
                return Err(EngineError::Catalog(format!("part {dir} already attached to {db}.{table}")));
            }
            tokio::fs::rename(&src, &dst)
                .await
                .map_err(|e| catalog_err(format!("attach {}", src.display()), e))?;
            debug!("Attached {} to {}.{}", dir, db, table);
        }
        // only succeeds once every restored part has moved
        let _ = tokio::fs::remove_dir(&detached).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, ShadowCatalog) {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("data/db/t");
        fs::create_dir_all(table.join("202401_1_1_0")).unwrap();
        fs::create_dir_all(table.join("202402_2_2_0")).unwrap();
        fs::create_dir_all(table.join(DETACHED)).unwrap();
        fs::write(table.join("202401_1_1_0/data.bin"), b"january").unwrap();
        fs::write(table.join("202401_1_1_0/checksums.txt"), b"sum").unwrap();
        fs::write(table.join("202402_2_2_0/data.bin"), b"february").unwrap();
        fs::write(dir.path().join("data/db/t.sql"), "CREATE TABLE db.t (x UInt8)").unwrap();
        let catalog = ShadowCatalog::new(dir.path().join("data"), dir.path().join("shadow"));
        (dir, catalog)
    }

    #[test]
    fn test_partition_of() {
        assert_eq!(partition_of("202401_1_1_0"), "202401");
        assert_eq!(partition_of("all_1_1_0"), "all");
        assert_eq!(partition_of("tuple"), "tuple");
    }

    #[tokio::test]
    async fn test_freeze_and_release() {
        let (dir, catalog) = fixture();
        assert_eq!(catalog.tables("db").await.unwrap(), vec!["t"]);

        let frozen = catalog.freeze("db", "t", None).await.unwrap();
        assert_eq!(frozen.increment, 1);
        assert_eq!(frozen.dirs, vec!["202401_1_1_0", "202402_2_2_0"]);
        assert_eq!(frozen.partitions, vec!["202401", "202402"]);
        assert_eq!(frozen.table_dir, "data/db/t/");
        assert_eq!(frozen.schema, "CREATE TABLE db.t (x UInt8)");

        let root = &frozen.snapshots[0].root;
        assert_eq!(fs::read(root.join("202402_2_2_0/data.bin")).unwrap(), b"february");
        assert!(!root.join(DETACHED).exists());

        catalog.release(&frozen).await.unwrap();
        assert!(!dir.path().join("shadow/1").exists());
        // releasing twice is harmless
        catalog.release(&frozen).await.unwrap();

        let again = catalog.freeze("db", "t", None).await.unwrap();
        assert_eq!(again.increment, 2);
    }

    #[tokio::test]
    async fn test_freeze_one_partition() {
        let (_dir, catalog) = fixture();
        let frozen = catalog.freeze("db", "t", Some("202401")).await.unwrap();
        assert_eq!(frozen.dirs, vec!["202401_1_1_0"]);
        assert!(!frozen.snapshots[0].root.join("202402_2_2_0").exists());
    }

    #[tokio::test]
    async fn test_freeze_missing_table() {
        let (_dir, catalog) = fixture();
        assert!(matches!(catalog.freeze("db", "nope", None).await, Err(EngineError::Catalog(_))));
    }

    #[tokio::test]
    async fn test_create_and_attach() {
        let (dir, catalog) = fixture();
        catalog.create_database("fresh").await.unwrap();
        catalog.create_table("fresh", "t", "CREATE TABLE fresh.t (x UInt8)").await.unwrap();
        assert!(dir.path().join("data/fresh/t.sql").exists());

        let detached = catalog.restore_dir("fresh", "t");
        fs::create_dir_all(detached.join("all_1_1_0")).unwrap();
        fs::write(detached.join("all_1_1_0/data.bin"), b"x").unwrap();

        catalog.attach("fresh", "t", &["all_1_1_0".to_string()]).await.unwrap();
        assert!(dir.path().join("data/fresh/t/all_1_1_0/data.bin").exists());
        assert!(!detached.exists());

        fs::create_dir_all(detached.join("all_1_1_0")).unwrap();
        let err = catalog.attach("fresh", "t", &["all_1_1_0".to_string()]).await;
        assert!(matches!(err, Err(EngineError::Catalog(_))));
    }
}
