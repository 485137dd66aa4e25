//! Orchestrators - sequence catalog, chain, pool and storage for one run.
//!
//! Databases and tables are handled strictly one after another; the only
//! parallelism is inside a table, where a [`WorkerPool`] moves files.
//! Failures below the run level raise a status flag and processing goes on.
//!
//! [`WorkerPool`]: crate::workerpool::WorkerPool

pub mod backup;
pub mod info;
pub mod metadata;
pub mod restore;
pub mod retention;

pub use backup::BackupOptions;
pub use restore::RestoreOptions;
