//! Backup Engine Library
//!
//! Incremental, deduplicating backup and restore of a columnar database's
//! table files over local, SFTP or WebDAV storage.

pub mod catalog;
pub mod config;
pub mod context;
pub mod dedup;
pub mod executor;
pub mod fs;
pub mod model;
pub mod retention;
pub mod transfer;
pub mod utils;
pub mod workerpool;

// Re-export commonly used types
pub use config::Config;
pub use context::RunContext;
pub use utils::errors::{EngineError, Result};
