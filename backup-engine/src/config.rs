//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file. Only `[storage]` is mandatory; every
//! other section falls back to its defaults.

use crate::model::BackupFilter;
use crate::utils::errors::{EngineError, Result};
use crate::workerpool::{PoolOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Databases and tables processed when the command line selects none.
    #[serde(default)]
    pub filter: BackupFilter,
}

/// Where archives are kept. The backend is chosen from this tag once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Local(LocalStorage),
    Sftp(SftpStorage),
    Webdav(WebDavStorage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorage {
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpStorage {
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Private key used instead of the password when set.
    #[serde(default)]
    pub key_filename: Option<PathBuf>,
    /// Passphrase of `key_filename`.
    #[serde(default)]
    pub key_passphrase: Option<String>,
    /// Absolute path of the storage root on the remote host.
    pub backup_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDavStorage {
    pub hostname: String,
    /// Defaults to 443 or 80 depending on `secure`.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Collection path of the storage root, e.g. `/dav/backups`.
    pub backup_dir: String,
    #[serde(default)]
    pub secure: bool,
    /// Accept invalid TLS certificates.
    #[serde(default)]
    pub skip_verify: bool,
}

impl WebDavStorage {
    /// Base URL of the storage root, always ending in `/`.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let port = self.port.unwrap_or(if self.secure { 443 } else { 80 });
        let dir = self.backup_dir.trim_matches('/');
        if dir.is_empty() {
            format!("{}://{}:{}/", scheme, self.hostname, port)
        } else {
            format!("{}://{}:{}/{}/", scheme, self.hostname, port, dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Live table directories, `<data_dir>/<db>/<table>/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where frozen snapshots are materialised.
    #[serde(default = "default_shadow_dir")]
    pub shadow_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Capacity of the pool's input and output queues.
    #[serde(default = "default_chan_len")]
    pub chan_len: usize,

    /// Attempts per file before giving up; 0 retries until cancelled.
    #[serde(default)]
    pub num_retry: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,

    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Full backups to keep; 0 disables retention.
    #[serde(default)]
    pub backup_full: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// gzip level, 1 (fast) to 9 (small).
    #[serde(default = "default_compression_level")]
    pub level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_ssh_port() -> u16 {
    22
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/clickhouse/data")
}

fn default_shadow_dir() -> PathBuf {
    PathBuf::from("/var/lib/clickhouse/shadow")
}

fn default_num_workers() -> usize {
    8
}

fn default_chan_len() -> usize {
    10
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_retry_backoff() -> f64 {
    1.0
}

fn default_max_retry_delay_secs() -> u64 {
    60
}

fn default_compression_level() -> u32 {
    6
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            shadow_dir: default_shadow_dir(),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            chan_len: default_chan_len(),
            num_retry: 0,
            retry_delay_secs: default_retry_delay_secs(),
            retry_backoff: default_retry_backoff(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: default_compression_level(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn workers(&self) -> usize {
        if self.num_workers < 1 {
            default_num_workers()
        } else {
            self.num_workers
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            workers: self.workers(),
            capacity: self.chan_len.max(1),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: None,
            delay: Duration::from_secs(self.retry_delay_secs),
            multiplier: self.retry_backoff,
            max_delay: Duration::from_secs(self.max_retry_delay_secs),
        }
        .with_max_attempts(self.num_retry)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a local storage root with every other section at
    /// its defaults.
    pub fn local(backup_dir: impl Into<PathBuf>) -> Self {
        Config {
            storage: StorageConfig::Local(LocalStorage {
                backup_dir: backup_dir.into(),
            }),
            catalog: CatalogConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            retention: RetentionConfig::default(),
            compression: CompressionConfig::default(),
            log: LogConfig::default(),
            filter: BackupFilter::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !(1..=9).contains(&self.compression.level) {
            return Err(EngineError::Config(format!(
                "compression level must be between 1 and 9, got {}",
                self.compression.level
            )));
        }
        if let StorageConfig::Sftp(sftp) = &self.storage {
            if sftp.password.is_none() && sftp.key_filename.is_none() {
                return Err(EngineError::Config(
                    "sftp storage needs a password or a key_filename".to_string(),
                ));
            }
        }
        Ok(())
    }
}
