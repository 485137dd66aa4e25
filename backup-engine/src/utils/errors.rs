//! Error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid backup name: {0}")]
    InvalidBackupName(String),

    #[error("Previous backups not found")]
    NoPreviousBackups,

    #[error("Digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Bad filter: {0}")]
    BadFilter(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Whether retrying the same operation may succeed.
    ///
    /// A missing source, a corrupt archive or a bad request will fail the same
    /// way on every attempt; everything that talks to a disk or a network peer
    /// is assumed to be transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidData
            ),
            EngineError::Ssh(_)
            | EngineError::Pool(_)
            | EngineError::Http(_)
            | EngineError::HttpStatus { .. }
            | EngineError::Join(_) => true,
            EngineError::Config(_)
            | EngineError::SourceNotFound(_)
            | EngineError::Serialization(_)
            | EngineError::InvalidBackupName(_)
            | EngineError::NoPreviousBackups
            | EngineError::DigestMismatch { .. }
            | EngineError::Catalog(_)
            | EngineError::BadFilter(_)
            | EngineError::Cancelled => false,
        }
    }

    /// Wrap an I/O error, turning `NotFound` into the terminal
    /// [`EngineError::SourceNotFound`] for `what`.
    pub fn from_io(err: std::io::Error, what: impl Into<String>) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            EngineError::SourceNotFound(what.into())
        } else {
            EngineError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_missing_source_is_terminal() {
        let err = EngineError::from_io(io::Error::new(io::ErrorKind::NotFound, "gone"), "a/b.bin");
        assert!(matches!(err, EngineError::SourceNotFound(ref p) if p == "a/b.bin"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_errors_are_retryable() {
        let err = EngineError::from_io(io::Error::new(io::ErrorKind::BrokenPipe, "eof"), "x");
        assert!(err.is_retryable());
        assert!(EngineError::Pool("exhausted".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::NoPreviousBackups.is_retryable());
        assert!(!EngineError::Io(io::Error::new(io::ErrorKind::InvalidData, "corrupt")).is_retryable());
    }
}
