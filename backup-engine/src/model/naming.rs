//! Backup kinds and backup directory names.
//!
//! A backup name is `YYYYMMDD_HHMMSS` followed by the kind's tag letter, e.g.
//! `20240101_120000F`. Names sort lexicographically in creation order.

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{8}_[0-9]{6}[FDIP]$").expect("valid backup name pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Diff,
    Incr,
    Part,
}

impl BackupKind {
    pub fn tag(self) -> char {
        match self {
            BackupKind::Full => 'F',
            BackupKind::Diff => 'D',
            BackupKind::Incr => 'I',
            BackupKind::Part => 'P',
        }
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'F' => Some(BackupKind::Full),
            'D' => Some(BackupKind::Diff),
            'I' => Some(BackupKind::Incr),
            'P' => Some(BackupKind::Part),
            _ => None,
        }
    }

    /// Diff and incr runs deduplicate against earlier backups.
    pub fn needs_chain(self) -> bool {
        matches!(self, BackupKind::Diff | BackupKind::Incr)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Diff => "diff",
            BackupKind::Incr => "incr",
            BackupKind::Part => "part",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupKind::Full),
            "diff" => Ok(BackupKind::Diff),
            "incr" => Ok(BackupKind::Incr),
            "part" => Ok(BackupKind::Part),
            other => Err(EngineError::Config(format!("unknown backup type: {other}"))),
        }
    }
}

/// Build the name of a backup started at `now`.
pub fn generate(kind: BackupKind, now: DateTime<Utc>) -> String {
    format!("{}{}", now.format("%Y%m%d_%H%M%S"), kind.tag())
}

pub fn is_backup_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Classify a backup name; `None` when it does not follow the naming scheme.
pub fn kind_of(name: &str) -> Option<BackupKind> {
    if !is_backup_name(name) {
        return None;
    }
    name.chars().last().and_then(BackupKind::from_tag)
}

pub fn is_full(name: &str) -> bool {
    kind_of(name) == Some(BackupKind::Full)
}

pub fn validate(name: &str) -> Result<()> {
    if is_backup_name(name) {
        Ok(())
    } else {
        Err(EngineError::InvalidBackupName(name.to_string()))
    }
}
