//! Failure bookkeeping for a single run.
//!
//! Subsystems never abort the process on their own; they raise a [`Failure`]
//! category on the run's [`RunStatus`] and carry on. The OR of every raised
//! category becomes the process exit status.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Failure categories, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failure {
    /// The requested operation as a whole did not complete.
    Run,
    Config,
    Database,
    Table,
    Partition,
    File,
    Metadata,
    /// Freezing, listing or attaching through the database catalog.
    Catalog,
}

impl Failure {
    pub const ALL: [Failure; 8] = [
        Failure::Run,
        Failure::Config,
        Failure::Database,
        Failure::Table,
        Failure::Partition,
        Failure::File,
        Failure::Metadata,
        Failure::Catalog,
    ];

    pub fn bit(self) -> u32 {
        match self {
            Failure::Run => 1,
            Failure::Config => 1 << 1,
            Failure::Database => 1 << 2,
            Failure::Table => 1 << 3,
            Failure::Partition => 1 << 4,
            Failure::File => 1 << 5,
            Failure::Metadata => 1 << 6,
            Failure::Catalog => 1 << 7,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Failure::Run => "run",
            Failure::Config => "config",
            Failure::Database => "database",
            Failure::Table => "table",
            Failure::Partition => "partition",
            Failure::File => "file",
            Failure::Metadata => "metadata",
            Failure::Catalog => "catalog",
        };
        f.write_str(name)
    }
}

/// Bit-set of the failures raised during one run.
#[derive(Debug, Default)]
pub struct RunStatus {
    bits: AtomicU32,
}

impl RunStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, failure: Failure) {
        self.bits.fetch_or(failure.bit(), Ordering::Relaxed);
    }

    pub fn is_raised(&self, failure: Failure) -> bool {
        self.bits.load(Ordering::Relaxed) & failure.bit() != 0
    }

    pub fn is_clean(&self) -> bool {
        self.bits.load(Ordering::Relaxed) == 0
    }

    pub fn raised(&self) -> Vec<Failure> {
        Failure::ALL
            .into_iter()
            .filter(|f| self.is_raised(*f))
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        self.bits.load(Ordering::Relaxed) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_one_bit_per_category() {
        let bits: HashSet<u32> = Failure::ALL.iter().map(|f| f.bit()).collect();
        assert_eq!(bits.len(), Failure::ALL.len());
        for bit in bits {
            assert_eq!(bit.count_ones(), 1);
            assert!(bit < 256);
        }
    }

    #[test]
    fn test_exit_code_is_or_of_raised() {
        let status = RunStatus::new();
        assert!(status.is_clean());
        assert_eq!(status.exit_code(), 0);

        status.raise(Failure::File);
        status.raise(Failure::Table);
        status.raise(Failure::File);

        assert_eq!(status.exit_code(), (Failure::File.bit() | Failure::Table.bit()) as i32);
        assert_eq!(status.raised(), vec![Failure::Table, Failure::File]);
        assert!(!status.is_raised(Failure::Run));
    }
}
