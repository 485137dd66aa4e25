//! Throughput accounting for log lines.

use std::time::{Duration, Instant};

/// Running totals for one table's transfers.
#[derive(Debug, Clone)]
pub struct TableProgress {
    started: Instant,
    pub files: usize,
    pub size: u64,
    pub bsize: u64,
    pub referenced: usize,
    pub failed: usize,
}

impl TableProgress {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            files: 0,
            size: 0,
            bsize: 0,
            referenced: 0,
            failed: 0,
        }
    }

    pub fn record(&mut self, size: i64, bsize: i64, referenced: bool) {
        self.files += 1;
        self.size += size.max(0) as u64;
        self.bsize += bsize.max(0) as u64;
        if referenced {
            self.referenced += 1;
        }
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average uncompressed throughput since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.size as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} files ({} deduplicated, {} failed), {} -> {} in {} ({})",
            self.files,
            self.referenced,
            self.failed,
            format_bytes(self.size),
            format_bytes(self.bsize),
            format_duration(self.elapsed().as_secs()),
            format_speed(self.average_speed()),
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_progress() {
        let mut progress = TableProgress::start();
        progress.record(1000, 400, false);
        progress.record(500, 100, true);
        progress.record_failure();

        assert_eq!(progress.files, 2);
        assert_eq!(progress.size, 1500);
        assert_eq!(progress.bsize, 500);
        assert_eq!(progress.referenced, 1);
        assert!(progress.summary().starts_with("2 files (1 deduplicated, 1 failed)"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
