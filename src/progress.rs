//! Per-stage progress accounting and human-readable formatting (§4.8, §10).

use std::fmt;
use std::time::{Duration, Instant};

/// Running totals for one pipeline stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct Progress {
    pub total_files: usize,
    pub completed_files: usize,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub failed_files: usize,
}

impl Progress {
    pub fn new(total_files: usize, total_bytes: u64) -> Self {
        Progress { total_files, total_bytes, ..Default::default() }
    }

    pub fn record_success(&mut self, bytes: u64) {
        self.completed_files += 1;
        self.completed_bytes += bytes;
    }

    pub fn record_failure(&mut self) {
        self.completed_files += 1;
        self.failed_files += 1;
    }

    pub fn percent(&self) -> f64 {
        if self.total_files == 0 {
            100.0
        } else {
            self.completed_files as f64 * 100.0 / self.total_files as f64
        }
    }

    /// One in-place progress line, the single stdout exception to the
    /// log-facade rule (§10).
    pub fn line(&self, elapsed: Duration) -> String {
        let speed = if elapsed.as_secs_f64() > 0.0 {
            self.completed_bytes as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        format!(
            "{}/{} files ({:.1}%) | {} | {}/s",
            self.completed_files,
            self.total_files,
            self.percent(),
            format_bytes(self.completed_bytes),
            format_bytes(speed as u64)
        )
    }
}

/// A stopwatch for one stage or run, used for the final summary's elapsed
/// time (§10).
pub struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Stopwatch(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

/// Formats a byte count as e.g. `12.30 MiB`, matching the original tool's
/// `_format_bytes`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} PiB")
}

/// Formats a duration as e.g. `1h 23m`, `45m 30s`, `15s`, matching the
/// original tool's `_format_time`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    if total < 60 {
        format!("{total}s")
    } else if total < 3600 {
        format!("{}m {}s", total / 60, total % 60)
    } else {
        format!("{}h {}m", total / 3600, (total % 3600) / 60)
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} files, {} failed, {} transferred",
            self.completed_files,
            self.total_files,
            self.failed_files,
            format_bytes(self.completed_bytes)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes_across_units() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn formats_duration_buckets() {
        assert_eq!(format_duration(Duration::from_secs(15)), "15s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(4920)), "1h 22m");
    }

    #[test]
    fn progress_tracks_success_and_failure_counts() {
        let mut p = Progress::new(3, 300);
        p.record_success(100);
        p.record_failure();
        assert_eq!(p.completed_files, 2);
        assert_eq!(p.failed_files, 1);
        assert_eq!(p.completed_bytes, 100);
    }
}
