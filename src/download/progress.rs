//! Transfer progress tracking and formatting.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Snapshot of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    /// Bytes in the destination so far, including a resumed prefix.
    pub transferred: u64,
    /// Expected final size, when the server reported a length.
    pub total: Option<u64>,
    /// Average bytes per second since this attempt started.
    pub speed: Option<f64>,
    /// Time since this attempt started.
    pub elapsed: Duration,
    /// Estimated time left.
    pub remaining: Option<Duration>,
}

impl ProgressState {
    /// Completed percentage, when the total is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percent(&self) -> Option<u32> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some(((self.transferred as f64 / total as f64) * 100.0).floor() as u32),
        }
    }
}

impl fmt::Display for ProgressState {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total.map_or_else(|| "?".to_string(), human_file_size);
        let percent = self
            .percent()
            .map_or_else(|| "?".to_string(), |p| p.to_string());
        let speed = self
            .speed
            .map_or_else(|| "?".to_string(), |s| human_file_size(s as u64));
        let remaining = self
            .remaining
            .map_or_else(|| "?".to_string(), format_remaining);
        write!(
            f,
            "Progress: {}/{total} ({percent}%, {speed}/s) {remaining} remaining",
            human_file_size(self.transferred)
        )
    }
}

/// Formats a byte count with two decimals in `B`, `KB`, `MB`, `GB` or `TB`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn human_file_size(size: u64) -> String {
    if size == 0 {
        return "0B".to_string();
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2}{}", UNITS[unit])
}

/// Formats a duration as `h:mm:ss`, dropping leading zero groups.
#[must_use]
pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else if minutes > 0 {
        format!("{minutes}:{seconds:02}")
    } else {
        seconds.to_string()
    }
}

/// Accumulates bytes for one transfer attempt and decides when to report.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    started: Instant,
    last_report: Instant,
    interval: Duration,
    offset: u64,
    transferred: u64,
    total: Option<u64>,
}

impl ProgressTracker {
    /// Starts tracking a transfer that already has `offset` bytes on disk.
    pub(crate) fn new(offset: u64, total: Option<u64>, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_report: now,
            interval,
            offset,
            transferred: offset,
            total,
        }
    }

    /// Records `bytes` and returns a snapshot when a report is due.
    ///
    /// No report is produced once the transfer is complete; the caller logs
    /// completion separately.
    pub(crate) fn advance(&mut self, bytes: u64) -> Option<ProgressState> {
        self.transferred += bytes;
        let now = Instant::now();
        if now.duration_since(self.last_report) < self.interval {
            return None;
        }
        if self.total == Some(self.transferred) {
            return None;
        }
        self.last_report = now;
        Some(self.state_at(now))
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred
    }

    #[allow(clippy::cast_precision_loss)]
    fn state_at(&self, now: Instant) -> ProgressState {
        let elapsed = now.duration_since(self.started);
        let session_bytes = self.transferred - self.offset;
        let speed = (!elapsed.is_zero()).then(|| session_bytes as f64 / elapsed.as_secs_f64());
        let remaining = match (self.total, speed) {
            (Some(total), Some(speed)) if speed > 0.0 => {
                // Unrepresentable estimates (huge totals at low speed) render as unknown.
                Duration::try_from_secs_f64(total.saturating_sub(self.transferred) as f64 / speed)
                    .ok()
            }
            _ => None,
        };
        ProgressState {
            transferred: self.transferred,
            total: self.total,
            speed,
            elapsed,
            remaining,
        }
    }
}
