//! Transfer progress tracking for long-running downloads.
//!
//! Keeps byte counters for the current session, estimates throughput and
//! remaining time, and decides when a progress line is worth logging.

use super::config::PROGRESS_LOG_INTERVAL;
use std::time::{Duration, Instant};

const DEFAULT_PERCENT_STEP: f64 = 10.0;

/// Byte progress of one download session.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Offset the session started from (bytes already on disk).
    pub resumed_from: u64,
    /// Bytes received in this session.
    pub bytes_transferred: u64,
    /// Total resource length (if known).
    pub total_bytes: Option<u64>,
    /// When the session started.
    pub start_time: Instant,
    /// Last time progress was reported.
    pub last_update: Instant,
    /// Minimum interval between time-based updates.
    pub update_interval: Duration,
    /// Last reported completion percentage.
    pub last_reported_percentage: f64,
    /// Minimum percentage delta required to emit a new update.
    pub min_percentage_step: f64,
}

impl TransferProgress {
    /// Start tracking a session that resumes at `resumed_from`.
    pub fn new(resumed_from: u64, total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        let mut progress = Self {
            resumed_from,
            bytes_transferred: 0,
            total_bytes,
            start_time: now,
            last_update: now,
            update_interval: PROGRESS_LOG_INTERVAL,
            last_reported_percentage: 0.0,
            min_percentage_step: DEFAULT_PERCENT_STEP,
        };
        if let Some(pct) = progress.percentage() {
            progress.last_reported_percentage = pct;
        }
        progress
    }

    /// Record newly written bytes.
    pub fn update(&mut self, new_bytes: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(new_bytes);
    }

    /// Reset after the server restarted the body from offset zero.
    pub fn restart(&mut self) {
        self.resumed_from = 0;
        self.bytes_transferred = 0;
        self.last_reported_percentage = 0.0;
    }

    /// Set the total length once the server reports it.
    pub fn set_total(&mut self, total_bytes: Option<u64>) {
        self.total_bytes = total_bytes;
    }

    /// Absolute position within the resource.
    pub fn position(&self) -> u64 {
        self.resumed_from.saturating_add(self.bytes_transferred)
    }

    /// Session throughput in bytes per second.
    pub fn rate(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes_transferred as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Completion percentage (0-100) when the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some((self.position() as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }

    /// Estimated remaining transfer time based on session throughput.
    pub fn estimate_remaining(&self) -> Option<Duration> {
        let total = self.total_bytes?;
        let remaining = total.saturating_sub(self.position());
        let rate = self.rate();
        if remaining == 0 || rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(remaining as f64 / rate).ok()
    }

    /// Whether a progress line should be emitted based on time or percentage.
    pub fn should_emit_update(&self) -> bool {
        if self.bytes_transferred == 0 {
            return false;
        }

        let percentage_jump = self
            .percentage()
            .map(|pct| pct - self.last_reported_percentage >= self.min_percentage_step)
            .unwrap_or(false);

        percentage_jump || self.last_update.elapsed() >= self.update_interval
    }

    /// Call after emitting a progress line.
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        if let Some(pct) = self.percentage() {
            self.last_reported_percentage = pct;
        }
    }

    /// Human-readable progress string for logging.
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!("Downloaded {}", format_bytes(self.position()))];

        if let Some(total) = self.total_bytes {
            parts.push(format!("of {}", format_bytes(total)));
        }

        if let Some(pct) = self.percentage() {
            parts.push(format!("- {pct:.1}% complete"));
        }

        let rate = self.rate();
        if rate > 0.0 {
            parts.push(format!("at {}/s", format_bytes(rate as u64)));
        }

        if let Some(remaining) = self.estimate_remaining() {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }
}

/// Format a byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
