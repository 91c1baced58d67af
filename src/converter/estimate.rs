//! Percent and time-remaining estimates from transform progress samples

use std::time::Duration;

/// One progress report from the transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Audio position processed so far
    pub position: Duration,
    /// Processed audio duration per wall-clock second
    pub speed: f64,
}

impl ProgressSample {
    /// Create a sample
    pub fn new(position: Duration, speed: f64) -> Self {
        Self { position, speed }
    }
}

/// User-facing progress derived from a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEstimate {
    /// Percent complete, `0..=100`
    pub percent: u8,
    /// Estimated time remaining; `None` when no stable estimate exists
    pub remaining: Option<Duration>,
}

/// Converts samples against a fixed total duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEstimator {
    total: Duration,
}

impl ProgressEstimator {
    /// Estimator for content of length `total`
    pub fn new(total: Duration) -> Self {
        Self { total }
    }

    /// Total content duration
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Estimate progress for `sample`
    pub fn estimate(&self, sample: ProgressSample) -> ProgressEstimate {
        ProgressEstimate {
            percent: percent_complete(sample.position, self.total),
            remaining: time_remaining(sample.position, self.total, sample.speed),
        }
    }
}

/// Percent of `total` covered by `position`, truncated and clamped to `0..=100`.
///
/// A zero total reports 0.
pub fn percent_complete(position: Duration, total: Duration) -> u8 {
    let total = total.as_secs_f64();
    if total <= 0.0 {
        return 0;
    }
    let percent = 100.0 * position.as_secs_f64() / total;
    if !percent.is_finite() {
        return 0;
    }
    percent.clamp(0.0, 100.0) as u8
}

/// Remaining wall time at `speed`, only when the value is normal and positive.
pub fn time_remaining(position: Duration, total: Duration, speed: f64) -> Option<Duration> {
    if position >= total || !speed.is_normal() || speed < 0.0 {
        return None;
    }
    let remaining = (total - position).as_secs_f64() / speed;
    if !remaining.is_normal() || remaining <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(remaining).ok()
}
