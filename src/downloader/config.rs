//! Download configuration constants

use std::time::Duration;

/// Maximum number of retries for a failed range request.
/// Each retry resumes from the last byte written, so retries are cheap.
pub const MAX_RETRIES: u32 = 5;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Persist confirmed progress every N bytes.
/// A crash loses at most this many bytes of payload.
pub const STATE_FLUSH_INTERVAL_BYTES: u64 = 1024 * 1024;

/// Bytes fetched before reading container metadata.
/// Covers the header atoms of the supported containers.
pub const HEADER_PROBE_BYTES: u64 = 64 * 1024;

/// Minimum interval between transfer progress log lines
pub const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Calculate exponential backoff delay
pub fn calculate_backoff(retry_count: u32) -> Duration {
    let delay_ms = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    Duration::from_millis(delay_ms.min(MAX_BACKOFF_MS))
}
