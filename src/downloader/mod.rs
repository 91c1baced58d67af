//! Resumable range downloads
//!
//! This module fetches the remote audiobook container into a local temp
//! payload, one byte range at a time, so an interrupted download can pick up
//! where it stopped.
//!
//! # Overview
//!
//! 1. **Transport**: [`transport::RangeTransport`] is the contract a transport
//!    must satisfy (start at an offset, report total length)
//! 2. **HTTP**: [`http::HttpTransport`] implements it with `reqwest`
//! 3. **Stream**: [`stream::ResumableDownloadStream`] drives the transport,
//!    writes through to the payload file and reports confirmed progress
//! 4. **Progress**: [`progress::TransferProgress`] logs throughput on a cadence
//!
//! The persisted side of resume (state file, recovery policy) lives in
//! [`crate::resume`].
//!
//! # Error Handling
//!
//! All operations return `Result<T, DownloadError>`:
//! - Network and 5xx/429 errors are retried with backoff; the retry count
//!   resets once an attempt makes progress
//! - A changed total length discards the payload and restarts from offset 0
//! - IO errors on the payload are not retried

pub mod config;
pub mod http;
pub mod progress;
pub mod stream;
pub mod transport;

pub use http::HttpTransport;
pub use progress::TransferProgress;
pub use stream::{FetchOutcome, ResumableDownloadStream, StreamOptions};
pub use transport::{ByteStream, RangeResponse, RangeTransport};

/// Download errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Network error
    #[error("network error: {0}")]
    NetworkError(String),

    /// Non-success HTTP status
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    /// URI could not be parsed
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// Response was missing or had malformed range information
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Server answered with a different range than requested
    #[error("requested range starting at {requested}, server sent range starting at {received}")]
    UnexpectedRange {
        /// Offset that was requested
        requested: u64,
        /// Offset the body actually starts at
        received: u64,
    },

    /// Remote total length differs from the recorded one
    #[error("remote resource changed: expected {expected} bytes, server reports {actual}")]
    ResourceChanged {
        /// Recorded total length
        expected: u64,
        /// Reported total length
        actual: u64,
    },

    /// New URI does not address the same remote file
    #[error("not the same remote file: {0}")]
    DifferentResource(String),

    /// IO error on the local payload
    #[error("IO error: {0}")]
    IoError(String),

    /// Persisting progress failed
    #[error("state error: {0}")]
    StateError(String),
}

impl DownloadError {
    /// Whether retrying the request from the current offset may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::NetworkError(_) => true,
            DownloadError::HttpStatus(status) => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::IoError(e.to_string())
    }
}
