//! # Audiobook Downloader Library
//!
//! Downloads a large encrypted audiobook container over HTTP, converts it into
//! an `.m4b` file and writes cue/NFO sidecars next to it. Interrupted downloads
//! resume from the last confirmed byte, even after the signed download URL has
//! been reissued.
//!
//! ## Features
//!
//! - **Resume Capability**: Crash-safe persisted download state with atomic writes
//! - **URL Rotation**: Resume against a reissued URL for the same remote file
//! - **Step Pipeline**: Named, timed stages with critical and best-effort failure modes
//! - **Cooperative Cancellation**: Checked at stage boundaries and per downloaded chunk
//! - **Progress Estimation**: Percent complete and a guarded time-remaining estimate
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use audiobook_downloader::converter::{DownloadConverter, PassthroughTransform};
//! use audiobook_downloader::downloader::HttpTransport;
//! use audiobook_downloader::DownloadLicense;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let license = DownloadLicense::new(
//!     "https://cdn.example.com/book.aaxc?token=abc",
//!     "Mozilla/5.0",
//! );
//!
//! let mut converter = DownloadConverter::new(
//!     "./cache",
//!     "./books",
//!     license,
//!     Arc::new(HttpTransport::new()?),
//!     Arc::new(PassthroughTransform::new()),
//! )?;
//! converter.set_output_filename("My Book");
//!
//! if converter.run().await {
//!     println!("speedup: {:?}", converter.speedup());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`resume`] - Persisted download state, file locking and the download persister
//! - [`downloader`] - Range transport contract, HTTP transport and the resumable stream
//! - [`converter`] - Step sequence, progress estimation, events and the pipeline itself
//! - [`cancel`] - Cancellation token shared between the pipeline and the transform
//! - [`cli`] - Command line front end

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cancellation token shared across the pipeline
pub mod cancel;

/// CLI command implementations
pub mod cli;

/// Pipeline orchestration
pub mod converter;

/// Resumable range downloads
pub mod downloader;

/// Resume capability for interrupted downloads
pub mod resume;

pub use cancel::CancellationToken;
pub use converter::DownloadConverter;

/// Everything the pipeline needs to fetch and decrypt one audiobook.
///
/// Immutable once handed to a [`DownloadConverter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadLicense {
    /// Signed download URL; expires after a while and may be reissued
    pub download_url: String,
    /// User-Agent header sent with every range request
    pub user_agent: String,
    /// Key material, absent for unencrypted sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<DecryptionKey>,
    /// Chapter map supplied by the caller, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<ChapterInfo>,
}

impl DownloadLicense {
    /// Create a license for an unencrypted source without a chapter map
    pub fn new(download_url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            download_url: download_url.into(),
            user_agent: user_agent.into(),
            key: None,
            chapters: None,
        }
    }

    /// Attach decryption key material
    pub fn with_key(mut self, key: DecryptionKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Attach a caller-supplied chapter map
    pub fn with_chapters(mut self, chapters: ChapterInfo) -> Self {
        self.chapters = Some(chapters);
        self
    }

    /// Whether the source must be decrypted
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }
}

/// Hex encoded key and initialization vector
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionKey {
    /// Key bytes, hex encoded
    pub key: String,
    /// Initialization vector, hex encoded
    pub iv: String,
}

impl DecryptionKey {
    /// Create a new key/IV pair
    pub fn new(key: impl Into<String>, iv: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            iv: iv.into(),
        }
    }
}

// Key material never ends up in logs.
impl std::fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// A single chapter mark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Chapter title
    pub title: String,
    /// Offset from the start of the book in milliseconds
    pub start_offset_ms: u64,
    /// Chapter length in milliseconds
    pub length_ms: u64,
}

impl Chapter {
    /// Create a chapter from durations
    pub fn new(title: impl Into<String>, start_offset: Duration, length: Duration) -> Self {
        Self {
            title: title.into(),
            start_offset_ms: start_offset.as_millis() as u64,
            length_ms: length.as_millis() as u64,
        }
    }

    /// Offset from the start of the book
    pub fn start_offset(&self) -> Duration {
        Duration::from_millis(self.start_offset_ms)
    }

    /// Chapter length
    pub fn length(&self) -> Duration {
        Duration::from_millis(self.length_ms)
    }

    /// Offset where the chapter ends
    pub fn end_offset(&self) -> Duration {
        self.start_offset() + self.length()
    }
}

/// Ordered chapter map of a book
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterInfo {
    /// Chapters in playback order
    pub chapters: Vec<Chapter>,
}

impl ChapterInfo {
    /// Build a chapter map from consecutive `(title, length)` pairs
    pub fn from_lengths<I, S>(chapters: I) -> Self
    where
        I: IntoIterator<Item = (S, Duration)>,
        S: Into<String>,
    {
        let mut offset = Duration::ZERO;
        let chapters = chapters
            .into_iter()
            .map(|(title, length)| {
                let chapter = Chapter::new(title, offset, length);
                offset += length;
                chapter
            })
            .collect();
        Self { chapters }
    }

    /// Number of chapters
    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    /// Whether the map has no chapters
    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    /// Iterate over chapters
    pub fn iter(&self) -> impl Iterator<Item = &Chapter> {
        self.chapters.iter()
    }

    /// End offset of the last chapter
    pub fn total_duration(&self) -> Duration {
        self.chapters
            .iter()
            .map(Chapter::end_offset)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Tag metadata read from the source container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTags {
    /// Book title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Author(s)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Narrator(s)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrator: Option<String>,
    /// Publisher
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Release year
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    /// Free-form description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}
