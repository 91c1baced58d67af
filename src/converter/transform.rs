//! Audio transform seam
//!
//! The byte-level decrypt/remux step is an external collaborator. The
//! pipeline only needs it to read container metadata from a partial payload,
//! turn the finished payload into the output file while reporting progress,
//! and embed cover art afterwards.

use super::estimate::ProgressSample;
use crate::cancel::CancellationToken;
use crate::{AudioTags, ChapterInfo, DecryptionKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Receives progress samples, possibly from a blocking worker thread
pub type ProgressSink = Arc<dyn Fn(ProgressSample) + Send + Sync>;

/// Metadata read from the container header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioMetadata {
    /// Tag metadata
    pub tags: AudioTags,
    /// Embedded cover art
    pub cover_art: Option<Bytes>,
    /// Content duration; zero when the header does not say
    pub duration: Duration,
    /// Chapter map stored in the container, if any
    pub chapters: Option<ChapterInfo>,
}

/// Input to a transform invocation
#[derive(Debug)]
pub struct TransformRequest {
    /// Complete downloaded payload
    pub source: PathBuf,
    /// Freshly created output file
    pub output: std::fs::File,
    /// Where `output` lives
    pub output_path: PathBuf,
    /// Key material when the source is encrypted
    pub key: Option<DecryptionKey>,
    /// Chapter map to write, when the caller has one
    pub chapters: Option<ChapterInfo>,
    /// Content duration used for progress reporting
    pub duration: Duration,
}

/// How a transform that did not fail ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Source was decrypted into the output
    Decrypted {
        /// Chapters written to the output
        chapters: ChapterInfo,
    },
    /// Source was not encrypted and was copied through
    Passthrough {
        /// Chapters written to the output
        chapters: ChapterInfo,
    },
    /// Cancellation was observed before the output was finished
    Cancelled,
}

impl TransformOutcome {
    /// Chapters of a finished output
    pub fn chapters(&self) -> Option<&ChapterInfo> {
        match self {
            TransformOutcome::Decrypted { chapters } | TransformOutcome::Passthrough { chapters } => {
                Some(chapters)
            }
            TransformOutcome::Cancelled => None,
        }
    }
}

/// Transform errors
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// IO error on the payload or output
    #[error("IO error: {0}")]
    Io(String),

    /// Payload is not a container this transform understands
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// Request asks for something this transform cannot do
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transform failed
    #[error("transform failed: {0}")]
    Failed(String),
}

impl From<std::io::Error> for TransformError {
    fn from(e: std::io::Error) -> Self {
        TransformError::Io(e.to_string())
    }
}

/// Decrypt/remux engine driven by the converter
#[async_trait]
pub trait AudioTransform: Send + Sync {
    /// Read tags, cover art, duration and chapters from a payload that holds
    /// at least the container header.
    async fn read_metadata(&self, source: &Path) -> Result<AudioMetadata, TransformError>;

    /// Produce the output file from the complete payload.
    ///
    /// Progress positions reported to `progress` never decrease within one
    /// call. `cancel` is checked per chunk.
    async fn transform(
        &self,
        request: TransformRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TransformOutcome, TransformError>;

    /// Attach cover art to a finished output
    async fn embed_cover_art(&self, output: &Path, cover_art: &[u8]) -> Result<(), TransformError>;
}

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Transform for unencrypted sources: copies the payload to the output
#[derive(Debug, Clone)]
pub struct PassthroughTransform {
    chunk_size: usize,
}

impl PassthroughTransform {
    /// Create a passthrough transform
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Copy in chunks of `chunk_size` bytes
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for PassthroughTransform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioTransform for PassthroughTransform {
    async fn read_metadata(&self, source: &Path) -> Result<AudioMetadata, TransformError> {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|e| TransformError::InvalidSource(format!("{}: {e}", source.display())))?;
        if !metadata.is_file() {
            return Err(TransformError::InvalidSource(format!(
                "{} is not a file",
                source.display()
            )));
        }
        Ok(AudioMetadata::default())
    }

    async fn transform(
        &self,
        request: TransformRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TransformOutcome, TransformError> {
        if request.key.is_some() {
            return Err(TransformError::Unsupported(
                "encrypted source needs a decrypting transform".to_string(),
            ));
        }

        let chunk_size = self.chunk_size;
        tokio::task::spawn_blocking(move || copy_with_progress(request, chunk_size, progress, cancel))
            .await
            .map_err(|e| TransformError::Failed(format!("copy task failed: {e}")))?
    }

    async fn embed_cover_art(&self, output: &Path, cover_art: &[u8]) -> Result<(), TransformError> {
        let path = output.with_extension("jpg");
        tokio::fs::write(&path, cover_art).await?;
        debug!(path = %path.display(), bytes = cover_art.len(), "Cover art written");
        Ok(())
    }
}

fn copy_with_progress(
    request: TransformRequest,
    chunk_size: usize,
    progress: ProgressSink,
    cancel: CancellationToken,
) -> Result<TransformOutcome, TransformError> {
    let TransformRequest {
        source,
        mut output,
        chapters,
        duration,
        ..
    } = request;

    let mut input = std::fs::File::open(&source)?;
    let total_bytes = input.metadata()?.len();
    let start = Instant::now();
    let mut buf = vec![0u8; chunk_size];
    let mut copied = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Ok(TransformOutcome::Cancelled);
        }

        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
        copied += n as u64;

        let fraction = if total_bytes == 0 {
            1.0
        } else {
            (copied as f64 / total_bytes as f64).min(1.0)
        };
        let position = duration.mul_f64(fraction);
        let elapsed = start.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            position.as_secs_f64() / elapsed
        } else {
            0.0
        };
        progress(ProgressSample::new(position, speed));
    }

    output.flush()?;
    output.sync_all()?;

    let chapters = chapters.unwrap_or_else(|| {
        if duration.is_zero() {
            ChapterInfo::default()
        } else {
            ChapterInfo::from_lengths([("Chapter 1", duration)])
        }
    });

    debug!(bytes = copied, chapters = chapters.len(), "Passthrough copy finished");
    Ok(TransformOutcome::Passthrough { chapters })
}
