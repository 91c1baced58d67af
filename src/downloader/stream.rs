//! Resumable download stream
//!
//! Fetches the missing tail of a remote resource into a local payload file.
//! Progress is reported through a checkpoint callback only after the payload
//! has been synced, so a recorded offset never points past durable bytes.

use super::config::{calculate_backoff, MAX_RETRIES, STATE_FLUSH_INTERVAL_BYTES};
use super::progress::TransferProgress;
use super::transport::RangeTransport;
use super::DownloadError;
use crate::cancel::CancellationToken;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Url;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Result of a fetch that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Requested window (or the whole resource) is on disk
    Completed,
    /// Cancellation was observed; confirmed progress was reported
    Cancelled,
}

/// Tunables for a download stream
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Retries per fetch call
    pub max_retries: u32,
    /// Bytes written between checkpoints
    pub flush_interval: u64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            flush_interval: STATE_FLUSH_INTERVAL_BYTES,
        }
    }
}

enum Next {
    Cancelled,
    Chunk(Option<Result<Bytes, DownloadError>>),
}

/// Range-fetching stream writing through to a local payload file
pub struct ResumableDownloadStream {
    transport: Arc<dyn RangeTransport>,
    uri: Url,
    headers: BTreeMap<String, String>,
    temp_path: PathBuf,
    position: u64,
    content_length: Option<u64>,
    options: StreamOptions,
}

impl ResumableDownloadStream {
    /// Create a stream starting at offset zero
    pub fn new(
        transport: Arc<dyn RangeTransport>,
        uri: &str,
        headers: BTreeMap<String, String>,
        temp_path: impl Into<PathBuf>,
    ) -> Result<Self, DownloadError> {
        Self::resume(transport, uri, headers, temp_path, 0, None)
    }

    /// Create a stream continuing at `position`
    pub fn resume(
        transport: Arc<dyn RangeTransport>,
        uri: &str,
        headers: BTreeMap<String, String>,
        temp_path: impl Into<PathBuf>,
        position: u64,
        content_length: Option<u64>,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            transport,
            uri: parse_uri(uri)?,
            headers,
            temp_path: temp_path.into(),
            position,
            content_length,
            options: StreamOptions::default(),
        })
    }

    /// Override retry and flush settings
    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Current access URI
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Request headers sent with every range request
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Local payload path
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Bytes written to the payload so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total resource length, once known
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Whether the whole resource is on disk
    pub fn is_complete(&self) -> bool {
        self.content_length
            .map(|total| self.position >= total)
            .unwrap_or(false)
    }

    /// Point the stream at a reissued URI for the same remote file.
    ///
    /// Signed URLs expire; the reissued one must keep scheme, host and path and
    /// may only differ in its query. Offset and length are kept.
    pub fn set_uri_for_same_file(&mut self, uri: &str) -> Result<(), DownloadError> {
        let new_uri = parse_uri(uri)?;
        if !same_file(&self.uri, &new_uri) {
            return Err(DownloadError::DifferentResource(format!(
                "{}{} does not match {}{}",
                new_uri.host_str().unwrap_or_default(),
                new_uri.path(),
                self.uri.host_str().unwrap_or_default(),
                self.uri.path()
            )));
        }
        debug!(host = new_uri.host_str().unwrap_or_default(), "Retargeted download URI");
        self.uri = new_uri;
        Ok(())
    }

    /// Fetch until `limit` bytes (or the whole resource when `None`) are on disk.
    ///
    /// `on_checkpoint(position, content_length)` is invoked after the payload
    /// has been synced: every `flush_interval` bytes, on cancellation, before
    /// returning a transport error, and on completion.
    pub async fn fetch<F>(
        &mut self,
        limit: Option<u64>,
        cancel: &CancellationToken,
        mut on_checkpoint: F,
    ) -> Result<FetchOutcome, DownloadError>
    where
        F: FnMut(u64, Option<u64>) -> Result<(), DownloadError>,
    {
        if self.window_done(limit) {
            return Ok(FetchOutcome::Completed);
        }

        let mut file = self.open_payload().await?;
        let mut progress = TransferProgress::new(self.position, self.content_length);
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(FetchOutcome::Cancelled);
            }

            let attempt_start = self.position;
            let result = self
                .fetch_once(&mut file, limit, cancel, &mut on_checkpoint, &mut progress)
                .await;
            // Only attempts that made no progress count against the retry budget
            if self.position > attempt_start {
                retries = 0;
            }

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && retries < self.options.max_retries => {
                    let backoff = calculate_backoff(retries);
                    retries += 1;
                    warn!(
                        error = %e,
                        position = self.position,
                        retry_count = retries,
                        max_retries = self.options.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Range request failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once<F>(
        &mut self,
        file: &mut File,
        limit: Option<u64>,
        cancel: &CancellationToken,
        on_checkpoint: &mut F,
        progress: &mut TransferProgress,
    ) -> Result<FetchOutcome, DownloadError>
    where
        F: FnMut(u64, Option<u64>) -> Result<(), DownloadError>,
    {
        let mut response = self
            .transport
            .open(&self.uri, &self.headers, self.position)
            .await?;

        if let (Some(expected), Some(actual)) = (self.content_length, response.total_length) {
            if expected != actual {
                warn!(
                    error = %DownloadError::ResourceChanged { expected, actual },
                    discarded_bytes = self.position,
                    "Remote resource changed, restarting payload from offset 0"
                );
                self.content_length = Some(actual);
                progress.set_total(Some(actual));
                self.restart_payload(file, on_checkpoint, progress).await?;
                if response.start != 0 {
                    response = self.transport.open(&self.uri, &self.headers, 0).await?;
                }
            }
        }

        if response.start != self.position {
            if response.start != 0 {
                return Err(DownloadError::UnexpectedRange {
                    requested: self.position,
                    received: response.start,
                });
            }
            warn!(
                discarded_bytes = self.position,
                "Server ignored range request, restarting payload from offset 0"
            );
            self.restart_payload(file, on_checkpoint, progress).await?;
        }

        match (self.content_length, response.total_length) {
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(DownloadError::ResourceChanged { expected, actual });
            }
            (None, Some(actual)) => {
                self.content_length = Some(actual);
                progress.set_total(Some(actual));
            }
            _ => {}
        }

        let mut body = response.body;
        let mut unconfirmed = 0u64;

        loop {
            if self.window_done(limit) {
                self.checkpoint(file, on_checkpoint).await?;
                return Ok(FetchOutcome::Completed);
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Next::Cancelled,
                chunk = body.next() => Next::Chunk(chunk),
            };

            match next {
                Next::Cancelled => {
                    self.checkpoint(file, on_checkpoint).await?;
                    info!(position = self.position, "Download cancelled, progress saved");
                    return Ok(FetchOutcome::Cancelled);
                }
                Next::Chunk(Some(Ok(bytes))) => {
                    file.write_all(&bytes).await?;
                    let len = bytes.len() as u64;
                    self.position += len;
                    unconfirmed += len;
                    progress.update(len);

                    if progress.should_emit_update() {
                        info!(position = self.position, "{}", progress.format_progress());
                        progress.mark_emitted();
                    }

                    if unconfirmed >= self.options.flush_interval {
                        self.checkpoint(file, on_checkpoint).await?;
                        unconfirmed = 0;
                    }
                }
                Next::Chunk(Some(Err(e))) => {
                    self.checkpoint(file, on_checkpoint).await?;
                    return Err(e);
                }
                Next::Chunk(None) => {
                    match self.content_length {
                        Some(total) if self.position < total => {
                            self.checkpoint(file, on_checkpoint).await?;
                            return Err(DownloadError::NetworkError(format!(
                                "connection closed at byte {} of {total}",
                                self.position
                            )));
                        }
                        Some(_) => {}
                        None => self.content_length = Some(self.position),
                    }
                    self.checkpoint(file, on_checkpoint).await?;
                    debug!(position = self.position, "Download body finished");
                    return Ok(FetchOutcome::Completed);
                }
            }
        }
    }

    /// Drop every payload byte and report offset 0 as confirmed.
    async fn restart_payload<F>(
        &mut self,
        file: &mut File,
        on_checkpoint: &mut F,
        progress: &mut TransferProgress,
    ) -> Result<(), DownloadError>
    where
        F: FnMut(u64, Option<u64>) -> Result<(), DownloadError>,
    {
        self.position = 0;
        file.set_len(0).await?;
        file.seek(SeekFrom::Start(0)).await?;
        progress.restart();
        on_checkpoint(0, self.content_length)
    }

    /// Sync the payload, then report the confirmed offset.
    async fn checkpoint<F>(&self, file: &mut File, on_checkpoint: &mut F) -> Result<(), DownloadError>
    where
        F: FnMut(u64, Option<u64>) -> Result<(), DownloadError>,
    {
        file.flush().await?;
        file.sync_data().await?;
        on_checkpoint(self.position, self.content_length)
    }

    /// Open the payload positioned at the confirmed offset.
    ///
    /// Bytes past the offset were never confirmed and are dropped.
    async fn open_payload(&self) -> Result<File, DownloadError> {
        if let Some(parent) = self.temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.temp_path)
            .await?;

        let on_disk = file.metadata().await?.len();
        if on_disk < self.position {
            return Err(DownloadError::IoError(format!(
                "payload {} holds {on_disk} bytes, expected at least {}",
                self.temp_path.display(),
                self.position
            )));
        }
        if on_disk > self.position {
            debug!(
                on_disk,
                confirmed = self.position,
                "Truncating unconfirmed payload tail"
            );
            file.set_len(self.position).await?;
        }
        file.seek(SeekFrom::Start(self.position)).await?;
        Ok(file)
    }

    fn window_done(&self, limit: Option<u64>) -> bool {
        let target = match (limit, self.content_length) {
            (Some(limit), Some(total)) => Some(limit.min(total)),
            (Some(limit), None) => Some(limit),
            (None, total) => total,
        };
        target.map(|t| self.position >= t).unwrap_or(false)
    }
}

impl std::fmt::Debug for ResumableDownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableDownloadStream")
            .field("host", &self.uri.host_str())
            .field("temp_path", &self.temp_path)
            .field("position", &self.position)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

fn parse_uri(uri: &str) -> Result<Url, DownloadError> {
    Url::parse(uri).map_err(|e| DownloadError::InvalidUri(format!("{uri}: {e}")))
}

/// Same scheme, host, port and path; the query (signature) may differ.
fn same_file(current: &Url, candidate: &Url) -> bool {
    current.scheme() == candidate.scheme()
        && current.host_str() == candidate.host_str()
        && current.port_or_known_default() == candidate.port_or_known_default()
        && current.path() == candidate.path()
}
