//! Download persister
//!
//! Binds a [`ResumableDownloadStream`] to its [`PersistedDownloadState`] and
//! keeps the two consistent for the lifetime of one pipeline run. Recovery
//! from a corrupt or stale state file happens here and is never surfaced to
//! the caller: the state and payload are discarded and the download starts
//! over from offset zero.

use super::lock::RunLock;
use super::state::{PersistedDownloadState, ResumeError};
use crate::cancel::CancellationToken;
use crate::downloader::{DownloadError, FetchOutcome, RangeTransport, ResumableDownloadStream, StreamOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owner of one download's state file, payload and run lock
pub struct DownloadPersister {
    state_path: PathBuf,
    state: PersistedDownloadState,
    stream: ResumableDownloadStream,
    _lock: RunLock,
}

impl DownloadPersister {
    /// Open the download for `uri`, resuming from `state_path` when possible.
    ///
    /// A loadable state whose payload checks out is re-pointed at `uri` and
    /// continues from its recorded offset. Anything else (unreadable JSON,
    /// unknown schema, short payload, a different remote file) discards the
    /// state and payload and starts fresh.
    pub fn open(
        state_path: impl Into<PathBuf>,
        temp_path: impl Into<PathBuf>,
        uri: &str,
        headers: BTreeMap<String, String>,
        transport: Arc<dyn RangeTransport>,
        options: StreamOptions,
    ) -> Result<Self, ResumeError> {
        let state_path = state_path.into();
        let temp_path = temp_path.into();
        let lock = RunLock::try_acquire(&state_path)?;

        if state_path.exists() {
            match resume(&state_path, &temp_path, uri, transport.clone()) {
                Ok((state, stream)) => {
                    info!(
                        state_path = %state_path.display(),
                        bytes_downloaded = state.bytes_downloaded(),
                        content_length = ?state.content_length(),
                        "Resuming download"
                    );
                    return Ok(Self {
                        state_path,
                        state,
                        stream: stream.with_options(options),
                        _lock: lock,
                    });
                }
                Err(e) => {
                    warn!(
                        state_path = %state_path.display(),
                        error = %e,
                        "Discarding unusable download state, restarting from offset 0"
                    );
                    Self::discard(&state_path, &temp_path)?;
                }
            }
        } else if temp_path.exists() {
            debug!(temp_path = %temp_path.display(), "Removing orphan payload");
            Self::discard(&state_path, &temp_path)?;
        }

        let state = PersistedDownloadState::new(uri, headers.clone(), &temp_path);
        let stream = ResumableDownloadStream::new(transport, uri, headers, &temp_path)
            .map_err(|e| ResumeError::InvalidUri(e.to_string()))?
            .with_options(options);
        state.save(&state_path)?;

        info!(state_path = %state_path.display(), "Starting new download");
        Ok(Self {
            state_path,
            state,
            stream,
            _lock: lock,
        })
    }

    /// Point the download at a reissued URI for the same remote file.
    ///
    /// The recorded offset and payload are untouched.
    pub fn retarget(&mut self, uri: &str) -> Result<(), ResumeError> {
        self.stream
            .set_uri_for_same_file(uri)
            .map_err(|e| ResumeError::DifferentResource(e.to_string()))?;
        self.state.set_uri(uri);
        self.state.save(&self.state_path)
    }

    /// Fetch until `limit` bytes (or everything when `None`) are on disk.
    ///
    /// Confirmed progress is written back to the state file as it arrives.
    pub async fn download_to(
        &mut self,
        limit: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError> {
        let state_path = &self.state_path;
        let state = &mut self.state;
        self.stream
            .fetch(limit, cancel, |position, content_length| {
                state.record_progress(position, content_length);
                state
                    .save(state_path)
                    .map_err(|e| DownloadError::StateError(e.to_string()))
            })
            .await
    }

    /// Current persisted state
    pub fn state(&self) -> &PersistedDownloadState {
        &self.state
    }

    /// State file location
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Payload location
    pub fn temp_path(&self) -> &Path {
        self.stream.temp_path()
    }

    /// Whether the whole remote resource is on disk
    pub fn is_complete(&self) -> bool {
        self.stream.is_complete()
    }

    /// Write the current state without giving up the run lock
    pub fn save(&self) -> Result<(), ResumeError> {
        self.state.save(&self.state_path)?;
        debug!(
            state_path = %self.state_path.display(),
            bytes_downloaded = self.state.bytes_downloaded(),
            "Download state saved"
        );
        Ok(())
    }

    /// Write the final state and release the run lock.
    ///
    /// State and payload stay on disk; removing them is the caller's job.
    pub fn close(self) -> Result<(), ResumeError> {
        self.save()
    }

    /// Delete a state file and its payload. Missing files are not an error.
    pub fn discard(state_path: &Path, temp_path: &Path) -> Result<(), ResumeError> {
        for path in [state_path, temp_path] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ResumeError::IoError(format!(
                        "Failed to remove {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DownloadPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadPersister")
            .field("state_path", &self.state_path)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

/// Load and validate an existing state, then retarget it at `uri`.
fn resume(
    state_path: &Path,
    temp_path: &Path,
    uri: &str,
    transport: Arc<dyn RangeTransport>,
) -> Result<(PersistedDownloadState, ResumableDownloadStream), ResumeError> {
    let mut state = PersistedDownloadState::load(state_path)?;

    if state.temp_path() != temp_path {
        return Err(ResumeError::CorruptState(format!(
            "state points at {}, expected {}",
            state.temp_path().display(),
            temp_path.display()
        )));
    }
    state.verify_payload()?;

    let mut stream = ResumableDownloadStream::resume(
        transport,
        state.uri(),
        state.headers().clone(),
        temp_path,
        state.bytes_downloaded(),
        state.content_length(),
    )
    .map_err(|e| ResumeError::CorruptState(e.to_string()))?;

    stream
        .set_uri_for_same_file(uri)
        .map_err(|e| ResumeError::DifferentResource(e.to_string()))?;
    state.set_uri(uri);
    state.save(state_path)?;

    Ok((state, stream))
}
