//! Persisted download state
//!
//! One JSON record per in-flight download. Writes are atomic (temp file +
//! rename) and coordinated through an advisory lock file, so a crash leaves
//! either the previous record or the new one, never a torn file.

use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current state schema version
const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum allowed state file size (10 MB) to prevent memory exhaustion
pub const MAX_STATE_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Durable record of a single in-flight download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDownloadState {
    schema_version: String,
    uri: String,
    headers: BTreeMap<String, String>,
    temp_path: PathBuf,
    bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_length: Option<u64>,
    created_at: i64,
    updated_at: i64,
}

impl PersistedDownloadState {
    /// Create a fresh zero-progress state
    pub fn new(
        uri: impl Into<String>,
        headers: BTreeMap<String, String>,
        temp_path: impl Into<PathBuf>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            uri: uri.into(),
            headers,
            temp_path: temp_path.into(),
            bytes_downloaded: 0,
            content_length: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Remote URI of the last successful (re)start
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Request headers
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Local payload path
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Bytes confirmed on disk
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    /// Total remote length, once the server reported it
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Creation timestamp (Unix milliseconds)
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Last update timestamp (Unix milliseconds)
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Whether every byte of the remote resource is on disk
    pub fn is_complete(&self) -> bool {
        self.content_length
            .map(|total| self.bytes_downloaded >= total)
            .unwrap_or(false)
    }

    /// Replace the URI after URL rotation. Progress fields are untouched.
    pub(crate) fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
        self.touch();
    }

    /// Record confirmed progress.
    pub(crate) fn record_progress(&mut self, bytes_downloaded: u64, content_length: Option<u64>) {
        self.bytes_downloaded = bytes_downloaded;
        if content_length.is_some() {
            self.content_length = content_length;
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// Validate schema version (accepts current version only)
    pub fn validate_schema_version(&self) -> Result<(), ResumeError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ResumeError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }
        Ok(())
    }

    /// Check the recorded progress against the payload on disk.
    ///
    /// Returns the payload length. Recorded bytes beyond the payload length
    /// mean the state is corrupt.
    pub fn verify_payload(&self) -> Result<u64, ResumeError> {
        let on_disk = match std::fs::metadata(&self.temp_path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(ResumeError::IoError(e.to_string())),
        };

        if self.bytes_downloaded > on_disk {
            return Err(ResumeError::CorruptState(format!(
                "state records {} bytes but {} holds {on_disk}",
                self.bytes_downloaded,
                self.temp_path.display()
            )));
        }

        if let Some(total) = self.content_length {
            if self.bytes_downloaded > total {
                return Err(ResumeError::CorruptState(format!(
                    "state records {} bytes of a {total} byte resource",
                    self.bytes_downloaded
                )));
            }
        }

        Ok(on_disk)
    }

    /// Save state to file with atomic writes and file locking
    pub fn save(&self, path: &Path) -> Result<(), ResumeError> {
        debug!(
            path = %path.display(),
            bytes_downloaded = self.bytes_downloaded,
            "Saving download state"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ResumeError::IoError(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ResumeError::SerializationError(e.to_string()))?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(io_lock_path(path))
            .map_err(|e| ResumeError::LockError(format!("Failed to create lock file: {e}")))?;

        let mut lock = RwLock::new(lock_file);
        let _guard = lock
            .write()
            .map_err(|e| ResumeError::LockError(format!("Failed to acquire write lock: {e}")))?;

        let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| ResumeError::IoError(format!("Failed to create temp file: {e}")))?;

        temp_file
            .write_all(json.as_bytes())
            .map_err(|e| ResumeError::IoError(format!("Failed to write to temp file: {e}")))?;
        temp_file
            .flush()
            .map_err(|e| ResumeError::IoError(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| ResumeError::IoError(format!("Failed to sync temp file: {e}")))?;

        temp_file
            .persist(path)
            .map_err(|e| ResumeError::IoError(format!("Failed to persist temp file: {e}")))?;

        // Make the rename itself durable
        if let Some(parent) = path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }

    /// Load state from file with locking
    ///
    /// Unparseable content is reported as [`ResumeError::CorruptState`].
    pub fn load(path: &Path) -> Result<Self, ResumeError> {
        debug!(path = %path.display(), "Loading download state");

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(io_lock_path(path))
            .map_err(|e| ResumeError::LockError(format!("Failed to create lock file: {e}")))?;

        let lock = RwLock::new(lock_file);
        let _guard = lock
            .read()
            .map_err(|e| ResumeError::LockError(format!("Failed to acquire read lock: {e}")))?;

        let metadata = std::fs::metadata(path).map_err(|e| ResumeError::IoError(e.to_string()))?;
        if metadata.len() > MAX_STATE_FILE_SIZE {
            return Err(ResumeError::StateTooLarge {
                size: metadata.len(),
                max: MAX_STATE_FILE_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| ResumeError::CorruptState(e.to_string()))?;

        let state: PersistedDownloadState = serde_json::from_str(&contents).map_err(|e| {
            warn!(error = %e, "Failed to deserialize download state");
            ResumeError::CorruptState(e.to_string())
        })?;

        state.validate_schema_version()?;

        info!(
            bytes_downloaded = state.bytes_downloaded,
            content_length = ?state.content_length,
            "Download state loaded"
        );

        Ok(state)
    }
}

/// Lock file coordinating individual state reads and writes
pub fn io_lock_path(state_path: &Path) -> PathBuf {
    state_path.with_extension("lock")
}

/// Errors related to persisted download state
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// State file too large
    #[error("state file too large: {size} bytes (max: {max} bytes)")]
    StateTooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// State is unreadable or inconsistent with the payload
    #[error("corrupt download state: {0}")]
    CorruptState(String),

    /// Persisted URI does not address the same remote file as the new one
    #[error("different remote resource: {0}")]
    DifferentResource(String),

    /// Download URI could not be parsed
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Lock error
    #[error("lock error: {0}")]
    LockError(String),
}
