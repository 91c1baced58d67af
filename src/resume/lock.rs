//! Exclusive ownership of a download's state and payload
//!
//! Advisory locking with fd-lock. The lock is held for as long as the
//! [`RunLock`] value lives, so two pipelines can never write the same
//! payload concurrently. Lock files are never deleted, so every run
//! contends on the same inode.

use super::state::ResumeError;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock held by the pipeline run that owns a state file
pub struct RunLock {
    path: PathBuf,
    _lock: RwLock<File>,
}

impl RunLock {
    /// Try to take ownership of the download described by `state_path`.
    ///
    /// Fails immediately if another run holds it.
    pub fn try_acquire(state_path: &Path) -> Result<Self, ResumeError> {
        if let Some(parent) = state_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ResumeError::IoError(e.to_string()))?;
        }

        let path = run_lock_path(state_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ResumeError::LockError(format!("Failed to open lock file: {e}")))?;

        let mut lock = RwLock::new(file);
        let guard = lock.try_write().map_err(|e| {
            ResumeError::LockError(format!(
                "{} is in use by another download: {e}",
                state_path.display()
            ))
        })?;
        // Keep the lock past the guard's scope; it is released when the file
        // handle in `_lock` closes.
        std::mem::forget(guard);

        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self { path, _lock: lock })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

/// Lock file guarding a whole run for the state at `state_path`
pub fn run_lock_path(state_path: &Path) -> PathBuf {
    state_path.with_extension("run.lock")
}
