//! Resume capability for interrupted downloads
//!
//! Provides persistent state management with atomic writes and file locking,
//! and the [`DownloadPersister`] that keeps a state file and its payload in
//! step while a download runs.

pub mod lock;
pub mod persister;
pub mod state;

pub use lock::RunLock;
pub use persister::DownloadPersister;
pub use state::{PersistedDownloadState, ResumeError};
