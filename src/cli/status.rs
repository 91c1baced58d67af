//! Status command: inspect persisted download state

use super::CliError;
use crate::downloader::progress::format_bytes;
use crate::resume::PersistedDownloadState;
use clap::Parser;
use std::path::{Path, PathBuf};

/// Arguments of the `status` command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Directory holding download state files
    #[arg(long, default_value = ".cache")]
    pub cache_dir: PathBuf,
}

impl StatusArgs {
    /// Print every state file in the cache directory.
    ///
    /// Fails if any state file is unreadable; the next `convert` would
    /// discard it and start over.
    pub async fn execute(&self) -> Result<(), CliError> {
        if !self.cache_dir.exists() {
            println!("No download state found at {}", self.cache_dir.display());
            return Ok(());
        }
        if !self.cache_dir.is_dir() {
            return Err(CliError::InvalidArgument(format!(
                "{} is not a directory",
                self.cache_dir.display()
            )));
        }

        let mut state_files: Vec<PathBuf> = std::fs::read_dir(&self.cache_dir)
            .map_err(|e| CliError::InvalidArgument(format!("Failed to read cache dir: {e}")))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        state_files.sort();

        if state_files.is_empty() {
            println!("No downloads in progress");
            return Ok(());
        }

        let mut invalid = 0;
        for path in &state_files {
            match PersistedDownloadState::load(path) {
                Ok(state) => println!("{}", describe(path, &state)),
                Err(e) => {
                    println!("  - {} (unusable: {e})", display_name(path));
                    invalid += 1;
                }
            }
        }

        if invalid > 0 {
            return Err(CliError::InvalidArgument(format!(
                "Found {invalid} unusable state file(s)"
            )));
        }
        Ok(())
    }
}

/// One status line for a state file
pub fn describe(path: &Path, state: &PersistedDownloadState) -> String {
    let downloaded = format_bytes(state.bytes_downloaded());
    let progress = match state.content_length() {
        Some(total) if total > 0 => format!(
            "{downloaded} of {} ({:.1}%)",
            format_bytes(total),
            state.bytes_downloaded() as f64 / total as f64 * 100.0
        ),
        _ => downloaded,
    };
    let updated = chrono::DateTime::from_timestamp_millis(state.updated_at())
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_default();
    format!("  - {}: {progress}, updated {updated}", display_name(path))
}

fn display_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
