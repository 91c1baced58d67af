//! CLI error types and conversions

use crate::converter::ConverterError;
use crate::downloader::DownloadError;
use crate::resume::ResumeError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Converter setup error
    #[error("converter error: {0}")]
    ConverterError(#[from] ConverterError),

    /// Download error
    #[error("download error: {0}")]
    DownloadError(#[from] DownloadError),

    /// Resume error
    #[error("resume error: {0}")]
    ResumeError(#[from] ResumeError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Pipeline reported failure
    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    /// Run was cancelled
    #[error("cancelled, progress saved for the next run")]
    Cancelled,
}
