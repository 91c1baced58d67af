//! CLI command implementations

pub mod convert;
pub mod error;
pub mod status;

pub use convert::ConvertArgs;
pub use error::CliError;
pub use status::StatusArgs;

use clap::{Parser, Subcommand};

/// Audiobook Downloader CLI
#[derive(Parser, Debug)]
#[command(name = "audiobook-downloader")]
#[command(about = "Download audiobooks with resume support and convert them to m4b", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Maximum number of retries for failed range requests (default: 5, range: 0-20)
    #[arg(long, global = true, default_value = "5", value_parser = clap::value_parser!(u32).range(0..=20))]
    pub max_retries: u32,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download and convert one audiobook
    Convert(ConvertArgs),

    /// Show persisted download state in a cache directory
    Status(StatusArgs),
}
