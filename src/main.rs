//! Main entry point for the audiobook-downloader CLI

use audiobook_downloader::cli::{Cli, Commands};
use audiobook_downloader::CancellationToken;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("audiobook_downloader=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    // Ctrl+C cancels the run; confirmed download progress stays on disk
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - saving progress...");
                cancel.cancel();
            }
        }
    });

    let result = match cli.command {
        Commands::Convert(ref args) => args
            .execute(&cli, cancel.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Status(ref args) => args.execute().await.map_err(|e| anyhow::anyhow!(e)),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}
