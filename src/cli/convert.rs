//! Convert command implementation

use super::{Cli, CliError};
use crate::cancel::CancellationToken;
use crate::converter::{ConverterEvent, DecryptProgress, DownloadConverter, PassthroughTransform};
use crate::downloader::{HttpTransport, StreamOptions};
use crate::DownloadLicense;
use clap::Parser;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Arguments of the `convert` command
#[derive(Parser, Debug)]
pub struct ConvertArgs {
    /// License JSON file (download_url, user_agent, optional key and chapters)
    #[arg(long)]
    pub license: PathBuf,

    /// Directory for download state and partial payloads
    #[arg(long, default_value = ".cache")]
    pub cache_dir: PathBuf,

    /// Directory for the converted output
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Output file name (extension is normalized to .m4b)
    #[arg(long)]
    pub name: Option<String>,

    /// Image to embed instead of the container's own cover art
    #[arg(long)]
    pub cover_art: Option<PathBuf>,

    /// Disable the progress bar
    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
}

impl ConvertArgs {
    /// Run the conversion. `cancel` is tripped by Ctrl+C.
    pub async fn execute(&self, cli: &Cli, cancel: CancellationToken) -> Result<(), CliError> {
        let license = load_license(&self.license)?;
        ensure_convertible(&license)?;

        let options = StreamOptions {
            max_retries: cli.max_retries,
            ..StreamOptions::default()
        };
        let mut converter = DownloadConverter::new(
            &self.cache_dir,
            &self.output_dir,
            license,
            Arc::new(HttpTransport::new()?),
            Arc::new(PassthroughTransform::new()),
        )?
        .with_stream_options(options)
        .with_cancellation_token(cancel.clone());

        if let Some(name) = &self.name {
            converter.set_output_filename(name);
        }
        if let Some(path) = &self.cover_art {
            let bytes = std::fs::read(path).map_err(|e| {
                CliError::InvalidArgument(format!("Failed to read cover art {}: {e}", path.display()))
            })?;
            converter.set_cover_art(bytes);
        }

        let progress = (!self.no_progress).then(create_progress_bar);
        if let Some(pb) = &progress {
            attach_progress_bar(&converter, pb.clone());
        }

        info!(output = %converter.output_path().display(), "Starting conversion");
        let success = converter.run().await;

        if let Some(pb) = &progress {
            pb.finish_and_clear();
        }

        if success {
            match converter.speedup() {
                Some(speedup) => println!("Wrote {} ({speedup:.1}x)", converter.output_path().display()),
                None => println!("Wrote {}", converter.output_path().display()),
            }
            Ok(())
        } else if cancel.is_cancelled() {
            Err(CliError::Cancelled)
        } else {
            Err(CliError::ConversionFailed(format!(
                "see log for details; state kept at {}",
                converter.state_path().display()
            )))
        }
    }
}

/// Read a license from a JSON file
pub fn load_license(path: &Path) -> Result<DownloadLicense, CliError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        CliError::InvalidArgument(format!("Failed to read license {}: {e}", path.display()))
    })?;
    serde_json::from_str(&contents)
        .map_err(|e| CliError::InvalidArgument(format!("Invalid license {}: {e}", path.display())))
}

/// The bundled transform only copies unencrypted sources.
pub fn ensure_convertible(license: &DownloadLicense) -> Result<(), CliError> {
    if license.is_encrypted() {
        return Err(CliError::InvalidArgument(
            "license carries a decryption key; only unencrypted sources can be converted".into(),
        ));
    }
    Ok(())
}

fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .expect("hardcoded template is valid")
            .progress_chars("#>-"),
    );
    pb.set_message("downloading");
    pb
}

fn attach_progress_bar(converter: &DownloadConverter, pb: ProgressBar) {
    converter.subscribe(move |event| match event {
        ConverterEvent::TagsRetrieved(tags) => {
            if let Some(title) = &tags.title {
                pb.println(format!("Title: {title}"));
            }
        }
        ConverterEvent::DecryptProgress(DecryptProgress::Indeterminate) => {
            pb.set_message("converting");
        }
        ConverterEvent::DecryptProgress(DecryptProgress::Percent(percent)) => {
            pb.set_position(u64::from(*percent));
        }
        ConverterEvent::DecryptTimeRemaining(remaining) => {
            pb.set_message(format!("{} remaining", HumanDuration(*remaining)));
        }
        ConverterEvent::CoverArtRetrieved(_) => {}
    });
}
