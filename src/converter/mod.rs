//! Download-and-convert pipeline
//!
//! [`DownloadConverter`] runs one audiobook through a fixed sequence of named
//! stages:
//!
//! 1. **Create directory** - output and cache directories
//! 2. **Get metadata** - open or repair the persisted download, fetch the
//!    container header, read tags and cover art
//! 3. **Download and convert** - finish the download and run the transform
//! 4. **Create cue sheet** - best effort
//! 5. **Create NFO** - best effort
//! 6. **Cleanup** - remove the state file and payload, best effort
//!
//! The first three stages are critical: their failure stops the run. The
//! sidecar and cleanup stages log their own failures and carry on.
//!
//! # Cancellation
//!
//! [`DownloadConverter::cancel`] may be called from any task or thread. Each
//! stage checks the token on entry and exit; the download checks it per
//! chunk and the transform receives it by value. A cancelled run returns
//! `false` and leaves the state file in place for the next attempt, which
//! needs a fresh converter since the token never resets.

pub mod estimate;
pub mod events;
pub mod paths;
pub mod sidecar;
pub mod steps;
pub mod transform;

pub use estimate::{ProgressEstimate, ProgressEstimator, ProgressSample};
pub use events::{ConverterEvent, DecryptProgress, EventHub, EventKind};
pub use sidecar::{PlainSidecars, SidecarWriter};
pub use steps::{StepResult, StepSequence};
pub use transform::{
    AudioMetadata, AudioTransform, PassthroughTransform, ProgressSink, TransformError,
    TransformOutcome, TransformRequest,
};

use crate::cancel::CancellationToken;
use crate::downloader::config::HEADER_PROBE_BYTES;
use crate::downloader::{FetchOutcome, RangeTransport, StreamOptions};
use crate::resume::state::io_lock_path;
use crate::resume::DownloadPersister;
use crate::{ChapterInfo, DownloadLicense};
use bytes::Bytes;
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Converter setup errors
#[derive(Debug, thiserror::Error)]
pub enum ConverterError {
    /// License cannot be used for a download
    #[error("invalid license: {0}")]
    InvalidLicense(String),
}

/// Downloads one audiobook and converts it into an `.m4b` file
pub struct DownloadConverter {
    cache_dir: PathBuf,
    output_dir: PathBuf,
    output_path: PathBuf,
    license: Arc<DownloadLicense>,
    transport: Arc<dyn RangeTransport>,
    transform: Arc<dyn AudioTransform>,
    sidecars: Arc<dyn SidecarWriter>,
    cover_art: Option<Bytes>,
    stream_options: StreamOptions,
    events: EventHub,
    cancel: CancellationToken,
    speedup: Mutex<Option<f64>>,
}

impl DownloadConverter {
    /// Create a converter writing `<output_dir>/audiobook.m4b` until
    /// [`set_output_filename`](Self::set_output_filename) says otherwise.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        license: DownloadLicense,
        transport: Arc<dyn RangeTransport>,
        transform: Arc<dyn AudioTransform>,
    ) -> Result<Self, ConverterError> {
        let url = reqwest::Url::parse(&license.download_url)
            .map_err(|e| ConverterError::InvalidLicense(format!("download URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConverterError::InvalidLicense(format!(
                "unsupported URL scheme {}",
                url.scheme()
            )));
        }

        let output_dir = output_dir.into();
        let output_path = paths::resolve_output_path(&output_dir, Path::new(paths::DEFAULT_OUTPUT_NAME));

        Ok(Self {
            cache_dir: cache_dir.into(),
            output_dir,
            output_path,
            license: Arc::new(license),
            transport,
            transform,
            sidecars: Arc::new(PlainSidecars),
            cover_art: None,
            stream_options: StreamOptions::default(),
            events: EventHub::new(),
            cancel: CancellationToken::new(),
            speedup: Mutex::new(None),
        })
    }

    /// Use a different sidecar renderer
    pub fn with_sidecars(mut self, sidecars: Arc<dyn SidecarWriter>) -> Self {
        self.sidecars = sidecars;
        self
    }

    /// Share an externally owned cancellation token, e.g. one tied to Ctrl+C
    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override download retry and flush settings
    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.stream_options = options;
        self
    }

    /// Set the output file name.
    ///
    /// Relative names are placed in the output directory; the extension is
    /// normalized to `.m4b`.
    pub fn set_output_filename(&mut self, name: impl AsRef<Path>) {
        self.output_path = paths::resolve_output_path(&self.output_dir, name.as_ref());
    }

    /// Cover art to embed into the output, overriding the container's own
    pub fn set_cover_art(&mut self, cover_art: impl Into<Bytes>) {
        self.cover_art = Some(cover_art.into());
    }

    /// Output file location
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Persisted download state location
    pub fn state_path(&self) -> PathBuf {
        paths::state_path_for(&self.cache_dir, &self.output_path)
    }

    /// Downloaded payload location
    pub fn temp_path(&self) -> PathBuf {
        paths::temp_path_for(&self.state_path())
    }

    /// Cue sheet location
    pub fn cue_path(&self) -> PathBuf {
        paths::cue_path_for(&self.output_path)
    }

    /// NFO location
    pub fn nfo_path(&self) -> PathBuf {
        paths::nfo_path_for(&self.output_path)
    }

    /// Event subscription list
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Receive every converter event. Listeners must return quickly.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&ConverterEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener);
    }

    /// Token observed by the running pipeline
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation of the running pipeline.
    ///
    /// Cancellation is permanent: every later [`run`](Self::run) on this
    /// converter returns `false` without doing any work. Build a new
    /// converter to retry; it resumes from the saved state.
    pub fn cancel(&self) {
        info!(output = %self.output_path.display(), "Cancellation requested");
        self.cancel.cancel();
    }

    /// Content duration divided by wall time of the last successful run
    pub fn speedup(&self) -> Option<f64> {
        match self.speedup.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Run the whole pipeline. Returns `true` only if every stage succeeded.
    pub async fn run(&self) -> bool {
        let span = info_span!("convert", output = %self.output_path.display());

        async {
            let steps = pipeline_steps();
            let mut run = PipelineRun::new(self);
            let result = steps.run(&mut run).await;
            let elapsed_ms = result.elapsed.as_millis() as u64;

            if result.success {
                let speedup = speedup_ratio(run.duration, result.elapsed);
                match self.speedup.lock() {
                    Ok(mut guard) => *guard = speedup,
                    Err(poisoned) => *poisoned.into_inner() = speedup,
                }
                info!(elapsed_ms, speedup = ?speedup, "Conversion succeeded");
            } else {
                error!(
                    elapsed_ms,
                    cancelled = self.cancel.is_cancelled(),
                    "Conversion failed"
                );
            }
            result.success
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for DownloadConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadConverter")
            .field("cache_dir", &self.cache_dir)
            .field("output_path", &self.output_path)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn pipeline_steps() -> StepSequence<PipelineRun> {
    let mut steps = StepSequence::new();
    steps.add("Create directory", |run: &mut PipelineRun| run.create_directory().boxed());
    steps.add("Get metadata", |run: &mut PipelineRun| run.get_metadata().boxed());
    steps.add("Download and convert", |run: &mut PipelineRun| {
        run.download_and_convert().boxed()
    });
    steps.add("Create cue sheet", |run: &mut PipelineRun| run.create_cue_sheet().boxed());
    steps.add("Create NFO", |run: &mut PipelineRun| run.create_nfo().boxed());
    steps.add("Cleanup", |run: &mut PipelineRun| run.cleanup().boxed());
    steps
}

/// Ratio of content duration to wall time, when both are meaningful
fn speedup_ratio(duration: Duration, elapsed: Duration) -> Option<f64> {
    let elapsed = elapsed.as_secs_f64();
    if elapsed <= 0.0 {
        return None;
    }
    let ratio = duration.as_secs_f64() / elapsed;
    (ratio.is_normal() && ratio > 0.0).then_some(ratio)
}

/// State of one `run()` invocation
struct PipelineRun {
    cache_dir: PathBuf,
    output_dir: PathBuf,
    output_path: PathBuf,
    state_path: PathBuf,
    temp_path: PathBuf,
    license: Arc<DownloadLicense>,
    transport: Arc<dyn RangeTransport>,
    transform: Arc<dyn AudioTransform>,
    sidecars: Arc<dyn SidecarWriter>,
    external_cover_art: Option<Bytes>,
    stream_options: StreamOptions,
    events: EventHub,
    cancel: CancellationToken,
    persister: Option<DownloadPersister>,
    metadata: AudioMetadata,
    chapters: Option<ChapterInfo>,
    duration: Duration,
}

impl PipelineRun {
    fn new(converter: &DownloadConverter) -> Self {
        let state_path = converter.state_path();
        let temp_path = paths::temp_path_for(&state_path);
        Self {
            cache_dir: converter.cache_dir.clone(),
            output_dir: converter.output_dir.clone(),
            output_path: converter.output_path.clone(),
            state_path,
            temp_path,
            license: converter.license.clone(),
            transport: converter.transport.clone(),
            transform: converter.transform.clone(),
            sidecars: converter.sidecars.clone(),
            external_cover_art: converter.cover_art.clone(),
            stream_options: converter.stream_options,
            events: converter.events.clone(),
            cancel: converter.cancel.clone(),
            persister: None,
            metadata: AudioMetadata::default(),
            chapters: converter.license.chapters.clone(),
            duration: Duration::ZERO,
        }
    }

    fn cancelled(&self) -> bool {
        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            info!("Cancellation observed");
        }
        cancelled
    }

    fn request_headers(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("User-Agent".to_string(), self.license.user_agent.clone())])
    }

    async fn create_directory(&mut self) -> bool {
        if self.cancelled() {
            return false;
        }

        let mut dirs = vec![self.output_dir.clone(), self.cache_dir.clone()];
        if let Some(parent) = self.output_path.parent() {
            dirs.push(parent.to_path_buf());
        }

        for dir in dirs {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                error!(path = %dir.display(), error = %e, "Failed to create directory");
                return false;
            }
        }

        !self.cancelled()
    }

    async fn get_metadata(&mut self) -> bool {
        if self.cancelled() {
            return false;
        }

        let persister = match DownloadPersister::open(
            &self.state_path,
            &self.temp_path,
            &self.license.download_url,
            self.request_headers(),
            self.transport.clone(),
            self.stream_options,
        ) {
            Ok(persister) => persister,
            Err(e) => {
                error!(state_path = %self.state_path.display(), error = %e, "Failed to open download state");
                return false;
            }
        };
        let persister = self.persister.insert(persister);

        match persister.download_to(Some(HEADER_PROBE_BYTES), &self.cancel).await {
            Ok(FetchOutcome::Completed) => {}
            Ok(FetchOutcome::Cancelled) => return false,
            Err(e) => {
                error!(error = %e, "Failed to download container header");
                return false;
            }
        }

        let metadata = match self.transform.read_metadata(&self.temp_path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(error = %e, "Failed to read container metadata");
                return false;
            }
        };

        if self.chapters.is_none() {
            self.chapters = metadata.chapters.clone();
        }
        self.duration = if metadata.duration.is_zero() {
            self.chapters
                .as_ref()
                .map(ChapterInfo::total_duration)
                .unwrap_or_default()
        } else {
            metadata.duration
        };

        debug!(
            title = metadata.tags.title.as_deref().unwrap_or_default(),
            duration_secs = self.duration.as_secs(),
            has_cover_art = metadata.cover_art.is_some(),
            "Container metadata read"
        );

        self.events
            .emit(&ConverterEvent::TagsRetrieved(metadata.tags.clone()));
        self.events
            .emit(&ConverterEvent::CoverArtRetrieved(metadata.cover_art.clone()));
        self.metadata = metadata;

        !self.cancelled()
    }

    async fn download_and_convert(&mut self) -> bool {
        if self.cancelled() {
            return false;
        }

        self.events
            .emit(&ConverterEvent::DecryptProgress(DecryptProgress::Indeterminate));
        let ok = self.download_and_transform().await;
        self.events
            .emit(&ConverterEvent::DecryptProgress(DecryptProgress::Percent(0)));

        ok && !self.cancelled()
    }

    async fn download_and_transform(&mut self) -> bool {
        let Some(persister) = self.persister.as_mut() else {
            error!("Download state is not open");
            return false;
        };

        match persister.download_to(None, &self.cancel).await {
            Ok(FetchOutcome::Completed) => {}
            Ok(FetchOutcome::Cancelled) => return false,
            Err(e) => {
                error!(error = %e, "Download failed");
                return false;
            }
        }
        info!(
            bytes = persister.state().bytes_downloaded(),
            "Download complete"
        );

        let output = match tokio::fs::File::create(&self.output_path).await {
            Ok(file) => file.into_std().await,
            Err(e) => {
                error!(path = %self.output_path.display(), error = %e, "Failed to create output file");
                return false;
            }
        };

        let estimator = ProgressEstimator::new(self.duration);
        let events = self.events.clone();
        let sink: ProgressSink = Arc::new(move |sample| {
            let estimate = estimator.estimate(sample);
            events.emit(&ConverterEvent::DecryptProgress(DecryptProgress::Percent(
                estimate.percent,
            )));
            if let Some(remaining) = estimate.remaining {
                events.emit(&ConverterEvent::DecryptTimeRemaining(remaining));
            }
        });

        let request = TransformRequest {
            source: self.temp_path.clone(),
            output,
            output_path: self.output_path.clone(),
            key: self.license.key.clone(),
            chapters: self.chapters.clone(),
            duration: self.duration,
        };

        let chapters = match self.transform.transform(request, sink, self.cancel.clone()).await {
            Ok(TransformOutcome::Decrypted { chapters }) => chapters,
            Ok(TransformOutcome::Passthrough { chapters }) => {
                debug!("Source was not encrypted, copied through");
                chapters
            }
            Ok(TransformOutcome::Cancelled) => {
                info!("Transform cancelled");
                return false;
            }
            Err(e) => {
                error!(error = %e, "Transform failed");
                return false;
            }
        };
        self.chapters = Some(chapters);

        if let Some(cover_art) = &self.external_cover_art {
            if let Err(e) = self.transform.embed_cover_art(&self.output_path, cover_art).await {
                error!(error = %e, "Failed to embed cover art");
                return false;
            }
        }

        if let Some(persister) = &self.persister {
            if let Err(e) = persister.save() {
                warn!(error = %e, "Failed to write final download state");
            }
        }

        true
    }

    async fn create_cue_sheet(&mut self) -> bool {
        if self.cancelled() {
            return false;
        }

        let path = paths::cue_path_for(&self.output_path);
        let audio_file_name = self
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let chapters = self.chapters.clone().unwrap_or_default();
        let contents = self.sidecars.cue_sheet(&audio_file_name, &chapters);

        match tokio::fs::write(&path, contents).await {
            Ok(()) => debug!(path = %path.display(), "Cue sheet written"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to write cue sheet"),
        }

        !self.cancelled()
    }

    async fn create_nfo(&mut self) -> bool {
        if self.cancelled() {
            return false;
        }

        let path = paths::nfo_path_for(&self.output_path);
        let chapters = self.chapters.clone().unwrap_or_default();
        let contents = self.sidecars.nfo(&self.metadata, &chapters);

        match tokio::fs::write(&path, contents).await {
            Ok(()) => debug!(path = %path.display(), "NFO written"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to write NFO"),
        }

        !self.cancelled()
    }

    async fn cleanup(&mut self) -> bool {
        if self.cancelled() {
            return false;
        }

        // Removed while the run lock is still held. The run lock file itself
        // stays so every run locks the same inode.
        let artifacts = [
            self.state_path.clone(),
            self.temp_path.clone(),
            io_lock_path(&self.state_path),
        ];
        for path in artifacts {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove"),
            }
        }
        self.persister = None;

        !self.cancelled()
    }
}
