//! Shared fakes for integration tests: an in-memory range transport and a
//! scripted audio transform.

#![allow(dead_code)]

use async_trait::async_trait;
use audiobook_downloader::cancel::CancellationToken;
use audiobook_downloader::converter::{
    AudioMetadata, AudioTransform, ConverterEvent, DownloadConverter, ProgressSample, ProgressSink,
    TransformError, TransformOutcome, TransformRequest,
};
use audiobook_downloader::downloader::{
    ByteStream, DownloadError, RangeResponse, RangeTransport, StreamOptions,
};
use audiobook_downloader::{AudioTags, ChapterInfo, DecryptionKey, DownloadLicense};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Url;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Payload size used by pipeline tests; larger than the header probe window
pub const PAYLOAD_LEN: usize = 200 * 1024;

pub const URL_V1: &str = "https://cdn.example.com/books/the-book.aaxc?token=first";
pub const URL_V2: &str = "https://cdn.example.com/books/the-book.aaxc?token=second";

pub fn sample_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Serves a byte buffer from memory, recording every requested offset
pub struct MemoryTransport {
    data: Vec<u8>,
    chunk: usize,
    cut_at: Option<u64>,
    stall_at: Option<u64>,
    reset_every: Option<u64>,
    ignore_range: bool,
    fail_first: Mutex<u32>,
    offsets: Mutex<Vec<u64>>,
    user_agents: Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            chunk: 4096,
            cut_at: None,
            stall_at: None,
            reset_every: None,
            ignore_range: false,
            fail_first: Mutex::new(0),
            offsets: Mutex::new(Vec::new()),
            user_agents: Mutex::new(Vec::new()),
        }
    }

    /// Body fails with a non-retryable error once `offset` is reached
    pub fn cut_at(mut self, offset: u64) -> Self {
        self.cut_at = Some(offset);
        self
    }

    /// Body stops producing (without ending) once `offset` is reached
    pub fn stall_at(mut self, offset: u64) -> Self {
        self.stall_at = Some(offset);
        self
    }

    /// Every connection drops with a retryable error after `bytes` bytes
    pub fn resetting_every(mut self, bytes: u64) -> Self {
        self.reset_every = Some(bytes);
        self
    }

    /// Always answer from offset 0, like a server without range support
    pub fn ignoring_range(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    /// First `n` requests fail with 503
    pub fn failing_first(self, n: u32) -> Self {
        *self.fail_first.lock().unwrap() = n;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }

    pub fn user_agents(&self) -> Vec<String> {
        self.user_agents.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeTransport for MemoryTransport {
    async fn open(
        &self,
        _uri: &Url,
        headers: &BTreeMap<String, String>,
        offset: u64,
    ) -> Result<RangeResponse, DownloadError> {
        self.offsets.lock().unwrap().push(offset);
        if let Some(ua) = headers.get("User-Agent") {
            self.user_agents.lock().unwrap().push(ua.clone());
        }

        {
            let mut fail_first = self.fail_first.lock().unwrap();
            if *fail_first > 0 {
                *fail_first -= 1;
                return Err(DownloadError::HttpStatus(503));
            }
        }

        let len = self.data.len() as u64;
        let start = if self.ignore_range { 0 } else { offset };
        if start >= len {
            return Ok(RangeResponse::empty(start, Some(len)));
        }

        let cut = self.cut_at.filter(|c| *c > start && *c < len);
        let stall = self.stall_at.filter(|s| *s > start && *s < len);
        let reset = self.reset_every.map(|n| start + n).filter(|r| *r < len);
        let boundary = [cut, stall, reset]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(len);
        let chunks: Vec<Result<Bytes, DownloadError>> = self.data[start as usize..boundary as usize]
            .chunks(self.chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let body = futures_util::stream::iter(chunks);

        let body: ByteStream = if cut == Some(boundary) {
            Box::pin(body.chain(futures_util::stream::once(async {
                Err(DownloadError::HttpStatus(403))
            })))
        } else if reset == Some(boundary) {
            Box::pin(body.chain(futures_util::stream::once(async {
                Err(DownloadError::NetworkError("connection reset by peer".into()))
            })))
        } else if stall == Some(boundary) {
            Box::pin(body.chain(futures_util::stream::pending()))
        } else {
            Box::pin(body)
        };

        Ok(RangeResponse {
            start,
            total_length: Some(len),
            body,
        })
    }
}

/// Transform that copies the payload and replays a fixed progress script
pub struct ScriptedTransform {
    metadata: AudioMetadata,
    speed: f64,
    samples: u32,
    fail: bool,
    report_cancelled: bool,
    chapters: ChapterInfo,
    transform_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
    embedded: Mutex<Vec<Vec<u8>>>,
    requested_chapters: Mutex<Vec<Option<ChapterInfo>>>,
}

impl ScriptedTransform {
    pub fn new(metadata: AudioMetadata) -> Self {
        Self {
            metadata,
            speed: 2.0,
            samples: 4,
            fail: false,
            report_cancelled: false,
            chapters: ChapterInfo::from_lengths([
                ("Opening Credits", Duration::from_secs(30)),
                ("Chapter 1", Duration::from_secs(3600)),
                ("Chapter 2", Duration::from_secs(3570)),
            ]),
            transform_calls: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
            embedded: Mutex::new(Vec::new()),
            requested_chapters: Mutex::new(Vec::new()),
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn reporting_cancelled(mut self) -> Self {
        self.report_cancelled = true;
        self
    }

    pub fn transform_calls(&self) -> usize {
        self.transform_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn embedded(&self) -> Vec<Vec<u8>> {
        self.embedded.lock().unwrap().clone()
    }

    pub fn requested_chapters(&self) -> Vec<Option<ChapterInfo>> {
        self.requested_chapters.lock().unwrap().clone()
    }

    pub fn reported_chapters(&self) -> &ChapterInfo {
        &self.chapters
    }
}

#[async_trait]
impl AudioTransform for ScriptedTransform {
    async fn read_metadata(&self, source: &Path) -> Result<AudioMetadata, TransformError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let len = tokio::fs::metadata(source).await?.len();
        if len == 0 {
            return Err(TransformError::InvalidSource("empty header".to_string()));
        }
        Ok(self.metadata.clone())
    }

    async fn transform(
        &self,
        request: TransformRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TransformOutcome, TransformError> {
        self.transform_calls.fetch_add(1, Ordering::SeqCst);
        self.requested_chapters
            .lock()
            .unwrap()
            .push(request.chapters.clone());

        if self.fail {
            return Err(TransformError::Failed("scripted failure".to_string()));
        }
        if self.report_cancelled || cancel.is_cancelled() {
            return Ok(TransformOutcome::Cancelled);
        }

        let mut output = request.output;
        let mut source = std::fs::File::open(&request.source)?;
        std::io::copy(&mut source, &mut output)?;

        for i in 0..=self.samples {
            let fraction = f64::from(i) / f64::from(self.samples);
            progress(ProgressSample::new(request.duration.mul_f64(fraction), self.speed));
        }

        let chapters = request.chapters.unwrap_or_else(|| self.chapters.clone());
        if request.key.is_some() {
            Ok(TransformOutcome::Decrypted { chapters })
        } else {
            Ok(TransformOutcome::Passthrough { chapters })
        }
    }

    async fn embed_cover_art(&self, _output: &Path, cover_art: &[u8]) -> Result<(), TransformError> {
        self.embedded.lock().unwrap().push(cover_art.to_vec());
        Ok(())
    }
}

pub fn sample_metadata() -> AudioMetadata {
    AudioMetadata {
        tags: AudioTags {
            title: Some("The Book".to_string()),
            author: Some("A. Writer".to_string()),
            narrator: Some("N. Reader".to_string()),
            ..AudioTags::default()
        },
        cover_art: Some(Bytes::from_static(b"\x89PNG embedded")),
        duration: Duration::from_secs(2 * 3600),
        chapters: None,
    }
}

pub fn encrypted_license(url: &str) -> DownloadLicense {
    DownloadLicense::new(url, "test-agent/1.0")
        .with_key(DecryptionKey::new("00112233445566778899aabbccddeeff", "ffeeddccbbaa99887766554433221100"))
}

/// Small flush interval so checkpoints happen within test payloads
pub fn test_stream_options() -> StreamOptions {
    StreamOptions {
        max_retries: 2,
        flush_interval: 16 * 1024,
    }
}

/// Converter writing `<dir>/books/The Book.m4b` with its cache in `<dir>/cache`
pub fn converter(
    dir: &Path,
    license: DownloadLicense,
    transport: Arc<MemoryTransport>,
    transform: Arc<ScriptedTransform>,
) -> DownloadConverter {
    let mut converter = DownloadConverter::new(
        dir.join("cache"),
        dir.join("books"),
        license,
        transport,
        transform,
    )
    .unwrap()
    .with_stream_options(test_stream_options());
    converter.set_output_filename("The Book");
    converter
}

/// Record every event a converter emits
pub fn record_events(converter: &DownloadConverter) -> Arc<Mutex<Vec<ConverterEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    converter.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    events
}
