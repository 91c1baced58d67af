//! Integration tests for cooperative cancellation

use crate::support::{
    converter, encrypted_license, record_events, sample_metadata, sample_payload, MemoryTransport,
    ScriptedTransform, PAYLOAD_LEN, URL_V1, URL_V2,
};
use audiobook_downloader::converter::{ConverterEvent, EventKind};
use audiobook_downloader::downloader::config::HEADER_PROBE_BYTES;
use audiobook_downloader::resume::PersistedDownloadState;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const STALL: u64 = 120 * 1024;

#[tokio::test]
async fn test_cancel_from_tags_listener_stops_before_download() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)));
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));
    let pipeline = converter(dir.path(), encrypted_license(URL_V1), transport.clone(), transform.clone());
    let events = record_events(&pipeline);

    let token = pipeline.cancellation_token();
    pipeline
        .events()
        .subscribe_to(EventKind::TagsRetrieved, move |_| token.cancel());

    assert!(!pipeline.run().await);

    assert_eq!(transform.transform_calls(), 0);
    assert_eq!(transport.offsets(), vec![0]);
    assert!(!pipeline.output_path().exists());

    let state = PersistedDownloadState::load(&pipeline.state_path()).unwrap();
    assert!(state.bytes_downloaded() >= HEADER_PROBE_BYTES);
    assert!(!state.is_complete());

    let events = events.lock().unwrap();
    assert!(!events
        .iter()
        .any(|e| matches!(e, ConverterEvent::DecryptProgress(_))));
}

#[tokio::test]
async fn test_cancel_mid_download_saves_progress_for_next_run() {
    let dir = TempDir::new().unwrap();
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));

    let stalling = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)).stall_at(STALL));
    let first = converter(dir.path(), encrypted_license(URL_V1), stalling, transform.clone());
    let token = first.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    assert!(!first.run().await);
    assert_eq!(transform.transform_calls(), 0);

    let state = PersistedDownloadState::load(&first.state_path()).unwrap();
    assert_eq!(state.bytes_downloaded(), STALL);
    assert_eq!(std::fs::metadata(first.temp_path()).unwrap().len(), STALL);

    let healthy = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)));
    let second = converter(dir.path(), encrypted_license(URL_V2), healthy.clone(), transform.clone());
    assert!(second.run().await);

    assert_eq!(healthy.offsets(), vec![STALL]);
    assert_eq!(std::fs::read(second.output_path()).unwrap(), healthy.data());
}

#[tokio::test]
async fn test_cancel_through_converter_handle() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)).stall_at(STALL));
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));
    let pipeline = Arc::new(converter(dir.path(), encrypted_license(URL_V1), transport, transform));

    let runner = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.cancel();

    let success = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("cancelled run finishes promptly")
        .unwrap();
    assert!(!success);
    assert!(pipeline.state_path().exists());
    assert_eq!(pipeline.speedup(), None);
}
