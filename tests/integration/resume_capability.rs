//! Integration tests for resuming interrupted downloads through the pipeline

use crate::support::{
    converter, encrypted_license, sample_metadata, sample_payload, test_stream_options,
    MemoryTransport, ScriptedTransform, PAYLOAD_LEN, URL_V1, URL_V2,
};
use audiobook_downloader::cancel::CancellationToken;
use audiobook_downloader::downloader::config::HEADER_PROBE_BYTES;
use audiobook_downloader::resume::{DownloadPersister, PersistedDownloadState};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

const CUT: u64 = 150 * 1024;

#[tokio::test]
async fn test_interrupted_download_resumes_from_recorded_offset_after_url_rotation() {
    let dir = TempDir::new().unwrap();
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));

    // First attempt dies mid-download
    let failing = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)).cut_at(CUT));
    let first = converter(dir.path(), encrypted_license(URL_V1), failing.clone(), transform.clone());
    assert!(!first.run().await);

    let state = PersistedDownloadState::load(&first.state_path()).unwrap();
    assert_eq!(state.bytes_downloaded(), CUT);
    assert_eq!(state.uri(), URL_V1);
    assert_eq!(
        std::fs::metadata(first.temp_path()).unwrap().len(),
        CUT,
        "payload holds exactly the confirmed bytes"
    );

    // Second attempt with a reissued URL picks up where the first stopped
    let healthy = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)));
    let second = converter(dir.path(), encrypted_license(URL_V2), healthy.clone(), transform.clone());
    assert!(second.run().await);

    assert_eq!(healthy.offsets(), vec![CUT]);
    assert_eq!(std::fs::read(second.output_path()).unwrap(), healthy.data());
    assert!(!second.state_path().exists());
    assert!(!second.temp_path().exists());
}

#[tokio::test]
async fn test_state_ahead_of_payload_restarts_from_zero() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)));
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));
    let pipeline = converter(dir.path(), encrypted_license(URL_V1), transport.clone(), transform);

    std::fs::create_dir_all(dir.path().join("cache")).unwrap();
    let state = PersistedDownloadState::new(URL_V1, BTreeMap::new(), pipeline.temp_path());
    state.save(&pipeline.state_path()).unwrap();
    std::fs::write(pipeline.temp_path(), vec![0xAB; 10]).unwrap();
    // Record progress the payload cannot back up
    let mut json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(pipeline.state_path()).unwrap()).unwrap();
    json["bytes_downloaded"] = serde_json::json!(5000);
    std::fs::write(pipeline.state_path(), serde_json::to_string(&json).unwrap()).unwrap();
    assert!(matches!(
        PersistedDownloadState::load(&pipeline.state_path())
            .unwrap()
            .verify_payload(),
        Err(_)
    ));

    assert!(pipeline.run().await);

    let offsets = transport.offsets();
    assert_eq!(offsets[0], 0);
    assert_eq!(offsets.len(), 2);
    assert_eq!(std::fs::read(pipeline.output_path()).unwrap(), transport.data());
}

#[tokio::test]
async fn test_unreadable_state_restarts_from_zero() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)));
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));
    let pipeline = converter(dir.path(), encrypted_license(URL_V1), transport.clone(), transform);

    std::fs::create_dir_all(dir.path().join("cache")).unwrap();
    std::fs::write(pipeline.state_path(), b"{\"schema_version\": ").unwrap();
    std::fs::write(pipeline.temp_path(), vec![0xCD; 4096]).unwrap();

    assert!(pipeline.run().await);
    assert_eq!(transport.offsets()[0], 0);
    assert_eq!(std::fs::read(pipeline.output_path()).unwrap(), transport.data());
}

#[tokio::test]
async fn test_changed_remote_length_restarts_download_from_zero() {
    let dir = TempDir::new().unwrap();
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));

    let failing = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)).cut_at(CUT));
    let first = converter(dir.path(), encrypted_license(URL_V1), failing, transform.clone());
    assert!(!first.run().await);

    // Same URL path, different content length
    let changed = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN + 1)));
    let second = converter(dir.path(), encrypted_license(URL_V2), changed.clone(), transform.clone());
    assert!(second.run().await);

    assert_eq!(&changed.offsets()[..2], &[CUT, 0]);
    assert_eq!(std::fs::read(second.output_path()).unwrap(), changed.data());
    assert!(!second.state_path().exists());
    assert!(!second.temp_path().exists());
}

#[tokio::test]
async fn test_server_ignoring_range_restarts_payload() {
    let dir = TempDir::new().unwrap();
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));

    let failing = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)).cut_at(CUT));
    let first = converter(dir.path(), encrypted_license(URL_V1), failing, transform.clone());
    assert!(!first.run().await);

    let no_ranges = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)).ignoring_range());
    let second = converter(dir.path(), encrypted_license(URL_V2), no_ranges.clone(), transform);
    assert!(second.run().await);

    assert_eq!(no_ranges.offsets(), vec![CUT]);
    assert_eq!(std::fs::read(second.output_path()).unwrap(), no_ranges.data());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)).failing_first(1));
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));
    let pipeline = converter(dir.path(), encrypted_license(URL_V1), transport.clone(), transform);

    assert!(pipeline.run().await);
    let offsets = transport.offsets();
    assert_eq!(&offsets[..2], &[0, 0]);
    assert_eq!(std::fs::read(pipeline.output_path()).unwrap(), transport.data());
}

#[tokio::test(start_paused = true)]
async fn test_flaky_connection_completes_despite_more_resets_than_retries() {
    let dir = TempDir::new().unwrap();
    let reset_every = 16 * 1024;
    let transport = Arc::new(
        MemoryTransport::new(sample_payload(PAYLOAD_LEN)).resetting_every(reset_every),
    );
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));
    let pipeline = converter(dir.path(), encrypted_license(URL_V1), transport.clone(), transform);

    assert!(pipeline.run().await);

    let offsets = transport.offsets();
    assert!(offsets.len() > test_stream_options().max_retries as usize + 1);
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(std::fs::read(pipeline.output_path()).unwrap(), transport.data());
}

#[tokio::test]
async fn test_requests_carry_license_user_agent() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)));
    let transform = Arc::new(ScriptedTransform::new(sample_metadata()));
    let pipeline = converter(dir.path(), encrypted_license(URL_V1), transport.clone(), transform);

    assert!(pipeline.run().await);
    let agents = transport.user_agents();
    assert!(!agents.is_empty());
    assert!(agents.iter().all(|ua| ua == "test-agent/1.0"));
}

#[tokio::test]
async fn test_persister_header_window_then_rest() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new(sample_payload(PAYLOAD_LEN)));
    let cancel = CancellationToken::new();

    let mut persister = DownloadPersister::open(
        dir.path().join("book.json"),
        dir.path().join("book.aaxc"),
        URL_V1,
        BTreeMap::new(),
        transport.clone(),
        test_stream_options(),
    )
    .unwrap();

    persister
        .download_to(Some(HEADER_PROBE_BYTES), &cancel)
        .await
        .unwrap();
    let header_end = persister.state().bytes_downloaded();
    assert!(header_end >= HEADER_PROBE_BYTES);
    assert!(!persister.is_complete());

    persister.download_to(None, &cancel).await.unwrap();
    assert!(persister.is_complete());
    assert_eq!(
        persister.state().content_length(),
        Some(PAYLOAD_LEN as u64)
    );
    assert_eq!(transport.offsets(), vec![0, header_end]);
}
