//! Tests covering the whole machinery through the public API

use bytes::Bytes;

use crate::{
    config::Config,
    errors::TransferErrorKind,
    integrity,
    object_client::{InMemoryObjectClient, PartSizeHints},
    test_utils::{pattern_bytes, FlakyObjectClient},
    Partlift, UploadRequest,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn small_part_client() -> InMemoryObjectClient {
    InMemoryObjectClient::new().with_part_size_hints(PartSizeHints {
        min_part_size: 16,
        recommended_part_size: 64,
    })
}

fn config() -> Config {
    Config::default().backoff_floor_secs(0u64)
}

#[tokio::test]
async fn a_multipart_upload_roundtrips_through_a_download() {
    init_tracing();
    let client = small_part_client();
    let partlift = Partlift::new(client.clone(), config()).unwrap();

    let payload = pattern_bytes(1_000);
    let uploaded = partlift
        .upload(UploadRequest::from_bytes("blob", payload.clone()))
        .await
        .unwrap();

    assert!(uploaded.part_count > 1);
    assert_eq!(uploaded.bytes_transferred, 1_000);
    assert_eq!(uploaded.content_hash, integrity::hash_bytes(&payload));
    assert_eq!(
        client.object_bytes(&uploaded.remote_id),
        Some(Bytes::from(payload.clone()))
    );

    let mut sink = Vec::new();
    let downloaded = partlift
        .download(uploaded.remote_id, &mut sink)
        .await
        .unwrap();

    assert_eq!(sink, payload);
    assert_eq!(downloaded.bytes_written, 1_000);
    assert_eq!(downloaded.content_hash, uploaded.content_hash);
}

#[tokio::test]
async fn a_small_upload_skips_the_large_object_protocol() {
    let client = small_part_client();
    let partlift = Partlift::new(client.clone(), config()).unwrap();

    // Below twice the recommended part size
    let payload = pattern_bytes(100);
    let uploaded = partlift
        .upload(UploadRequest::from_bytes("small", payload.clone()))
        .await
        .unwrap();

    assert_eq!(uploaded.part_count, 1);
    assert_eq!(
        client.object_bytes(&uploaded.remote_id),
        Some(Bytes::from(payload))
    );
}

#[tokio::test]
async fn a_precomputed_hash_is_used_as_is() {
    let client = small_part_client();
    let partlift = Partlift::new(client, config()).unwrap();

    let payload = pattern_bytes(500);
    let hash = integrity::hash_bytes(&payload);
    let uploaded = partlift
        .upload(UploadRequest::from_bytes("blob", payload).content_hash(hash.clone()))
        .await
        .unwrap();

    assert_eq!(uploaded.content_hash, hash);
}

#[tokio::test]
async fn transient_upload_failures_are_invisible_to_the_caller() {
    let client = FlakyObjectClient::new(InMemoryObjectClient::new(), 64)
        .fail_upload_once([1, 3, 7, 12]);
    let partlift = Partlift::new(client, config()).unwrap();

    let payload = pattern_bytes(1_000);
    let uploaded = partlift
        .upload(UploadRequest::from_bytes("blob", payload.clone()))
        .await
        .unwrap();

    assert_eq!(uploaded.content_hash, integrity::hash_bytes(&payload));

    let mut sink = Vec::new();
    partlift.download(uploaded.remote_id, &mut sink).await.unwrap();
    assert_eq!(sink, payload);
}

#[tokio::test]
async fn transient_download_failures_are_invisible_to_the_caller() {
    let client = FlakyObjectClient::new(InMemoryObjectClient::new(), 64)
        .fail_download_once([2, 5, 11]);
    let partlift = Partlift::new(client.clone(), config()).unwrap();

    let payload = pattern_bytes(1_000);
    let uploaded = partlift
        .upload(UploadRequest::from_bytes("blob", payload.clone()))
        .await
        .unwrap();

    let mut sink = Vec::new();
    let downloaded = partlift
        .download(uploaded.remote_id, &mut sink)
        .await
        .unwrap();

    assert_eq!(sink, payload);
    assert_eq!(downloaded.part_count, 16);
}

#[tokio::test]
async fn a_fatal_part_failure_fails_the_whole_upload() {
    let store = InMemoryObjectClient::new();
    let client = FlakyObjectClient::new(store.clone(), 64).fatal_upload_at(3);
    let partlift = Partlift::new(client, config()).unwrap();

    let err = partlift
        .upload(UploadRequest::from_bytes("blob", pattern_bytes(1_000)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransferErrorKind::Fatal);
}

#[tokio::test(start_paused = true)]
async fn a_stalled_finish_call_hits_the_transfer_deadline() {
    let client = FlakyObjectClient::new(InMemoryObjectClient::new(), 64).stall_finish();
    let partlift = Partlift::new(client, config().transfer_timeout_secs(5u64)).unwrap();

    // Multipart so the upload has to call finish after the parts are in
    let err = partlift
        .upload(UploadRequest::from_bytes("blob", pattern_bytes(1_000)))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("deadline"), "{err}");
}

#[tokio::test]
async fn a_corrupted_download_is_reported_as_integrity_error() {
    let client = FlakyObjectClient::new(InMemoryObjectClient::new(), 64).corrupt_download([4]);
    let partlift = Partlift::new(client, config()).unwrap();

    let payload = pattern_bytes(1_000);
    let uploaded = partlift
        .upload(UploadRequest::from_bytes("blob", payload))
        .await
        .unwrap();

    let mut sink = Vec::new();
    let err = partlift
        .download(uploaded.remote_id, &mut sink)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransferErrorKind::Integrity);
}

#[tokio::test]
async fn expired_tokens_trigger_reauthorization_and_the_upload_succeeds() {
    let client = FlakyObjectClient::new(InMemoryObjectClient::new(), 64).reject_tokens(2);
    let partlift = Partlift::new(client.clone(), config()).unwrap();

    let payload = pattern_bytes(1_000);
    let uploaded = partlift
        .upload(UploadRequest::from_bytes("blob", payload.clone()))
        .await
        .unwrap();

    // Both rejections might hit the same worker in which case the
    // second one is absorbed by its retry loop
    assert!(client.reauth_count() >= 1);
    assert_eq!(uploaded.content_hash, integrity::hash_bytes(&payload));
}

#[tokio::test]
async fn uploading_a_file_and_downloading_it_back_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.bin");
    let target_path = dir.path().join("target.bin");

    let payload = pattern_bytes(5_000);
    tokio::fs::write(&source_path, &payload).await.unwrap();

    let partlift = Partlift::new(small_part_client(), config()).unwrap();

    let uploaded = partlift
        .upload(UploadRequest::from_file("source.bin", &source_path))
        .await
        .unwrap();
    assert!(uploaded.part_count > 1);

    let downloaded = partlift
        .download_to_file(uploaded.remote_id, &target_path)
        .await
        .unwrap();

    assert_eq!(downloaded.bytes_written, 5_000);
    assert_eq!(tokio::fs::read(&target_path).await.unwrap(), payload);
}

#[tokio::test]
async fn uploading_an_empty_source_is_rejected() {
    let partlift = Partlift::new(small_part_client(), config()).unwrap();

    let err = partlift
        .upload(UploadRequest::from_bytes("empty", Bytes::new()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransferErrorKind::InvalidPlan);
}

#[tokio::test]
async fn downloading_an_unknown_object_fails_with_not_found() {
    let partlift = Partlift::new(small_part_client(), config()).unwrap();

    let mut sink = Vec::new();
    let err = partlift.download("no-such-id", &mut sink).await.unwrap_err();

    assert_eq!(err.kind(), TransferErrorKind::NotFound);
}
