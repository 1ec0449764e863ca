use ::common::prelude::*;
use ::common::testkit::MemoryStore;
use ::common::upload::{chunk_bytes, CHUNK_SIZE, EMPTY_FINGERPRINT};

/// Deterministic bytes with no short period, so every chunk differs
fn content(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect()
}

async fn upload_all(client: &RemoteClient, path: &str, data: &[u8]) -> Result<UploadReport> {
    upload(client, path, data, data.len() as u64).await
}

#[tokio::test]
async fn test_second_upload_of_same_content_sends_nothing() {
    let store = MemoryStore::new();
    let client = store.client();
    let data = content(CHUNK_SIZE * 2 + 100, 7);

    let distinct = chunk_bytes(&data);
    assert_ne!(distinct[0].fingerprint, distinct[1].fingerprint);

    let first = upload_all(&client, "/one.bin", &data).await.unwrap();
    assert_eq!(first.chunks, 3);
    assert_eq!(first.sent_chunks, 3);

    store.reset_stats();
    let second = upload_all(&client, "/two.bin", &data).await.unwrap();
    assert_eq!(second.sent_chunks, 0);
    assert_eq!(second.sent_bytes, 0);

    let stats = store.stats();
    assert_eq!(stats.send_parts_calls, 0);
    assert_eq!(stats.update_calls, 1);
    assert_eq!(store.file_content("/two.bin").unwrap().as_ref(), &data[..]);
}

#[tokio::test]
async fn test_changed_chunk_is_the_only_one_sent() {
    let store = MemoryStore::new();
    let client = store.client();
    let mut data = content(CHUNK_SIZE * 3, 1);
    upload_all(&client, "/f.bin", &data).await.unwrap();

    data[CHUNK_SIZE + 10] ^= 0xff;
    store.reset_stats();
    let report = upload_all(&client, "/f.bin", &data).await.unwrap();

    assert_eq!(report.sent_chunks, 1);
    assert_eq!(report.sent_bytes, CHUNK_SIZE as u64);
    assert_eq!(store.stats().bytes_received, CHUNK_SIZE as u64);
    assert_eq!(store.file_content("/f.bin").unwrap().as_ref(), &data[..]);
}

#[tokio::test]
async fn test_repeated_chunk_travels_once() {
    let store = MemoryStore::new();
    let client = store.client();
    let block = content(CHUNK_SIZE, 3);
    let data = [block.clone(), block].concat();

    let report = upload_all(&client, "/twice.bin", &data).await.unwrap();

    assert_eq!(report.chunks, 2);
    assert_eq!(report.sent_chunks, 1);
    assert_eq!(store.stats().parts_received, 1);
    let manifest = store.manifest("/twice.bin").unwrap();
    assert_eq!(manifest[0].fingerprint, manifest[1].fingerprint);
    assert_eq!(manifest[1].offset, CHUNK_SIZE as u64);
}

#[tokio::test]
async fn test_empty_file_commits_sentinel_manifest() {
    let store = MemoryStore::new();
    let client = store.client();

    let report = upload(&client, "/empty", std::io::empty(), 0).await.unwrap();

    assert_eq!(report.size, 0);
    assert_eq!(report.manifest.len(), 1);
    assert_eq!(report.manifest[0].fingerprint, EMPTY_FINGERPRINT);
    assert_eq!(store.stats().send_parts_calls, 0);
    assert!(store.file_content("/empty").unwrap().is_empty());
}

#[tokio::test]
async fn test_manifest_matches_chunking() {
    let store = MemoryStore::new();
    let client = store.client();
    let data = content(CHUNK_SIZE + 1, 9);

    let report = upload_all(&client, "/m.bin", &data).await.unwrap();
    let expected: Vec<_> = chunk_bytes(&data)
        .iter()
        .map(Chunk::manifest_entry)
        .collect();
    assert_eq!(report.manifest, expected);
}

#[tokio::test]
async fn test_failed_commit_leaves_remote_untouched() {
    let store = MemoryStore::new().with_file("/keep.txt", b"old");
    let client = store.client();
    store.set_fail_uploads(true);

    let err = upload_all(&client, "/keep.txt", b"new content")
        .await
        .unwrap_err();

    assert!(matches!(err, RemoteError::RemoteUnavailable(_)));
    assert_eq!(store.file_content("/keep.txt").unwrap().as_ref(), b"old");
}

#[tokio::test]
async fn test_short_reader_fails_before_sending() {
    let store = MemoryStore::new().with_file("/keep.txt", b"old");
    let client = store.client();

    let err = upload(&client, "/keep.txt", &b"four"[..], 10)
        .await
        .unwrap_err();

    assert!(matches!(err, RemoteError::ProtocolInvariant(_)));
    let stats = store.stats();
    assert_eq!(stats.has_parts_calls, 0);
    assert_eq!(stats.update_calls, 0);
    assert_eq!(store.file_content("/keep.txt").unwrap().as_ref(), b"old");
}
