//! End-to-end tests for the put / place / evict pipeline.
//!
//! These drive the full store facade against a temp-dir sandbox: quota
//! eviction, pinning, hardlink replica expansion, corruption repair, and
//! crash recovery.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use hoard_store::layout::BlobLayout;
use hoard_store::{
    AccessMode, CancellationToken, ContentStore, EvictOptions, HashAlgorithm, ManualClock,
    PlaceCode, PlaceRealization, PutResult, RealizationMode, ReplacementMode, StoreConfig,
};

const KIB: u64 = 1024;

fn test_config(temp: &TempDir) -> StoreConfig {
    let mut config = StoreConfig::new(temp.path().join("store"));
    config.purge_interval_ms = 50;
    config.max_quota_wait_ms = 2_000;
    config
}

async fn open_store(config: StoreConfig) -> (ContentStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = ContentStore::open_with(
        config,
        Arc::new(hoard_store::NullAnnouncer),
        None,
        clock.clone(),
    )
    .await
    .unwrap();
    (store, clock)
}

fn write_source(temp: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = temp.path().join(name);
    fs::write(&path, bytes).unwrap();
    path
}

async fn put_copy(store: &ContentStore, source: &std::path::Path) -> PutResult {
    store
        .put_file(
            source,
            RealizationMode::Copy,
            HashAlgorithm::Sha256,
            None,
            None,
            &CancellationToken::none(),
        )
        .await
        .unwrap()
}

fn count_blob_files(root: &std::path::Path) -> usize {
    let layout = BlobLayout::new(root);
    layout.scan_blobs().unwrap().len()
}

#[tokio::test]
async fn happy_path_put_then_place() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.hard_cap_bytes = 1024 * 1024 * 1024;
    config.soft_cap_bytes = 1024 * 1024 * 1024;
    let root = config.root.clone();
    let (store, clock) = open_store(config).await;

    let body = vec![0x41u8; 4096];
    let source = write_source(&temp, "source", &body);

    let first = put_copy(&store, &source).await;
    assert_eq!(first.size, 4096);
    assert!(!first.already_existed);
    assert_eq!(store.current_bytes(), 4096);

    let destination = temp.path().join("out/placed");
    let placed = store
        .place_file(
            &first.hash,
            &destination,
            AccessMode::ReadOnly,
            ReplacementMode::ReplaceExisting,
            PlaceRealization::HardLink,
            None,
            &CancellationToken::none(),
        )
        .await
        .unwrap();

    assert_eq!(placed.code, PlaceCode::PlacedWithHardLink);
    assert_eq!(placed.size, 4096);
    assert_eq!(fs::read(&destination).unwrap(), body);

    clock.advance(10);
    let second = put_copy(&store, &source).await;
    assert_eq!(second.hash, first.hash);
    assert!(second.already_existed);
    assert_eq!(store.current_bytes(), 4096, "idempotent put charges nothing");

    assert_eq!(count_blob_files(&root), 1);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn hardlink_limit_expands_replicas() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.hard_link_limit = Some(3);
    let root = config.root.clone();
    let (store, _clock) = open_store(config).await;

    let source = write_source(&temp, "source", b"replicated content");
    let put = put_copy(&store, &source).await;

    for i in 0..4 {
        let destination = temp.path().join(format!("out/placed-{i}"));
        let placed = store
            .place_file(
                &put.hash,
                &destination,
                AccessMode::ReadOnly,
                ReplacementMode::ReplaceExisting,
                PlaceRealization::HardLink,
                None,
                &CancellationToken::none(),
            )
            .await
            .unwrap();
        assert_eq!(placed.code, PlaceCode::PlacedWithHardLink, "place {i}");
    }

    // Three links exhausted the primary's budget; exactly one extra
    // replica was minted for the rest.
    assert_eq!(count_blob_files(&root), 2);

    let info = store
        .enumerate_info()
        .await
        .into_iter()
        .find(|(hash, _)| *hash == put.hash)
        .unwrap()
        .1;
    assert_eq!(info.replica_count, 2);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn quota_evicts_oldest_first() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.hard_cap_bytes = 10 * KIB;
    config.soft_cap_bytes = 8 * KIB;
    let (store, clock) = open_store(config).await;

    let mut hashes = Vec::new();
    for label in ["a", "b", "c", "d"] {
        clock.advance(100);
        let source = write_source(&temp, label, &vec![label.as_bytes()[0]; 3 * KIB as usize]);
        let put = put_copy(&store, &source).await;
        hashes.push(put.hash);
    }

    assert!(store.current_bytes() <= 10 * KIB);
    assert!(store.contains(&hashes[2], None).await, "c must survive");
    assert!(store.contains(&hashes[3], None).await, "d must survive");
    assert!(
        !store.contains(&hashes[0], None).await,
        "a was oldest and goes first"
    );

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn pinned_content_survives_eviction() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.hard_cap_bytes = 10 * KIB;
    config.soft_cap_bytes = 8 * KIB;
    let (store, clock) = open_store(config).await;

    let context = store.create_pin_context();

    let source_a = write_source(&temp, "a", &vec![b'a'; 3 * KIB as usize]);
    let put_a = store
        .put_file(
            &source_a,
            RealizationMode::Copy,
            HashAlgorithm::Sha256,
            None,
            Some(&context),
            &CancellationToken::none(),
        )
        .await
        .unwrap();
    assert!(store.is_pinned(&put_a.hash));

    for label in ["b", "c", "d"] {
        clock.advance(100);
        let source = write_source(&temp, label, &vec![label.as_bytes()[0]; 3 * KIB as usize]);
        put_copy(&store, &source).await;
    }

    assert!(
        store.contains(&put_a.hash, None).await,
        "pinned content must not be evicted"
    );
    assert!(store.current_bytes() <= 10 * KIB);

    // Release the pin; a forced purge may now reclaim it.
    store.dispose_pin_context(context).await;
    clock.advance(1);
    store.sync(true).await.unwrap();

    assert!(store.current_bytes() <= 8 * KIB);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn corrupt_blob_detected_and_destroyed() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let root = config.root.clone();
    let (store, _clock) = open_store(config).await;

    let source = write_source(&temp, "source", &[0, 1, 2, 3]);
    let put = put_copy(&store, &source).await;

    // Corrupt the blob behind the store's back.
    let layout = BlobLayout::new(&root);
    let primary = layout.primary(&put.hash);
    let mut perms = fs::metadata(&primary).unwrap().permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(&primary, perms).unwrap();
    fs::write(&primary, [9, 9, 9, 9]).unwrap();

    let destination = temp.path().join("out/placed");
    let placed = store
        .place_file(
            &put.hash,
            &destination,
            AccessMode::ReadOnly,
            ReplacementMode::ReplaceExisting,
            PlaceRealization::CopyWithVerify,
            None,
            &CancellationToken::none(),
        )
        .await
        .unwrap();

    assert_eq!(placed.code, PlaceCode::NotPlacedContentNotFound);
    assert!(!store.contains(&put.hash, None).await);
    assert!(!primary.exists(), "corrupt blob must be gone");
    assert!(!destination.exists(), "partial placement must be cleaned up");

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconstruct_after_crash() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);

    let mut expected = Vec::new();
    {
        let (store, _clock) = open_store(config.clone()).await;
        for (label, size) in [("a", 10usize), ("b", 20), ("c", 30)] {
            let source = write_source(&temp, label, &vec![label.as_bytes()[0]; size]);
            let put = put_copy(&store, &source).await;
            expected.push((put.hash, size as u64));
        }
        // Dropped without shutdown: no snapshot persisted.
    }

    let (store, _clock) = open_store(config).await;
    let info = store.enumerate_info().await;
    assert_eq!(info.len(), 3);

    for (hash, size) in expected {
        let entry = info.iter().find(|(h, _)| *h == hash).unwrap().1;
        assert_eq!(entry.file_size, size);
        assert_eq!(entry.replica_count, 1);
    }

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn snapshot_roundtrip_through_shutdown() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);

    let hash = {
        let (store, _clock) = open_store(config.clone()).await;
        let source = write_source(&temp, "a", b"persisted body");
        let put = put_copy(&store, &source).await;
        store.shutdown().await.unwrap();
        put.hash
    };

    let (store, _clock) = open_store(config).await;
    assert!(store.contains(&hash, None).await);
    assert_eq!(store.current_bytes(), 14);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn evict_and_delete_remove_all_replicas() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let root = config.root.clone();
    let (store, _clock) = open_store(config).await;

    let source = write_source(&temp, "a", b"to be deleted");
    let put = put_copy(&store, &source).await;

    let outcome = store.delete(&put.hash).await.unwrap();
    assert!(outcome.evicted);
    assert_eq!(outcome.evicted_files, 1);
    assert_eq!(outcome.evicted_size, 13);

    assert!(!store.contains(&put.hash, None).await);
    assert_eq!(count_blob_files(&root), 0);
    assert_eq!(store.current_bytes(), 0);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn pinned_eviction_reports_pinned_size() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let (store, _clock) = open_store(config).await;

    let context = store.create_pin_context();
    let source = write_source(&temp, "a", b"pinned");
    let put = store
        .put_file(
            &source,
            RealizationMode::Copy,
            HashAlgorithm::Sha256,
            None,
            Some(&context),
            &CancellationToken::none(),
        )
        .await
        .unwrap();

    let outcome = store.evict(&put.hash, EvictOptions::default()).await.unwrap();
    assert!(!outcome.evicted);
    assert_eq!(outcome.pinned_size, 6);
    assert!(store.contains(&put.hash, None).await);

    // Force overrides the pin.
    let outcome = store
        .evict(
            &put.hash,
            EvictOptions {
                force: true,
                only_unlinked: false,
            },
        )
        .await
        .unwrap();
    assert!(outcome.evicted);

    store.dispose_pin_context(context).await;
    store.shutdown().await.unwrap();
}

#[rstest::rstest]
#[case::copy(RealizationMode::Copy)]
#[case::copy_no_verify(RealizationMode::CopyNoVerify)]
#[case::hardlink(RealizationMode::HardLink)]
#[case::any(RealizationMode::Any)]
#[case::move_in(RealizationMode::Move)]
#[tokio::test]
async fn every_realization_mode_round_trips(#[case] mode: RealizationMode) {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let (store, _clock) = open_store(config).await;

    let body = b"realized one way or another";
    let source = write_source(&temp, "source", body);

    let put = store
        .put_file(
            &source,
            mode,
            HashAlgorithm::Sha256,
            None,
            None,
            &CancellationToken::none(),
        )
        .await
        .unwrap();
    assert!(!put.already_existed);
    assert_eq!(put.size, body.len() as u64);

    if mode == RealizationMode::Move {
        assert!(!source.exists(), "move consumes the source");
    }

    let destination = temp.path().join("out/back");
    let placed = store
        .place_file(
            &put.hash,
            &destination,
            AccessMode::ReadOnly,
            ReplacementMode::ReplaceExisting,
            PlaceRealization::Copy,
            None,
            &CancellationToken::none(),
        )
        .await
        .unwrap();
    assert_eq!(placed.code, PlaceCode::PlacedWithCopy);
    assert_eq!(fs::read(&destination).unwrap(), body);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn put_with_wrong_expected_hash_rolls_back() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let root = config.root.clone();
    let (store, _clock) = open_store(config).await;

    let source = write_source(&temp, "source", b"actual bytes");
    let wrong = hoard_hash::ContentHash::new(HashAlgorithm::Sha256, [0xde; 32]);

    let result = store
        .put_file(
            &source,
            RealizationMode::Copy,
            HashAlgorithm::Sha256,
            Some(wrong),
            None,
            &CancellationToken::none(),
        )
        .await;

    assert!(matches!(
        result,
        Err(hoard_store::StoreError::HashMismatch { .. })
    ));
    assert_eq!(store.current_bytes(), 0);
    assert_eq!(count_blob_files(&root), 0);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn pinned_fast_path_skips_reingest() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.pinned_fast_path = true;
    let (store, _clock) = open_store(config).await;

    let context = store.create_pin_context();
    let source = write_source(&temp, "a", b"fast path body");
    let put = store
        .put_file(
            &source,
            RealizationMode::Copy,
            HashAlgorithm::Sha256,
            None,
            Some(&context),
            &CancellationToken::none(),
        )
        .await
        .unwrap();

    // Re-put with a known hash through the pinning context: served from
    // the directory without re-reading the source.
    let again = store
        .put_file(
            &source,
            RealizationMode::Copy,
            HashAlgorithm::Sha256,
            Some(put.hash),
            Some(&context),
            &CancellationToken::none(),
        )
        .await
        .unwrap();
    assert!(again.already_existed);
    assert_eq!(again.hash, put.hash);
    assert_eq!(store.current_bytes(), put.size);

    // Without the pin context the fast path does not apply, but the
    // outcome is identical.
    let slow = store
        .put_file(
            &source,
            RealizationMode::Copy,
            HashAlgorithm::Sha256,
            Some(put.hash),
            None,
            &CancellationToken::none(),
        )
        .await
        .unwrap();
    assert!(slow.already_existed);

    store.dispose_pin_context(context).await;
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_content_needs_no_disk() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let root = config.root.clone();
    let (store, _clock) = open_store(config).await;

    let source = write_source(&temp, "empty", b"");
    let put = put_copy(&store, &source).await;

    assert_eq!(put.size, 0);
    assert!(put.already_existed);
    assert!(put.hash.is_empty_content());
    assert_eq!(count_blob_files(&root), 0, "empty content is never persisted");
    assert_eq!(store.current_bytes(), 0);

    assert!(store.contains(&put.hash, None).await);

    let destination = temp.path().join("out/empty");
    let placed = store
        .place_file(
            &put.hash,
            &destination,
            AccessMode::ReadOnly,
            ReplacementMode::ReplaceExisting,
            PlaceRealization::Copy,
            None,
            &CancellationToken::none(),
        )
        .await
        .unwrap();
    assert_eq!(placed.code, PlaceCode::PlacedWithCopy);
    assert_eq!(fs::metadata(&destination).unwrap().len(), 0);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn put_stream_matches_put_file() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let (store, _clock) = open_store(config).await;

    let body = b"streamed into the store".to_vec();
    let streamed = store
        .put_stream(
            &body[..],
            HashAlgorithm::Sha256,
            None,
            &CancellationToken::none(),
        )
        .await
        .unwrap();
    assert!(!streamed.already_existed);
    assert_eq!(streamed.size, body.len() as u64);

    let source = write_source(&temp, "same", &body);
    let filed = put_copy(&store, &source).await;
    assert_eq!(filed.hash, streamed.hash);
    assert!(filed.already_existed);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn put_trusted_validates_size() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let (store, _clock) = open_store(config).await;

    let body = b"trusted bytes";
    let source = write_source(&temp, "a", body);
    let (hash, size) = hoard_hash::hash_file(HashAlgorithm::Sha256, &source).unwrap();

    let wrong = store
        .put_trusted_file(
            &source,
            hash,
            size + 1,
            RealizationMode::Copy,
            None,
            &CancellationToken::none(),
        )
        .await;
    assert!(matches!(
        wrong,
        Err(hoard_store::StoreError::SizeMismatch { .. })
    ));

    let put = store
        .put_trusted_file(
            &source,
            hash,
            size,
            RealizationMode::Copy,
            None,
            &CancellationToken::none(),
        )
        .await
        .unwrap();
    assert_eq!(put.hash, hash);
    assert!(store.contains(&hash, None).await);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn open_stream_reads_back_content() {
    use tokio::io::AsyncReadExt;

    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let (store, _clock) = open_store(config).await;

    let body = b"read me back";
    let source = write_source(&temp, "a", body);
    let put = put_copy(&store, &source).await;

    let mut stream = store.open_stream(&put.hash, None).await.unwrap().unwrap();
    let mut read = Vec::new();
    stream.read_to_end(&mut read).await.unwrap();
    assert_eq!(read, body);

    let absent = hoard_hash::ContentHash::new(HashAlgorithm::Sha256, [0x5a; 32]);
    assert!(store.open_stream(&absent, None).await.unwrap().is_none());

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn self_check_repairs_both_directions() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let root = config.root.clone();
    let (store, _clock) = open_store(config).await;

    let source_a = write_source(&temp, "a", b"will be corrupted");
    let put_a = put_copy(&store, &source_a).await;
    let source_b = write_source(&temp, "b", b"will be deleted externally");
    let put_b = put_copy(&store, &source_b).await;

    let layout = BlobLayout::new(&root);

    // Corrupt a's blob and remove b's entirely.
    let primary_a = layout.primary(&put_a.hash);
    let mut perms = fs::metadata(&primary_a).unwrap().permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(&primary_a, perms).unwrap();
    fs::write(&primary_a, b"tampered").unwrap();
    fs::remove_file(layout.primary(&put_b.hash)).unwrap();

    let report = store.self_check().await.unwrap();
    assert_eq!(report.scanned, 1, "only a's blob file is left to scan");
    assert_eq!(report.quarantined, 1, "corrupt blob quarantined");
    assert_eq!(report.removed_entries, 2, "both entries lost their disk backing");

    assert!(!store.contains(&put_a.hash, None).await);
    assert!(!store.contains(&put_b.hash, None).await);
    assert_eq!(store.current_bytes(), 0);

    store.shutdown().await.unwrap();
}
