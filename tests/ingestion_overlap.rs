//! Two uploads processed in order where the second overlaps the first: verifies the
//! controller accumulates a merged total across runs (dedup keys carried from storage)
//! rather than one upload's final save clobbering the last.

use reverie_core::config::ReverieConfig;
use reverie_core::event::NullEventHandler;
use reverie_core::ingestion::parser::NullMemorySampler;
use reverie_core::ingestion::{BasicPatternDetector, BasicPersonalityClassifier, IngestionController, UploadKind, UploadRequest};
use reverie_core::lock::OperationLock;
use reverie_core::model::BucketType;
use reverie_core::storage::memory::InMemoryStorage;
use serde_json::json;
use std::sync::Arc;

fn record(ts: &str, track: &str, artist: &str) -> serde_json::Value {
    json!({
        "ts": ts, "track": track, "artist": artist, "album": null,
        "ms_played": 180000, "track_duration_ms": 200000,
        "source_platform": null, "shuffle": false, "skipped": false,
        "offline": false, "start_reason": null, "end_reason": null
    })
}

fn build_controller(storage: Arc<InMemoryStorage>) -> IngestionController {
    IngestionController::new(
        Arc::new(OperationLock::with_default_conflicts()),
        storage,
        Arc::new(BasicPatternDetector),
        Arc::new(BasicPersonalityClassifier),
        Arc::new(NullMemorySampler),
        Arc::new(NullEventHandler),
        ReverieConfig::default(),
    )
}

#[tokio::test]
async fn second_overlapping_upload_merges_rather_than_replaces() {
    let storage = Arc::new(InMemoryStorage::default());
    let controller = build_controller(storage.clone());

    let first_batch = vec![
        record("2026-01-01T10:00:00Z", "T1", "A"),
        record("2026-01-02T10:00:00Z", "T2", "A"),
        record("2026-01-03T10:00:00Z", "T3", "B"),
        record("2026-01-04T10:00:00Z", "T4", "B"),
        record("2026-01-05T10:00:00Z", "T5", "C"),
    ];
    let outcome = controller
        .handle_file_upload(
            UploadRequest {
                kind: UploadKind::Json,
                bytes: serde_json::to_vec(&first_batch).unwrap(),
            },
            BucketType::Daily,
        )
        .await
        .unwrap();
    assert_eq!(outcome.streams.len(), 5);
    assert_eq!(storage.stream_count().await, 5);

    // Second upload: two exact duplicates of the first batch, three genuinely new
    // records overlapping the first batch's date range.
    let second_batch = vec![
        record("2026-01-01T10:00:00Z", "T1", "A"), // duplicate
        record("2026-01-02T10:00:00Z", "T2", "A"), // duplicate
        record("2026-01-06T10:00:00Z", "T6", "D"),
        record("2026-01-07T10:00:00Z", "T7", "D"),
        record("2026-01-08T10:00:00Z", "T8", "E"),
    ];
    let outcome = controller
        .handle_file_upload(
            UploadRequest {
                kind: UploadKind::Json,
                bytes: serde_json::to_vec(&second_batch).unwrap(),
            },
            BucketType::Daily,
        )
        .await
        .unwrap();

    // 5 from the first run + 3 genuinely new from the second; the 2 duplicates must
    // not be double-counted, and the first run's streams must not have been dropped.
    assert_eq!(outcome.streams.len(), 8);
    assert_eq!(storage.stream_count().await, 8);

    let no_chunk_double_counts: usize = outcome.chunks.iter().map(|c| c.stream_count).sum();
    assert_eq!(no_chunk_double_counts, 8);
}
