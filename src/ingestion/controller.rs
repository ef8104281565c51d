//! Orchestrates the parser, storage appends, pattern detection, personality
//! classification, and progress events, per SPEC_FULL §4.5.

use crate::config::ReverieConfig;
use crate::errors::{ReverieError, Result};
use crate::event::{EventHandler, IngestionEvent};
use crate::ingestion::parser::{
    ControllerToParser, MemorySampler, OverlapResolution, ParserInput, ParserToController, StreamParser,
    ARCHIVE_MAGIC,
};
use crate::ingestion::pattern::PatternDetector;
use crate::ingestion::personality::PersonalityClassifier;
use crate::lock::{AcquireOptions, OperationLock};
use crate::model::{BucketType, Chunk, Personality, Stream};
use crate::storage::Storage;
use crate::tab_coordinator::TabCoordinator;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Json,
    Archive,
}

pub struct UploadRequest {
    pub kind: UploadKind,
    pub bytes: Vec<u8>,
}

/// Validates the upload preconditions from §4.5 step 0: extension/type, archive
/// signature, and size cap. Returns the accepted [`ParserInput`] or a structured error.
pub fn validate_upload(request: &UploadRequest, config: &ReverieConfig) -> Result<ParserInput> {
    if request.bytes.len() as u64 > config.max_upload_bytes {
        return Err(ReverieError::validation(format!(
            "file too large: {} bytes exceeds the {} byte cap",
            request.bytes.len(),
            config.max_upload_bytes
        )));
    }
    match request.kind {
        UploadKind::Json => Ok(ParserInput::Json(request.bytes.clone())),
        UploadKind::Archive => {
            if request.bytes.len() < ARCHIVE_MAGIC.len() || &request.bytes[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
                return Err(ReverieError::validation("archive missing required magic bytes"));
            }
            Ok(ParserInput::Archive(request.bytes.clone()))
        }
    }
}

pub struct IngestionController {
    lock: Arc<OperationLock>,
    storage: Arc<dyn Storage>,
    pattern_detector: Arc<dyn PatternDetector>,
    personality_classifier: Arc<dyn PersonalityClassifier>,
    memory_sampler: Arc<dyn MemorySampler>,
    events: Arc<dyn EventHandler>,
    config: ReverieConfig,
    cancelled: Arc<AtomicBool>,
    /// `None` in a single-tab/test host; `Some` once cross-tab coordination is wired up.
    /// Per §5's shared-resource policy, only the primary tab may write.
    tab_coordinator: Option<Arc<TabCoordinator>>,
}

pub struct IngestionOutcome {
    pub streams: Vec<Stream>,
    pub chunks: Vec<Chunk>,
    pub personality: Personality,
}

impl IngestionController {
    pub fn new(
        lock: Arc<OperationLock>,
        storage: Arc<dyn Storage>,
        pattern_detector: Arc<dyn PatternDetector>,
        personality_classifier: Arc<dyn PersonalityClassifier>,
        memory_sampler: Arc<dyn MemorySampler>,
        events: Arc<dyn EventHandler>,
        config: ReverieConfig,
    ) -> Self {
        IngestionController {
            lock,
            storage,
            pattern_detector,
            personality_classifier,
            memory_sampler,
            events,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
            tab_coordinator: None,
        }
    }

    /// Enforces §5's "only the primary tab may write" policy before every upload.
    pub fn with_tab_coordinator(mut self, tab_coordinator: Arc<TabCoordinator>) -> Self {
        self.tab_coordinator = Some(tab_coordinator);
        self
    }

    pub fn cancel_processing(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// `bucket_type` governs chunkification; defaults to the config's default elsewhere.
    pub async fn handle_file_upload(&self, request: UploadRequest, bucket_type: BucketType) -> Result<IngestionOutcome> {
        if let Some(tab_coordinator) = &self.tab_coordinator {
            if !tab_coordinator.is_primary().await {
                let err = ReverieError::ReadOnlyAuthority {
                    operation: "file_processing".to_string(),
                };
                self.events
                    .on_ingestion_event(IngestionEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        }

        let input = match validate_upload(&request, &self.config) {
            Ok(input) => input,
            Err(err) => {
                self.events
                    .on_ingestion_event(IngestionEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };

        let owner_token = match self.lock.acquire("file_processing", AcquireOptions::default()).await {
            Ok(token) => token,
            Err(err) => {
                self.events
                    .on_ingestion_event(IngestionEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };

        self.cancelled.store(false, Ordering::SeqCst);
        let result = self.run_ingestion(input, bucket_type).await;

        // All exit paths release the lock, regardless of outcome.
        let _ = self.lock.release("file_processing", &owner_token).await;

        if let Err(err) = &result {
            self.events
                .on_ingestion_event(IngestionEvent::Error {
                    message: err.to_string(),
                })
                .await;
        }
        result
    }

    async fn run_ingestion(&self, input: ParserInput, bucket_type: BucketType) -> Result<IngestionOutcome> {
        let existing_keys = self.storage.existing_stream_keys().await?;
        let existing_range = self.storage.existing_stream_range().await?;

        let mut handle = StreamParser::spawn(
            input,
            existing_keys,
            existing_range,
            bucket_type,
            self.memory_sampler.clone(),
            self.config.clone(),
        );

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                handle.abort().await;
                return Err(ReverieError::validation("ingestion cancelled"));
            }

            let Some(message) = handle.from_parser.recv().await else {
                return Err(ReverieError::parse("parser worker terminated without a completion message"));
            };

            match message {
                ParserToController::Progress(message) => {
                    self.events.on_ingestion_event(IngestionEvent::Progress { message }).await;
                }
                ParserToController::MemoryWarning { usage_ratio } => {
                    self.events
                        .on_ingestion_event(IngestionEvent::MemoryWarning { usage_ratio })
                        .await;
                }
                ParserToController::MemoryResumed => {
                    self.events.on_ingestion_event(IngestionEvent::MemoryResumed).await;
                }
                ParserToController::Partial {
                    batch,
                    file_index,
                    total_files,
                    stream_count,
                    ack_id,
                } => {
                    if let Err(err) = self.storage.append_streams(&batch).await {
                        // Partial-save failures are logged but do not abort the stream;
                        // they are retried at the final save step.
                        self.events
                            .on_ingestion_event(IngestionEvent::Error {
                                message: format!("partial append failed (will retry at final save): {err}"),
                            })
                            .await;
                    }
                    self.events
                        .on_ingestion_event(IngestionEvent::Partial {
                            file_index,
                            total_files,
                            stream_count,
                            ack_id: ack_id.clone(),
                        })
                        .await;
                    let _ = handle.to_parser.send(ControllerToParser::Ack { ack_id }).await;
                }
                ParserToController::OverlapDetected {
                    overlap_days,
                    exact_duplicates,
                    unique_new,
                } => {
                    self.events
                        .on_ingestion_event(IngestionEvent::OverlapDetected {
                            overlap_days,
                            exact_duplicates,
                            unique_new,
                        })
                        .await;
                    // Default policy absent an interactive UI: merge (keep unique-new streams).
                    let _ = handle
                        .to_parser
                        .send(ControllerToParser::ResolveOverlap {
                            resolution: OverlapResolution::Merge,
                        })
                        .await;
                }
                ParserToController::Complete { .. } => {
                    // The parser's own `streams`/`chunks` cover only this run's new
                    // delta; `append_streams` already committed that delta above, so
                    // storage now holds the full merged history. Recompute chunks,
                    // patterns, and personality over that full history rather than
                    // over the delta alone, so a second overlapping upload doesn't
                    // regress pattern detection to "what this upload alone shows."
                    let mut full_streams = self.storage.load_all_streams().await?;
                    full_streams.sort_by_key(|s| s.timestamp);
                    let full_chunks = crate::ingestion::normalize::chunkify(&full_streams, bucket_type);

                    let patterns = self.pattern_detector.detect(&full_streams, &full_chunks).await;
                    let personality = self.personality_classifier.classify(&patterns).await;

                    self.storage.save_final(&full_streams, &full_chunks, &personality).await?;

                    self.events
                        .on_ingestion_event(IngestionEvent::Complete {
                            stream_count: full_streams.len(),
                            chunk_count: full_chunks.len(),
                        })
                        .await;

                    return Ok(IngestionOutcome {
                        streams: full_streams,
                        chunks: full_chunks,
                        personality,
                    });
                }
                ParserToController::Error(message) => {
                    return Err(ReverieError::parse(message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::pattern::BasicPatternDetector;
    use crate::ingestion::personality::BasicPersonalityClassifier;
    use crate::ingestion::parser::NullMemorySampler;
    use crate::storage::memory::InMemoryStorage;

    fn sample_json() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!([{
            "ts": "2026-02-01T13:12:57.841Z", "track": "T", "artist": "A", "album": null,
            "ms_played": 180000, "track_duration_ms": 200000,
            "source_platform": null, "shuffle": false, "skipped": false,
            "offline": false, "start_reason": null, "end_reason": null
        }]))
        .unwrap()
    }

    fn build_controller() -> IngestionController {
        IngestionController::new(
            Arc::new(OperationLock::with_default_conflicts()),
            Arc::new(InMemoryStorage::default()),
            Arc::new(BasicPatternDetector),
            Arc::new(BasicPersonalityClassifier),
            Arc::new(NullMemorySampler),
            Arc::new(crate::event::NullEventHandler),
            ReverieConfig::default(),
        )
    }

    #[tokio::test]
    async fn single_record_reveals_personality() {
        let controller = build_controller();
        let outcome = controller
            .handle_file_upload(
                UploadRequest {
                    kind: UploadKind::Json,
                    bytes: sample_json(),
                },
                BucketType::Weekly,
            )
            .await
            .unwrap();
        assert_eq!(outcome.streams.len(), 1);
        assert!(!outcome.personality.label.is_empty());
    }

    #[tokio::test]
    async fn oversized_upload_rejected_before_lock_acquired() {
        let controller = build_controller();
        let mut config = ReverieConfig::default();
        config.max_upload_bytes = 10;
        let request = UploadRequest {
            kind: UploadKind::Json,
            bytes: sample_json(),
        };
        let err = validate_upload(&request, &config).unwrap_err();
        assert!(matches!(err, ReverieError::Validation { .. }));
        assert!(!controller.lock.is_locked("file_processing").await);
    }

    #[tokio::test]
    async fn conflicting_operation_rejects_with_toast_event() {
        let controller = build_controller();
        let _token = controller
            .lock
            .acquire("demo_load", AcquireOptions::default())
            .await
            .unwrap();

        let err = controller
            .handle_file_upload(
                UploadRequest {
                    kind: UploadKind::Json,
                    bytes: sample_json(),
                },
                BucketType::Weekly,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReverieError::LockAcquisition { .. }));
    }

    #[tokio::test]
    async fn secondary_tab_is_rejected_before_any_storage_write() {
        use crate::tab_coordinator::{InProcessBroadcast, LivenessRecord, TabCoordinator};

        let transport = Arc::new(InProcessBroadcast::new());
        // A different, lexicographically-smaller tab holds primary.
        transport
            .publish_liveness(LivenessRecord {
                tab_id: "0-primary-elsewhere".to_string(),
                last_heartbeat: chrono::Utc::now(),
            })
            .await;
        let tab_coordinator = Arc::new(TabCoordinator::new(transport, chrono::Duration::seconds(30)));
        tab_coordinator.init().await;
        assert!(!tab_coordinator.is_primary().await);

        let storage = Arc::new(InMemoryStorage::default());
        let controller = IngestionController::new(
            Arc::new(OperationLock::with_default_conflicts()),
            storage.clone(),
            Arc::new(BasicPatternDetector),
            Arc::new(BasicPersonalityClassifier),
            Arc::new(NullMemorySampler),
            Arc::new(crate::event::NullEventHandler),
            ReverieConfig::default(),
        )
        .with_tab_coordinator(tab_coordinator);

        let err = controller
            .handle_file_upload(
                UploadRequest {
                    kind: UploadKind::Json,
                    bytes: sample_json(),
                },
                BucketType::Weekly,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReverieError::ReadOnlyAuthority { .. }));
        assert!(!controller.lock.is_locked("file_processing").await);
        assert_eq!(storage.stream_count().await, 0);
    }
}
