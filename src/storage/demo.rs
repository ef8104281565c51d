//! Isolated, namespaced persistence for demo data plus the atomic three-phase demo-mode
//! activation described in SPEC_FULL §4.11. Demo data lives in object stores disjoint
//! from production storage so a demo session never contaminates real data.

use crate::errors::{ReverieError, Result};
use crate::ingestion::{PatternDetector, PersonalityClassifier};
use crate::lock::{AcquireOptions, OperationLock};
use crate::model::{Personality, Stream};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEMO_KEY_PREFIX: &str = "demo:";

#[derive(Debug, Clone)]
pub struct DemoPackage {
    pub streams: Vec<Stream>,
    pub patterns: crate::model::PatternSet,
    pub personality: Personality,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

/// Namespaced demo persistence with a write-through cache that is only populated after
/// a successful backing-store write — the cache is never authoritative over a failed
/// write.
#[derive(Default)]
pub struct DemoStorage {
    persisted: RwLock<Option<DemoPackage>>,
    cache: RwLock<Option<DemoPackage>>,
    flags: RwLock<HashMap<String, String>>,
}

impl DemoStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn persist(&self, package: DemoPackage) -> Result<()> {
        *self.persisted.write().await = Some(package.clone());
        // Only mirror into the cache after the backing write above has succeeded.
        *self.cache.write().await = Some(package);
        Ok(())
    }

    pub async fn set_flag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.flags.write().await.insert(format!("{DEMO_KEY_PREFIX}{}", key.into()), value.into());
    }

    pub async fn cached(&self) -> Option<DemoPackage> {
        self.cache.read().await.clone()
    }

    /// Inspects persisted state: streams must be a non-empty array; patterns/personality
    /// must be present.
    pub async fn validate(&self) -> ValidationResult {
        let persisted = self.persisted.read().await;
        match persisted.as_ref() {
            None => ValidationResult {
                valid: false,
                reason: Some("no demo package persisted".to_string()),
            },
            Some(package) if package.streams.is_empty() => ValidationResult {
                valid: false,
                reason: Some("streams is empty".to_string()),
            },
            Some(_) => ValidationResult {
                valid: true,
                reason: None,
            },
        }
    }

    /// Drops cache, prefixed flags, and the persisted store.
    pub async fn clear(&self) -> Result<()> {
        *self.cache.write().await = None;
        *self.persisted.write().await = None;
        self.flags.write().await.retain(|k, _| !k.starts_with(DEMO_KEY_PREFIX));
        Ok(())
    }

    pub async fn is_empty(&self) -> bool {
        self.persisted.read().await.is_none() && self.cache.read().await.is_none()
    }
}

#[derive(Default)]
struct AppStateInner {
    is_demo_mode: bool,
    demo_package: Option<DemoPackage>,
}

/// In-memory application state: the single source of truth read paths go through while
/// demo mode is active. `DemoStorage` is only the persistence tier for session recovery.
#[derive(Default)]
pub struct AppState {
    inner: RwLock<AppStateInner>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_demo_mode(&self) -> bool {
        self.inner.read().await.is_demo_mode
    }

    pub async fn demo_package(&self) -> Option<DemoPackage> {
        self.inner.read().await.demo_package.clone()
    }

    async fn set_demo(&self, package: Option<DemoPackage>) {
        let mut inner = self.inner.write().await;
        inner.is_demo_mode = package.is_some();
        inner.demo_package = package;
    }
}

/// Runs the atomic three-phase demo-mode activation under the `demo_load` lock:
/// assemble -> persist -> validate (clearing and aborting on failure) -> flip the
/// in-memory flag only once persistence is confirmed good.
pub async fn activate_demo_mode(
    lock: &OperationLock,
    demo_storage: &DemoStorage,
    app_state: &AppState,
    pattern_detector: &Arc<dyn PatternDetector>,
    personality_classifier: &Arc<dyn PersonalityClassifier>,
    generated_streams: Vec<Stream>,
) -> Result<()> {
    let owner_token = lock.acquire("demo_load", AcquireOptions::default()).await?;

    let result = async {
        // Phase 1: assemble the demo package; patterns are recomputed from the
        // generated streams rather than accepted pre-built, for source-of-truth
        // consistency with whatever heuristics are live.
        let patterns = pattern_detector.detect(&generated_streams, &[]).await;
        let personality = personality_classifier.classify(&patterns).await;
        let package = DemoPackage {
            streams: generated_streams,
            patterns,
            personality,
        };

        // Phase 2: persist to DemoStorage.
        demo_storage.persist(package.clone()).await?;

        // Phase 3: validate; on failure clear and abort without touching app state.
        let validation = demo_storage.validate().await;
        if !validation.valid {
            demo_storage.clear().await?;
            return Err(ReverieError::validation(format!(
                "demo package failed validation: {}",
                validation.reason.unwrap_or_default()
            )));
        }

        demo_storage.set_flag("active", "true").await;

        // Phase 4: only now update in-memory state.
        app_state.set_demo(Some(package)).await;
        Ok(())
    }
    .await;

    lock.release("demo_load", &owner_token).await?;
    result
}

/// Exits demo mode: clears DemoStorage first, then the in-memory flag, per §4.11.
pub async fn exit_demo_mode(lock: &OperationLock, demo_storage: &DemoStorage, app_state: &AppState) -> Result<()> {
    let owner_token = lock.acquire("demo_load", AcquireOptions::default()).await?;
    let result = async {
        demo_storage.clear().await?;
        app_state.set_demo(None).await;
        Ok(())
    }
    .await;
    lock.release("demo_load", &owner_token).await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{BasicPatternDetector, BasicPersonalityClassifier};
    use crate::model::{PlayType, Stream};
    use chrono::Utc;

    fn sample_stream() -> Stream {
        Stream {
            timestamp: Utc::now(),
            track_name: "T".to_string(),
            artist_name: Some("A".to_string()),
            album_name: None,
            ms_played: 180_000,
            completion_ratio: Some(0.9),
            play_type: PlayType::Full,
            source_platform: None,
            shuffle: false,
            skipped: false,
            offline: false,
            start_reason: None,
            end_reason: None,
        }
    }

    #[tokio::test]
    async fn activation_flips_state_only_after_valid_persist() {
        let lock = OperationLock::with_default_conflicts();
        let demo_storage = DemoStorage::new();
        let app_state = AppState::new();
        let pattern_detector: Arc<dyn PatternDetector> = Arc::new(BasicPatternDetector);
        let classifier: Arc<dyn PersonalityClassifier> = Arc::new(BasicPersonalityClassifier);

        activate_demo_mode(
            &lock,
            &demo_storage,
            &app_state,
            &pattern_detector,
            &classifier,
            vec![sample_stream()],
        )
        .await
        .unwrap();

        assert!(app_state.is_demo_mode().await);
        assert!(demo_storage.cached().await.is_some());
        assert!(!lock.is_locked("demo_load").await);
    }

    #[tokio::test]
    async fn activation_with_empty_streams_aborts_and_clears() {
        let lock = OperationLock::with_default_conflicts();
        let demo_storage = DemoStorage::new();
        let app_state = AppState::new();
        let pattern_detector: Arc<dyn PatternDetector> = Arc::new(BasicPatternDetector);
        let classifier: Arc<dyn PersonalityClassifier> = Arc::new(BasicPersonalityClassifier);

        let err = activate_demo_mode(&lock, &demo_storage, &app_state, &pattern_detector, &classifier, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ReverieError::Validation { .. }));
        assert!(!app_state.is_demo_mode().await);
        assert!(demo_storage.is_empty().await);
    }

    #[tokio::test]
    async fn exit_clears_storage_before_state() {
        let lock = OperationLock::with_default_conflicts();
        let demo_storage = DemoStorage::new();
        let app_state = AppState::new();
        let pattern_detector: Arc<dyn PatternDetector> = Arc::new(BasicPatternDetector);
        let classifier: Arc<dyn PersonalityClassifier> = Arc::new(BasicPersonalityClassifier);

        activate_demo_mode(&lock, &demo_storage, &app_state, &pattern_detector, &classifier, vec![sample_stream()])
            .await
            .unwrap();
        exit_demo_mode(&lock, &demo_storage, &app_state).await.unwrap();

        assert!(!app_state.is_demo_mode().await);
        assert!(demo_storage.is_empty().await);
    }
}
