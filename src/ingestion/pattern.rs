//! `PatternDetector` — an external interface per the specification's scope note; the
//! actual heuristics are peripheral, so only a minimal built-in implementation is
//! provided here to exercise the ingestion pipeline end to end, analogous to how the
//! teacher crate ships a concrete `tools::Calculator` alongside its generic tool trait.

use crate::model::{Chunk, PatternResult, PatternSet, Stream};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;

#[async_trait]
pub trait PatternDetector: Send + Sync {
    async fn detect(&self, streams: &[Stream], chunks: &[Chunk]) -> PatternSet;
}

/// Derives a handful of simple, explainable patterns: discovery ratio (share of
/// distinct artists among total plays), skip rate, and a rough era-presence histogram.
pub struct BasicPatternDetector;

#[async_trait]
impl PatternDetector for BasicPatternDetector {
    async fn detect(&self, streams: &[Stream], chunks: &[Chunk]) -> PatternSet {
        let mut patterns = HashMap::new();

        if streams.is_empty() {
            return PatternSet {
                patterns,
                is_demo_data: false,
            };
        }

        let total = streams.len() as f64;
        let unique_artists: std::collections::HashSet<&str> = streams
            .iter()
            .filter_map(|s| s.artist_name.as_deref())
            .filter(|a| !a.trim().is_empty())
            .collect();
        let discovery_ratio = unique_artists.len() as f64 / total;
        patterns.insert(
            "discovery_ratio".to_string(),
            PatternResult {
                value: json!({ "ratio": discovery_ratio, "unique_artists": unique_artists.len() }),
                summary: Some(format!("{} distinct artists across {} plays", unique_artists.len(), streams.len())),
            },
        );

        let skip_count = streams
            .iter()
            .filter(|s| matches!(s.play_type, crate::model::PlayType::Skip))
            .count();
        let skip_rate = skip_count as f64 / total;
        patterns.insert(
            "skip_rate".to_string(),
            PatternResult {
                value: json!({ "rate": skip_rate, "count": skip_count }),
                summary: Some(format!("{:.0}% of plays were skipped", skip_rate * 100.0)),
            },
        );

        patterns.insert(
            "chunk_coverage".to_string(),
            PatternResult {
                value: json!({ "chunk_count": chunks.len() }),
                summary: Some(format!("spans {} time buckets", chunks.len())),
            },
        );

        PatternSet {
            patterns,
            is_demo_data: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::normalize::{chunkify, normalize_batch, RawRecord};
    use crate::model::BucketType;
    use std::collections::HashSet;

    #[tokio::test]
    async fn detects_basic_patterns() {
        let raw = vec![RawRecord {
            timestamp: "2026-02-01T13:12:57Z".parse().unwrap(),
            track_name: "T".to_string(),
            artist_name: Some("A".to_string()),
            album_name: None,
            ms_played: 180_000,
            track_duration_ms: Some(180_000),
            source_platform: None,
            shuffle: false,
            skipped: false,
            offline: false,
            start_reason: None,
            end_reason: None,
        }];
        let result = normalize_batch(raw, &HashSet::new());
        let chunks = chunkify(&result.streams, BucketType::Weekly);
        let patterns = BasicPatternDetector.detect(&result.streams, &chunks).await;
        assert!(patterns.patterns.contains_key("discovery_ratio"));
        assert!(!patterns.is_demo_data);
    }
}
