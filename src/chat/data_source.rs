//! The data the orchestrator hands to tool executors and folds into the system prompt,
//! switched transparently between production and demo streams per §4.11's "reads go
//! through application state" rule — the orchestrator never needs to know which it has.

use crate::model::Stream;

pub trait ChatDataSource: Send + Sync {
    fn is_demo(&self) -> bool;
    fn streams(&self) -> &[Stream];

    /// A short natural-language summary folded into the system prompt ahead of the
    /// conversation, so the model has listening context without re-deriving it via
    /// tool calls on every turn.
    fn data_summary(&self) -> String {
        let streams = self.streams();
        if streams.is_empty() {
            return "No listening history has been imported yet.".to_string();
        }
        let artists: std::collections::HashSet<&str> =
            streams.iter().filter_map(|s| s.artist_name.as_deref()).collect();
        format!(
            "{} tracked plays across {} distinct artists{}.",
            streams.len(),
            artists.len(),
            if self.is_demo() { " (demo data)" } else { "" }
        )
    }
}

/// A fixed snapshot of streams, suitable for both demo mode (regenerated on each demo
/// activation) and production (refreshed after each ingestion).
pub struct StaticDataSource {
    streams: Vec<Stream>,
    demo: bool,
}

impl StaticDataSource {
    pub fn new(streams: Vec<Stream>, demo: bool) -> Self {
        StaticDataSource { streams, demo }
    }

    pub fn empty() -> Self {
        StaticDataSource {
            streams: Vec::new(),
            demo: false,
        }
    }
}

impl ChatDataSource for StaticDataSource {
    fn is_demo(&self) -> bool {
        self.demo
    }

    fn streams(&self) -> &[Stream] {
        &self.streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_reports_no_history() {
        let source = StaticDataSource::empty();
        assert_eq!(source.data_summary(), "No listening history has been imported yet.");
    }

    #[test]
    fn demo_source_is_labeled_in_summary() {
        let source = StaticDataSource::new(
            vec![Stream {
                timestamp: chrono::Utc::now(),
                track_name: "T".to_string(),
                artist_name: Some("A".to_string()),
                album_name: None,
                ms_played: 1,
                completion_ratio: None,
                play_type: crate::model::PlayType::Full,
                source_platform: None,
                shuffle: false,
                skipped: false,
                offline: false,
                start_reason: None,
                end_reason: None,
            }],
            true,
        );
        assert!(source.data_summary().contains("demo data"));
    }
}
