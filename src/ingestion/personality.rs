//! `PersonalityClassifier` — an external interface; a minimal built-in implementation
//! maps a [`PatternSet`] to a [`Personality`] so the pipeline is exercisable end to end.

use crate::model::{PatternSet, Personality};
use async_trait::async_trait;

#[async_trait]
pub trait PersonalityClassifier: Send + Sync {
    async fn classify(&self, patterns: &PatternSet) -> Personality;
}

pub struct BasicPersonalityClassifier;

#[async_trait]
impl PersonalityClassifier for BasicPersonalityClassifier {
    async fn classify(&self, patterns: &PatternSet) -> Personality {
        let discovery_ratio = patterns
            .patterns
            .get("discovery_ratio")
            .and_then(|p| p.value.get("ratio"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        let (label, emoji, tagline) = if discovery_ratio > 0.6 {
            ("The Explorer", "\u{1F9ED}", "always chasing the next artist")
        } else if discovery_ratio > 0.3 {
            ("The Curator", "\u{1F3B5}", "a balance of favorites and discovery")
        } else {
            ("The Loyalist", "\u{1F3E0}", "a small, well-loved rotation")
        };

        let evidence: Vec<String> = patterns
            .patterns
            .keys()
            .filter(|k| k.as_str() == "discovery_ratio" || k.as_str() == "skip_rate")
            .cloned()
            .collect();

        Personality {
            label: label.to_string(),
            emoji: emoji.to_string(),
            tagline: tagline.to_string(),
            description: format!(
                "Derived from a discovery ratio of {:.2} across the provided listening history.",
                discovery_ratio
            ),
            evidence,
            summary: patterns.patterns.get("discovery_ratio").and_then(|p| p.summary.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PatternResult;
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn classifies_non_null_label() {
        let mut patterns = HashMap::new();
        patterns.insert(
            "discovery_ratio".to_string(),
            PatternResult {
                value: json!({ "ratio": 0.8 }),
                summary: Some("high discovery".to_string()),
            },
        );
        let set = PatternSet {
            patterns,
            is_demo_data: false,
        };
        let personality = BasicPersonalityClassifier.classify(&set).await;
        assert!(!personality.label.is_empty());
        assert_eq!(personality.label, "The Explorer");
    }
}
