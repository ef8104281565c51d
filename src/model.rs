//! Core data model shared across the ingestion, function-calling, and chat subsystems.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Tag describing how much of a track was played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayType {
    Full,
    Partial,
    Skip,
}

/// An enriched play record normalized from the user's history export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub timestamp: DateTime<Utc>,
    pub track_name: String,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub ms_played: u64,
    /// ms_played / track duration, where known; clamped to [0, 1] otherwise left `None`.
    pub completion_ratio: Option<f64>,
    pub play_type: PlayType,
    pub source_platform: Option<String>,
    pub shuffle: bool,
    pub skipped: bool,
    pub offline: bool,
    pub start_reason: Option<String>,
    pub end_reason: Option<String>,
}

impl Stream {
    /// The `(timestamp, track, artist)` tuple used for deduplication, per the data model.
    pub fn dedup_key(&self) -> (i64, String, String) {
        (
            self.timestamp.timestamp_millis(),
            self.track_name.clone(),
            self.artist_name.clone().unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketType {
    Daily,
    Weekly,
    Monthly,
}

/// A time-bucketed aggregate of streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub bucket_id: String,
    pub bucket_type: BucketType,
    pub start_date: DateTime<Utc>,
    pub stream_count: usize,
    pub unique_artists: usize,
    pub unique_tracks: usize,
}

/// One derived behavioral signal, with an opaque structured payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternResult {
    pub value: Value,
    pub summary: Option<String>,
}

/// An unordered mapping from pattern name to pattern result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternSet {
    pub patterns: HashMap<String, PatternResult>,
    pub is_demo_data: bool,
}

/// A label/persona mapped from a pattern set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    pub label: String,
    pub emoji: String,
    pub tagline: String,
    pub description: String,
    /// Names of patterns cited as evidence; must be a subset of the source PatternSet's keys.
    pub evidence: Vec<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
    Tool,
    System,
}

/// A single function/tool call emitted by an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    /// Always a JSON-encoded string per the tool-argument-safety property.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: ConversationRole,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Set on `role: tool` messages; references the invoking assistant message's call id.
    pub tool_call_id: Option<String>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ConversationMessage {
            role: ConversationRole::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        ConversationMessage {
            role: ConversationRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ConversationMessage {
            role: ConversationRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        ConversationMessage {
            role: ConversationRole::System,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// Ordered sequence of conversation messages, with truncation semantics for edit/delete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
    }

    /// Truncates the transcript from `index` onward (inclusive), per edit/delete semantics.
    pub fn truncate_from(&mut self, index: usize) {
        self.messages.truncate(index);
    }

    pub fn delete_at(&mut self, index: usize) {
        if index < self.messages.len() {
            self.messages.remove(index);
        }
    }

    /// Role-aware delete per the §3 data-model invariants: deleting a `User` message
    /// truncates the transcript from that index onward (its assistant/tool replies
    /// cannot survive it), since tool messages must always follow their invoking
    /// assistant message. Deleting an `Assistant`/`Tool`/`System` message removes only
    /// that one message, except that an `Assistant` message carrying `tool_calls` also
    /// drops its trailing tool-result messages, which would otherwise be orphaned.
    pub fn delete_message(&mut self, index: usize) {
        let Some(target) = self.messages.get(index) else { return };
        if target.role == ConversationRole::User {
            self.truncate_from(index);
            return;
        }

        let had_tool_calls = !target.tool_calls.is_empty();
        self.delete_at(index);
        if had_tool_calls {
            while self
                .messages
                .get(index)
                .is_some_and(|m| m.role == ConversationRole::Tool)
            {
                self.delete_at(index);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityLevel {
    Primary,
    Secondary,
}

#[derive(Debug, Clone)]
pub struct AuthorityRecord {
    pub level: AuthorityLevel,
    pub since: DateTime<Utc>,
}
