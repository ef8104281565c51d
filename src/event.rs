//! Structured observability events, modeled on `cloudllm::event::{AgentEvent, EventHandler}`:
//! a single handler trait with no-op default methods so embedders opt into only the
//! events they care about.

use async_trait::async_trait;

/// Progress traffic emitted by the ingestion pipeline, mirroring §4.4's message table.
#[derive(Debug, Clone)]
pub enum IngestionEvent {
    Progress { message: String },
    MemoryWarning { usage_ratio: f64 },
    MemoryResumed,
    Partial {
        file_index: usize,
        total_files: usize,
        stream_count: usize,
        ack_id: String,
    },
    OverlapDetected {
        overlap_days: i64,
        exact_duplicates: usize,
        unique_new: usize,
    },
    Complete { stream_count: usize, chunk_count: usize },
    Error { message: String },
}

/// Traffic emitted while a chat turn is streaming.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    TurnStarted,
    Token { token: String },
    Thinking { content: String },
    ToolCallDetected { call_id: String, function_name: String },
    ToolCallCompleted { call_id: String },
    TurnCompleted,
}

/// Single sink for both event families. All methods default to no-ops; an embedder
/// overrides only what it displays.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_ingestion_event(&self, _event: IngestionEvent) {}
    async fn on_chat_event(&self, _event: ChatEvent) {}
}

/// A handler that discards every event; the default when no embedder is attached.
pub struct NullEventHandler;

#[async_trait]
impl EventHandler for NullEventHandler {}
