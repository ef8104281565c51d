//! Persistence seam. The browser's IndexedDB is a host concern; [`Storage`] is the
//! trait the core programs against, with an in-memory reference implementation for
//! tests and as a development default (mirroring how the teacher crate abstracts over
//! the concrete LLM vendor behind `ClientWrapper` rather than hard-coding one).

pub mod demo;
pub mod memory;

use crate::errors::Result;
use crate::model::{Chunk, Personality, Stream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Production (non-demo) persistence: streams, chunks, personality, configuration, and
/// an event log in disjoint object stores, per §6.
#[async_trait]
pub trait Storage: Send + Sync {
    /// `(timestamp, track, artist)` dedup keys for every stream already committed.
    async fn existing_stream_keys(&self) -> Result<HashSet<(i64, String, String)>>;

    /// The `[min, max]` timestamp range of already-committed streams, if any exist.
    async fn existing_stream_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;

    /// The full committed stream set, used to recompute chunks/personality over the
    /// combined history (previously-saved streams plus this run's incrementally
    /// appended batches) rather than over only the most recent upload's delta.
    async fn load_all_streams(&self) -> Result<Vec<Stream>>;

    /// Appends a partial batch as it arrives; failures here are logged by the caller
    /// and retried at `save_final`, not treated as fatal.
    async fn append_streams(&self, batch: &[Stream]) -> Result<()>;

    /// Persists the final, complete artifact set for a successful ingestion.
    async fn save_final(&self, streams: &[Stream], chunks: &[Chunk], personality: &Personality) -> Result<()>;

    /// Drops all streams/chunks/personality, e.g. on `reset`.
    async fn clear(&self) -> Result<()>;

    async fn log_event(&self, message: &str) -> Result<()>;
}
