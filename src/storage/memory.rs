//! Reference `Storage` implementation backed by in-memory, lock-protected state.
//! Suitable for tests and as a development default; a real embedding swaps in an
//! IndexedDB-backed implementation of the same trait.

use crate::errors::Result;
use crate::model::{Chunk, Personality, Stream};
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    streams: Vec<Stream>,
    chunks: Vec<Chunk>,
    personality: Option<Personality>,
    event_log: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn existing_stream_keys(&self) -> Result<HashSet<(i64, String, String)>> {
        let state = self.state.read().await;
        Ok(state.streams.iter().map(|s| s.dedup_key()).collect())
    }

    async fn existing_stream_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let state = self.state.read().await;
        let min = state.streams.iter().map(|s| s.timestamp).min();
        let max = state.streams.iter().map(|s| s.timestamp).max();
        Ok(min.zip(max))
    }

    async fn load_all_streams(&self) -> Result<Vec<Stream>> {
        Ok(self.state.read().await.streams.clone())
    }

    async fn append_streams(&self, batch: &[Stream]) -> Result<()> {
        let mut state = self.state.write().await;
        state.streams.extend_from_slice(batch);
        Ok(())
    }

    async fn save_final(&self, streams: &[Stream], chunks: &[Chunk], personality: &Personality) -> Result<()> {
        let mut state = self.state.write().await;
        state.streams = streams.to_vec();
        state.chunks = chunks.to_vec();
        state.personality = Some(personality.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.streams.clear();
        state.chunks.clear();
        state.personality = None;
        Ok(())
    }

    async fn log_event(&self, message: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.event_log.push(message.to_string());
        Ok(())
    }
}

impl InMemoryStorage {
    pub async fn stream_count(&self) -> usize {
        self.state.read().await.streams.len()
    }

    pub async fn personality(&self) -> Option<Personality> {
        self.state.read().await.personality.clone()
    }
}
