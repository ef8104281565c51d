//! Off-thread archive/JSON parser: streams ordered messages to its controller under
//! backpressure (at most one unacknowledged `partial` at a time) and memory-pressure
//! throttling. Worker/controller messaging is two disjoint tagged-union message sets,
//! per SPEC_FULL's "worker <-> UI messaging" design note — no shared mutable state
//! crosses the channel boundary.

use crate::config::ReverieConfig;
use crate::ingestion::normalize::{chunkify, normalize_batch, RawRecord};
use crate::model::{BucketType, Chunk, Stream};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The fixed magic bytes an archive input must begin with. A failing signature check
/// is a hard, fatal rejection (S5-adjacent validation gate).
pub const ARCHIVE_MAGIC: &[u8] = b"RVAR1\0";

/// Exposes host memory pressure to the parser. A browser host backs this with
/// `performance.memory` or similar; [`NullMemorySampler`] reports no pressure.
pub trait MemorySampler: Send + Sync {
    fn usage_ratio(&self) -> Option<f64>;
}

pub struct NullMemorySampler;

impl MemorySampler for NullMemorySampler {
    fn usage_ratio(&self) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapResolution {
    Merge,
    Replace,
    Keep,
}

/// Controller -> parser messages.
#[derive(Debug, Clone)]
pub enum ControllerToParser {
    Ack { ack_id: String },
    ResolveOverlap { resolution: OverlapResolution },
    Abort,
}

/// Parser -> controller messages, per SPEC_FULL's message table.
#[derive(Debug, Clone)]
pub enum ParserToController {
    Progress(String),
    MemoryWarning { usage_ratio: f64 },
    MemoryResumed,
    Partial {
        batch: Vec<Stream>,
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
    Complete { streams: Vec<Stream>, chunks: Vec<Chunk> },
    Error(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportRecord {
    pub ts: String,
    pub track: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub ms_played: u64,
    pub track_duration_ms: Option<u64>,
    pub source_platform: Option<String>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub offline: bool,
    pub start_reason: Option<String>,
    pub end_reason: Option<String>,
}

pub struct ArchiveMember {
    pub name: String,
    pub json_bytes: Vec<u8>,
}

/// A history-shaped member name is any name ending in `.json`; others are skipped
/// during archive enumeration.
fn is_history_shaped(name: &str) -> bool {
    name.ends_with(".json")
}

/// Minimal custom archive framing: magic bytes, `u32` member count, then per member a
/// `u32` name length, name bytes, `u64` body length, body bytes.
pub fn unpack_archive(bytes: &[u8]) -> Result<Vec<ArchiveMember>, String> {
    if bytes.len() < ARCHIVE_MAGIC.len() || &bytes[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
        return Err("malformed archive signature".to_string());
    }
    let mut cursor = ARCHIVE_MAGIC.len();
    let read_u32 = |b: &[u8], at: usize| -> Result<u32, String> {
        b.get(at..at + 4)
            .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
            .ok_or_else(|| "truncated archive".to_string())
    };
    let read_u64 = |b: &[u8], at: usize| -> Result<u64, String> {
        b.get(at..at + 8)
            .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
            .ok_or_else(|| "truncated archive".to_string())
    };

    let count = read_u32(bytes, cursor)?;
    cursor += 4;
    let mut members = Vec::new();
    for _ in 0..count {
        let name_len = read_u32(bytes, cursor)? as usize;
        cursor += 4;
        let name = String::from_utf8(bytes.get(cursor..cursor + name_len).ok_or("truncated archive")?.to_vec())
            .map_err(|_| "invalid member name encoding".to_string())?;
        cursor += name_len;
        let body_len = read_u64(bytes, cursor)? as usize;
        cursor += 8;
        let body = bytes.get(cursor..cursor + body_len).ok_or("truncated archive")?.to_vec();
        cursor += body_len;
        if is_history_shaped(&name) {
            members.push(ArchiveMember { name, json_bytes: body });
        }
    }
    Ok(members)
}

/// Packs members back into the archive wire format; used by tests and by anything
/// producing synthetic fixtures.
pub fn pack_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(ARCHIVE_MAGIC);
    out.extend_from_slice(&(members.len() as u32).to_le_bytes());
    for (name, body) in members {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(body);
    }
    out
}

pub enum ParserInput {
    Json(Vec<u8>),
    Archive(Vec<u8>),
}

fn decode_raw_records(bytes: &[u8]) -> Result<Vec<RawRecord>, String> {
    let records: Vec<ExportRecord> = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let timestamp: DateTime<Utc> = record
            .ts
            .parse()
            .map_err(|_| format!("unparseable timestamp '{}'", record.ts))?;
        out.push(RawRecord {
            timestamp,
            track_name: record.track,
            artist_name: record.artist,
            album_name: record.album,
            ms_played: record.ms_played,
            track_duration_ms: record.track_duration_ms,
            source_platform: record.source_platform,
            shuffle: record.shuffle,
            skipped: record.skipped,
            offline: record.offline,
            start_reason: record.start_reason,
            end_reason: record.end_reason,
        });
    }
    Ok(out)
}

pub struct ParserHandle {
    pub to_parser: mpsc::Sender<ControllerToParser>,
    pub from_parser: mpsc::Receiver<ParserToController>,
    join: tokio::task::JoinHandle<()>,
}

impl ParserHandle {
    /// Idempotent: sending `Abort` to an already-finished worker is a harmless no-op.
    pub async fn abort(self) {
        let _ = self.to_parser.send(ControllerToParser::Abort).await;
        self.join.abort();
    }
}

pub struct StreamParser;

impl StreamParser {
    /// Spawns the worker task. `existing_keys` and `existing_range` describe streams
    /// already committed to storage, used for cross-file deduplication and overlap
    /// detection; pass empty/`None` for a first ingestion.
    pub fn spawn(
        input: ParserInput,
        existing_keys: HashSet<(i64, String, String)>,
        existing_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        bucket_type: BucketType,
        memory_sampler: Arc<dyn MemorySampler>,
        config: ReverieConfig,
    ) -> ParserHandle {
        let (to_parser_tx, to_parser_rx) = mpsc::channel(4);
        let (from_parser_tx, from_parser_rx) = mpsc::channel(16);

        let join = tokio::spawn(run_parser(
            input,
            existing_keys,
            existing_range,
            bucket_type,
            memory_sampler,
            config,
            to_parser_rx,
            from_parser_tx,
        ));

        ParserHandle {
            to_parser: to_parser_tx,
            from_parser: from_parser_rx,
            join,
        }
    }
}

async fn wait_for_ack(rx: &mut mpsc::Receiver<ControllerToParser>, expected_ack_id: &str) -> bool {
    while let Some(message) = rx.recv().await {
        match message {
            ControllerToParser::Ack { ack_id } if ack_id == expected_ack_id => return true,
            ControllerToParser::Abort => return false,
            _ => continue,
        }
    }
    false
}

async fn throttle_for_memory(
    sampler: &Arc<dyn MemorySampler>,
    config: &ReverieConfig,
    tx: &mpsc::Sender<ParserToController>,
) {
    let Some(usage) = sampler.usage_ratio() else { return };
    if usage <= config.memory_high_water_mark {
        return;
    }
    let _ = tx
        .send(ParserToController::MemoryWarning { usage_ratio: usage })
        .await;
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        match sampler.usage_ratio() {
            Some(u) if u <= config.memory_low_water_mark => break,
            None => break,
            _ => continue,
        }
    }
    let _ = tx.send(ParserToController::MemoryResumed).await;
}

#[allow(clippy::too_many_arguments)]
async fn run_parser(
    input: ParserInput,
    existing_keys: HashSet<(i64, String, String)>,
    existing_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    bucket_type: BucketType,
    memory_sampler: Arc<dyn MemorySampler>,
    config: ReverieConfig,
    mut to_parser_rx: mpsc::Receiver<ControllerToParser>,
    from_parser_tx: mpsc::Sender<ParserToController>,
) {
    let members: Vec<ArchiveMember> = match &input {
        ParserInput::Json(bytes) => vec![ArchiveMember {
            name: "history.json".to_string(),
            json_bytes: bytes.clone(),
        }],
        ParserInput::Archive(bytes) => match unpack_archive(bytes) {
            Ok(members) => members,
            Err(err) => {
                let _ = from_parser_tx.send(ParserToController::Error(err)).await;
                return;
            }
        },
    };

    let total_files = members.len();
    let mut all_streams: Vec<Stream> = Vec::new();
    let mut total_exact_duplicates = 0usize;
    let mut total_unique_new = 0usize;

    for (file_index, member) in members.into_iter().enumerate() {
        let _ = from_parser_tx
            .send(ParserToController::Progress(format!(
                "parsing {} ({}/{})",
                member.name,
                file_index + 1,
                total_files
            )))
            .await;

        throttle_for_memory(&memory_sampler, &config, &from_parser_tx).await;

        let raw = match decode_raw_records(&member.json_bytes) {
            Ok(raw) => raw,
            Err(err) => {
                let _ = from_parser_tx
                    .send(ParserToController::Error(format!("{}: {err}", member.name)))
                    .await;
                continue;
            }
        };

        let result = normalize_batch(raw, &existing_keys);
        total_exact_duplicates += result.exact_duplicates;
        total_unique_new += result.unique_new;

        let ack_id = Uuid::new_v4().to_string();
        let batch_len = result.streams.len();
        all_streams.extend(result.streams.clone());

        let sent = from_parser_tx
            .send(ParserToController::Partial {
                batch: result.streams,
                file_index,
                total_files,
                stream_count: batch_len,
                ack_id: ack_id.clone(),
            })
            .await;
        if sent.is_err() {
            return;
        }

        // Backpressure: at most one outstanding unacknowledged partial.
        if !wait_for_ack(&mut to_parser_rx, &ack_id).await {
            return;
        }
    }

    if let Some((existing_start, existing_end)) = existing_range {
        if let (Some(new_min), Some(new_max)) = (
            all_streams.iter().map(|s| s.timestamp).min(),
            all_streams.iter().map(|s| s.timestamp).max(),
        ) {
            let overlap_start = new_min.max(existing_start);
            let overlap_end = new_max.min(existing_end);
            if overlap_start <= overlap_end {
                let overlap_days = (overlap_end - overlap_start).num_days();
                let _ = from_parser_tx
                    .send(ParserToController::OverlapDetected {
                        overlap_days,
                        exact_duplicates: total_exact_duplicates,
                        unique_new: total_unique_new,
                    })
                    .await;

                // Wait for the controller's merge/replace/keep decision before committing.
                match to_parser_rx.recv().await {
                    Some(ControllerToParser::ResolveOverlap {
                        resolution: OverlapResolution::Keep,
                    }) => {
                        all_streams.clear();
                    }
                    Some(ControllerToParser::Abort) | None => return,
                    _ => {} // Merge and Replace both proceed with streams collected so far.
                }
            }
        }
    }

    all_streams.sort_by_key(|s| s.timestamp);
    let chunks = chunkify(&all_streams, bucket_type);
    let _ = from_parser_tx
        .send(ParserToController::Complete {
            streams: all_streams,
            chunks,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReverieConfig;

    fn sample_json(ts: &str, track: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!([{
            "ts": ts, "track": track, "artist": "A", "album": null,
            "ms_played": 180000, "track_duration_ms": 200000,
            "source_platform": "android", "shuffle": false, "skipped": false,
            "offline": false, "start_reason": null, "end_reason": null
        }]))
        .unwrap()
    }

    #[tokio::test]
    async fn single_record_produces_one_stream() {
        let input = ParserInput::Json(sample_json("2026-02-01T13:12:57.841Z", "T"));
        let mut handle = StreamParser::spawn(
            input,
            HashSet::new(),
            None,
            BucketType::Weekly,
            Arc::new(NullMemorySampler),
            ReverieConfig::default(),
        );

        let mut final_streams = None;
        while let Some(msg) = handle.from_parser.recv().await {
            match msg {
                ParserToController::Partial { ack_id, .. } => {
                    handle.to_parser.send(ControllerToParser::Ack { ack_id }).await.unwrap();
                }
                ParserToController::Complete { streams, .. } => {
                    final_streams = Some(streams);
                    break;
                }
                ParserToController::Error(e) => panic!("unexpected error: {e}"),
                _ => {}
            }
        }
        let streams = final_streams.expect("complete message");
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].artist_name.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn archive_with_two_members_fans_out_partials() {
        let member_a = sample_json("2026-02-01T13:12:57Z", "T1");
        let member_b = sample_json("2026-02-08T13:12:57Z", "T2");
        let archive = pack_archive(&[("a.json", &member_a), ("b.json", &member_b)]);

        let mut handle = StreamParser::spawn(
            ParserInput::Archive(archive),
            HashSet::new(),
            None,
            BucketType::Weekly,
            Arc::new(NullMemorySampler),
            ReverieConfig::default(),
        );

        let mut partial_count = 0;
        let mut total_files_seen = 0;
        loop {
            match handle.from_parser.recv().await.unwrap() {
                ParserToController::Partial {
                    ack_id, total_files, ..
                } => {
                    partial_count += 1;
                    total_files_seen = total_files;
                    handle.to_parser.send(ControllerToParser::Ack { ack_id }).await.unwrap();
                }
                ParserToController::Complete { streams, .. } => {
                    assert_eq!(streams.len(), 2);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(partial_count, 2);
        assert_eq!(total_files_seen, 2);
    }

    #[tokio::test]
    async fn malformed_archive_signature_is_fatal() {
        let mut handle = StreamParser::spawn(
            ParserInput::Archive(b"NOTANARCHIVE".to_vec()),
            HashSet::new(),
            None,
            BucketType::Weekly,
            Arc::new(NullMemorySampler),
            ReverieConfig::default(),
        );
        match handle.from_parser.recv().await.unwrap() {
            ParserToController::Error(msg) => assert!(msg.contains("signature")),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlap_detection_reports_stats_and_keep_clears_batch() {
        let existing_start: DateTime<Utc> = "2026-01-25T00:00:00Z".parse().unwrap();
        let existing_end: DateTime<Utc> = "2026-02-10T00:00:00Z".parse().unwrap();
        let input = ParserInput::Json(sample_json("2026-02-01T13:12:57Z", "T"));

        let mut handle = StreamParser::spawn(
            input,
            HashSet::new(),
            Some((existing_start, existing_end)),
            BucketType::Weekly,
            Arc::new(NullMemorySampler),
            ReverieConfig::default(),
        );

        loop {
            match handle.from_parser.recv().await.unwrap() {
                ParserToController::Partial { ack_id, .. } => {
                    handle.to_parser.send(ControllerToParser::Ack { ack_id }).await.unwrap();
                }
                ParserToController::OverlapDetected { unique_new, .. } => {
                    assert_eq!(unique_new, 1);
                    handle
                        .to_parser
                        .send(ControllerToParser::ResolveOverlap {
                            resolution: OverlapResolution::Keep,
                        })
                        .await
                        .unwrap();
                }
                ParserToController::Complete { streams, .. } => {
                    assert!(streams.is_empty());
                    break;
                }
                _ => {}
            }
        }
    }
}
