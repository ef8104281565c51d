//! Sort-merge, deduplication, enrichment, and chunkification of raw play records.

use crate::model::{BucketType, Chunk, PlayType, Stream};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};

/// A raw record as decoded off the wire, before enrichment. Track duration is optional:
/// when absent, completion ratio is left unset rather than guessed.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub timestamp: DateTime<Utc>,
    pub track_name: String,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub ms_played: u64,
    pub track_duration_ms: Option<u64>,
    pub source_platform: Option<String>,
    pub shuffle: bool,
    pub skipped: bool,
    pub offline: bool,
    pub start_reason: Option<String>,
    pub end_reason: Option<String>,
}

/// Outcome of normalizing one batch against streams already committed to storage.
pub struct NormalizeResult {
    pub streams: Vec<Stream>,
    pub exact_duplicates: usize,
    pub unique_new: usize,
}

fn completion_ratio(ms_played: u64, duration_ms: Option<u64>) -> Option<f64> {
    let duration = duration_ms?;
    if duration == 0 {
        return None;
    }
    Some((ms_played as f64 / duration as f64).clamp(0.0, 1.0))
}

fn play_type(ms_played: u64, skipped: bool, ratio: Option<f64>) -> PlayType {
    if skipped {
        return PlayType::Skip;
    }
    match ratio {
        Some(r) if r >= 0.95 => PlayType::Full,
        Some(_) => PlayType::Partial,
        None if ms_played == 0 => PlayType::Skip,
        None => PlayType::Partial,
    }
}

fn enrich(raw: RawRecord) -> Stream {
    let ratio = completion_ratio(raw.ms_played, raw.track_duration_ms);
    let play_type = play_type(raw.ms_played, raw.skipped, ratio);
    Stream {
        timestamp: raw.timestamp,
        track_name: raw.track_name,
        artist_name: raw.artist_name,
        album_name: raw.album_name,
        ms_played: raw.ms_played,
        completion_ratio: ratio,
        play_type,
        source_platform: raw.source_platform,
        shuffle: raw.shuffle,
        skipped: raw.skipped,
        offline: raw.offline,
        start_reason: raw.start_reason,
        end_reason: raw.end_reason,
    }
}

/// Sort-merges raw records by timestamp, deduplicates against `existing`, and enriches
/// the survivors. `existing` supplies only dedup keys, not full streams, so batches can
/// be normalized without holding the whole prior stream set in memory.
pub fn normalize_batch(mut raw: Vec<RawRecord>, existing_keys: &HashSet<(i64, String, String)>) -> NormalizeResult {
    raw.sort_by_key(|r| r.timestamp);

    let mut seen_in_batch = HashSet::new();
    let mut streams = Vec::with_capacity(raw.len());
    let mut exact_duplicates = 0usize;

    for record in raw {
        let enriched = enrich(record);
        let key = enriched.dedup_key();
        if existing_keys.contains(&key) || !seen_in_batch.insert(key) {
            exact_duplicates += 1;
            continue;
        }
        streams.push(enriched);
    }

    let unique_new = streams.len();
    NormalizeResult {
        streams,
        exact_duplicates,
        unique_new,
    }
}

fn bucket_start(timestamp: DateTime<Utc>, bucket_type: BucketType) -> DateTime<Utc> {
    match bucket_type {
        BucketType::Daily => Utc
            .with_ymd_and_hms(timestamp.year(), timestamp.month(), timestamp.day(), 0, 0, 0)
            .single()
            .unwrap_or(timestamp),
        BucketType::Weekly => {
            let day_start = Utc
                .with_ymd_and_hms(timestamp.year(), timestamp.month(), timestamp.day(), 0, 0, 0)
                .single()
                .unwrap_or(timestamp);
            let weekday_from_monday = timestamp.weekday().num_days_from_monday() as i64;
            day_start - ChronoDuration::days(weekday_from_monday)
        }
        BucketType::Monthly => Utc
            .with_ymd_and_hms(timestamp.year(), timestamp.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(timestamp),
    }
}

fn bucket_id(start: DateTime<Utc>, bucket_type: BucketType) -> String {
    match bucket_type {
        BucketType::Daily => start.format("day-%Y-%m-%d").to_string(),
        BucketType::Weekly => start.format("week-%Y-%m-%d").to_string(),
        BucketType::Monthly => start.format("month-%Y-%m").to_string(),
    }
}

/// Partitions streams into non-overlapping, non-empty buckets. Artist names that are
/// null/blank are tolerated in streams but excluded from the unique-artist count.
pub fn chunkify(streams: &[Stream], bucket_type: BucketType) -> Vec<Chunk> {
    let mut buckets: HashMap<String, (DateTime<Utc>, Vec<&Stream>)> = HashMap::new();

    for stream in streams {
        let start = bucket_start(stream.timestamp, bucket_type);
        let id = bucket_id(start, bucket_type);
        buckets.entry(id).or_insert_with(|| (start, Vec::new())).1.push(stream);
    }

    let mut chunks: Vec<Chunk> = buckets
        .into_iter()
        .map(|(bucket_id, (start, members))| {
            let unique_artists: HashSet<&str> = members
                .iter()
                .filter_map(|s| s.artist_name.as_deref())
                .filter(|a| !a.trim().is_empty())
                .collect();
            let unique_tracks: HashSet<&str> = members.iter().map(|s| s.track_name.as_str()).collect();
            Chunk {
                bucket_id,
                bucket_type,
                start_date: start,
                stream_count: members.len(),
                unique_artists: unique_artists.len(),
                unique_tracks: unique_tracks.len(),
            }
        })
        .collect();

    chunks.sort_by_key(|c| c.start_date);
    chunks
}
