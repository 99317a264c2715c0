//! Block selection predicates for finds

use crate::{BlockMeta, CompactedBlockMeta};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Whether a block may hold `id` and falls inside the requested block ID
/// range and time window
///
/// The block ID range is inclusive on both ends. The time window only
/// applies when both `time_start` and `time_end` are nonzero.
pub fn include_block(
    meta: &BlockMeta,
    id: &[u8],
    block_start: Uuid,
    block_end: Uuid,
    time_start: i64,
    time_end: i64,
) -> bool {
    if !meta.contains_id(id) {
        return false;
    }

    let block_id = meta.block_id.as_bytes();
    if block_id < block_start.as_bytes() || block_id > block_end.as_bytes() {
        return false;
    }

    if time_start != 0 && time_end != 0 {
        let range = meta.time_range();
        if range.start > time_end || range.end < time_start {
            return false;
        }
    }

    true
}

/// Like [`include_block`] for a retired block, which stays searchable while
/// it was compacted less than `poll_interval * freshness_polls` ago
///
/// Past that window every reader's blocklist is assumed to contain the
/// compaction output instead.
#[allow(clippy::too_many_arguments)]
pub fn include_compacted_block(
    compacted: &CompactedBlockMeta,
    id: &[u8],
    block_start: Uuid,
    block_end: Uuid,
    poll_interval: Duration,
    freshness_polls: u32,
    time_start: i64,
    time_end: i64,
    now: DateTime<Utc>,
) -> bool {
    let window = poll_interval.saturating_mul(freshness_polls);
    let age = now.signed_duration_since(compacted.compacted_time);
    if age.to_std().map_or(false, |age| age >= window) {
        return false;
    }

    include_block(&compacted.meta, id, block_start, block_end, time_start, time_end)
}
