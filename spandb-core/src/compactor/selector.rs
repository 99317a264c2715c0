//! Picks which blocks to compact together

use super::CompactorConfig;
use crate::BlockMeta;
use std::collections::BTreeMap;

/// A set of blocks compacted together
#[derive(Debug, Clone)]
pub struct CompactionJob {
    /// Stable key used for ownership checks
    pub hash: String,
    pub blocks: Vec<BlockMeta>,
}

/// Key a set of inputs hashes to: tenant, lowest level and time window of
/// the oldest block
pub fn job_hash(tenant_id: &str, blocks: &[BlockMeta], window: i64) -> String {
    let level = blocks.iter().map(|b| b.compaction_level).min().unwrap_or(0);
    let window_start = blocks
        .iter()
        .map(|b| b.end_time.timestamp())
        .min()
        .map_or(0, |end| end.div_euclid(window.max(1)));
    format!("{}-{}-{}", tenant_id, level, window_start)
}

/// Group a tenant's active blocks into compaction jobs
///
/// Blocks are grouped by compaction level and by the time window of width
/// `max_compaction_range` their end time falls in. Within a group the
/// oldest blocks are taken first, up to `max_input_blocks` and
/// `chunk_size_bytes` in total. Groups smaller than `min_input_blocks` are
/// left alone.
pub fn select_jobs(tenant_id: &str, metas: &[BlockMeta], config: &CompactorConfig) -> Vec<CompactionJob> {
    let window = config.max_compaction_range.as_secs().max(1) as i64;

    let mut groups: BTreeMap<(i64, u8), Vec<&BlockMeta>> = BTreeMap::new();
    for meta in metas {
        let key = (meta.end_time.timestamp().div_euclid(window), meta.compaction_level);
        groups.entry(key).or_default().push(meta);
    }

    let mut jobs = Vec::new();
    for (_, mut group) in groups {
        if group.len() < config.min_input_blocks {
            continue;
        }
        group.sort_by_key(|m| m.start_time);

        let mut selected = Vec::new();
        let mut total_size = 0u64;
        for meta in group {
            if selected.len() >= config.max_input_blocks {
                break;
            }
            if total_size + meta.size > config.chunk_size_bytes && !selected.is_empty() {
                break;
            }
            total_size += meta.size;
            selected.push(meta.clone());
        }

        if selected.len() >= config.min_input_blocks.max(2) {
            jobs.push(CompactionJob {
                hash: job_hash(tenant_id, &selected, window),
                blocks: selected,
            });
        }
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{unix_to_time, BlockVersion, Encoding};
    use std::time::Duration;
    use uuid::Uuid;

    fn meta(start: i64, end: i64, level: u8, size: u64) -> BlockMeta {
        let mut meta = BlockMeta::new("t", Uuid::new_v4(), BlockVersion::V2, Encoding::None, "v1");
        meta.start_time = unix_to_time(start);
        meta.end_time = unix_to_time(end);
        meta.compaction_level = level;
        meta.size = size;
        meta.total_objects = 1;
        meta
    }

    fn config() -> CompactorConfig {
        CompactorConfig {
            chunk_size_bytes: 1000,
            max_compaction_range: Duration::from_secs(3600),
            min_input_blocks: 2,
            max_input_blocks: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_groups_by_window_and_level() {
        let metas = vec![
            meta(0, 100, 0, 10),
            meta(50, 200, 0, 10),
            meta(60, 300, 1, 10),
            meta(3600, 3700, 0, 10),
        ];
        let jobs = select_jobs("t", &metas, &config());
        assert_eq!(jobs.len(), 1);
        let ids: Vec<Uuid> = jobs[0].blocks.iter().map(|m| m.block_id).collect();
        assert_eq!(ids, vec![metas[0].block_id, metas[1].block_id]);
        assert_eq!(jobs[0].hash, "t-0-0");
    }

    #[test]
    fn test_oldest_first_within_limits() {
        let metas = vec![
            meta(40, 100, 0, 10),
            meta(10, 100, 0, 10),
            meta(30, 100, 0, 10),
            meta(20, 100, 0, 10),
        ];
        let jobs = select_jobs("t", &metas, &config());
        let starts: Vec<i64> = jobs[0].blocks.iter().map(|m| m.start_time.timestamp()).collect();
        assert_eq!(starts, vec![10, 20, 30]);

        // size cap
        let metas = vec![meta(10, 100, 0, 600), meta(20, 100, 0, 600), meta(30, 100, 0, 100)];
        assert!(select_jobs("t", &metas, &config()).is_empty());
    }
}
