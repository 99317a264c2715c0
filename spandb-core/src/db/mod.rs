//! Reader/writer facade over a backend
//!
//! `Db` owns the WAL directory, the blocklist and the backend handles. It
//! turns completing blocks into complete blocks and answers finds by ID
//! across every block of a tenant.

use crate::backend::{BackendCompactor, BackendReader, BackendWriter};
use crate::block::{BackendBlock, BlockBuilder, BlockConfig, CacheControl, CompletingBlock};
use crate::blocklist::{include_block, include_compacted_block, Blocklist, Poller};
use crate::metrics::Metrics;
use crate::model::ObjectDecoder;
use crate::util::{duration_format, SingleFlight};
use crate::wal::{Wal, WalConfig};
use crate::{parse_block_id, BlockMeta, Result, SpanError};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Find fan-out settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Blocks searched at once by one find
    pub concurrency: usize,
    /// Failed blocks tolerated by a find, as a fraction of candidates
    pub max_failed_blocks_fraction: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            max_failed_blocks_fraction: 0.5,
        }
    }
}

/// Db configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub wal: WalConfig,
    pub block: BlockConfig,
    #[serde(with = "duration_format")]
    pub blocklist_poll: Duration,
    pub blocklist_poll_concurrency: usize,
    /// Poll intervals a compacted block stays searchable
    pub compacted_freshness_polls: u32,
    pub search: SearchConfig,
    pub cache_control: CacheControl,
    /// Only blocks younger than this read blooms through the cache, zero for any age
    #[serde(with = "duration_format")]
    pub cache_max_block_age: Duration,
    /// Only blocks at this compaction level or above read blooms through the cache
    pub cache_min_compaction_level: u8,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            wal: WalConfig::default(),
            block: BlockConfig::default(),
            blocklist_poll: crate::config::BLOCKLIST_POLL,
            blocklist_poll_concurrency: 50,
            compacted_freshness_polls: crate::config::COMPACTED_BLOCK_FRESHNESS_POLLS,
            search: SearchConfig::default(),
            cache_control: CacheControl::default(),
            cache_max_block_age: Duration::ZERO,
            cache_min_compaction_level: 0,
        }
    }
}

/// Partial objects found for one ID
#[derive(Debug, Default)]
pub struct FindResult {
    /// One object per block that held the ID
    pub objects: Vec<Vec<u8>>,
    /// Blocks that failed, within the tolerated fraction
    pub failed_blocks: Vec<Uuid>,
}

impl FindResult {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Merge the partial objects into one
    pub fn combine(&self, decoder: &dyn ObjectDecoder) -> Result<Option<Vec<u8>>> {
        if self.objects.is_empty() {
            return Ok(None);
        }
        let parts: Vec<&[u8]> = self.objects.iter().map(Vec::as_slice).collect();
        decoder.combine(&parts).map(Some)
    }
}

/// Storage facade
pub struct Db {
    config: DbConfig,
    wal: Wal,
    reader: Arc<dyn BackendReader>,
    writer: Arc<dyn BackendWriter>,
    compactor: Arc<dyn BackendCompactor>,
    blocklist: Arc<Blocklist>,
    poller: Poller,
    polling: SingleFlight,
    metrics: Arc<Metrics>,
}

impl Db {
    /// Create a Db. The blocklist is empty until the first poll
    pub fn new(
        config: DbConfig,
        reader: Arc<dyn BackendReader>,
        writer: Arc<dyn BackendWriter>,
        compactor: Arc<dyn BackendCompactor>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.search.max_failed_blocks_fraction) {
            return Err(SpanError::Config(format!(
                "max_failed_blocks_fraction must be within [0, 1], got {}",
                config.search.max_failed_blocks_fraction
            )));
        }

        let wal = Wal::new(config.wal.clone())?;
        let poller = Poller::new(
            reader.clone(),
            compactor.clone(),
            config.blocklist_poll_concurrency,
            metrics.clone(),
        );

        Ok(Self {
            config,
            wal,
            reader,
            writer,
            compactor,
            blocklist: Arc::new(Blocklist::new()),
            poller,
            polling: SingleFlight::new(),
            metrics,
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub fn reader(&self) -> &Arc<dyn BackendReader> {
        &self.reader
    }

    pub fn writer(&self) -> &Arc<dyn BackendWriter> {
        &self.writer
    }

    pub fn compactor(&self) -> &Arc<dyn BackendCompactor> {
        &self.compactor
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Build a complete block in this Db's backend
    pub async fn complete_block(&self, completing: &CompletingBlock) -> Result<BackendBlock> {
        self.complete_block_with_backend(completing, self.reader.clone(), self.writer.as_ref())
            .await
    }

    /// Build a complete block from a completing block's objects
    ///
    /// Data and blooms are written first and the meta last, so a failure
    /// leaves nothing that a poll would pick up.
    pub async fn complete_block_with_backend(
        &self,
        completing: &CompletingBlock,
        reader: Arc<dyn BackendReader>,
        writer: &dyn BackendWriter,
    ) -> Result<BackendBlock> {
        let objects = completing.objects()?;
        if objects.is_empty() {
            return Err(SpanError::Validation(format!(
                "block {} has no objects to complete",
                completing.block_id()
            )));
        }

        let mut builder = BlockBuilder::new(&self.config.block, completing.meta().clone(), objects.len());
        for (id, object) in objects {
            builder.add(&id, object)?;
        }
        let meta = builder.finish(writer).await?;
        writer.write_block_meta(&meta).await?;

        info!(
            block_id = %meta.block_id,
            tenant = %meta.tenant_id,
            objects = meta.total_objects,
            size = meta.size,
            "completed block"
        );
        Ok(self.backend_block(meta, reader, Utc::now()))
    }

    fn backend_block(&self, meta: BlockMeta, reader: Arc<dyn BackendReader>, now: DateTime<Utc>) -> BackendBlock {
        let cache_bloom = self.should_cache(&meta, now);
        BackendBlock::new(meta, reader, self.metrics.clone())
            .with_cache_control(self.config.cache_control)
            .with_cached_bloom(cache_bloom)
    }

    /// Whether bloom reads for a block go through the cache
    pub fn should_cache(&self, meta: &BlockMeta, now: DateTime<Utc>) -> bool {
        let max_age = self.config.cache_max_block_age;
        let young = max_age.is_zero()
            || now
                .signed_duration_since(meta.start_time)
                .to_std()
                .map_or(true, |age| age < max_age);

        let min_level = self.config.cache_min_compaction_level;
        let level_ok = min_level == 0 || meta.compaction_level >= min_level;

        young && level_ok
    }

    /// Find every partial object stored under `id` for a tenant
    ///
    /// `block_start` and `block_end` bound the block IDs searched, both
    /// inclusive. The time window applies when both bounds are nonzero.
    #[allow(clippy::too_many_arguments)]
    pub async fn find(
        &self,
        tenant_id: &str,
        id: &[u8],
        block_start: &str,
        block_end: &str,
        time_start: i64,
        time_end: i64,
        cancel: &CancellationToken,
    ) -> Result<FindResult> {
        if id.is_empty() {
            return Err(SpanError::Validation("empty object id".into()));
        }
        let block_start = parse_block_id(block_start)?;
        let block_end = parse_block_id(block_end)?;
        if block_start > block_end {
            return Err(SpanError::Validation(format!(
                "block range start {} is after end {}",
                block_start, block_end
            )));
        }

        let now = Utc::now();
        let snapshot = self.blocklist.snapshot();
        let mut candidates: Vec<BlockMeta> = snapshot
            .metas(tenant_id)
            .iter()
            .filter(|m| include_block(m, id, block_start, block_end, time_start, time_end))
            .cloned()
            .collect();
        candidates.extend(
            snapshot
                .compacted_metas(tenant_id)
                .iter()
                .filter(|c| {
                    include_compacted_block(
                        c,
                        id,
                        block_start,
                        block_end,
                        self.config.blocklist_poll,
                        self.config.compacted_freshness_polls,
                        time_start,
                        time_end,
                        now,
                    )
                })
                .map(|c| c.meta.clone()),
        );

        if candidates.is_empty() {
            return Ok(FindResult::default());
        }

        let total = candidates.len();
        self.metrics.find_blocks_queried.inc_by(total as u64);
        debug!(tenant = %tenant_id, candidates = total, "searching blocks");

        let search = stream::iter(candidates)
            .map(|meta| {
                let block_id = meta.block_id;
                let block = self.backend_block(meta, self.reader.clone(), now);
                async move { (block_id, block.find_by_id(id, cancel).await) }
            })
            .buffer_unordered(self.config.search.concurrency.max(1))
            .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            _ = cancel.cancelled() => return Err(SpanError::Cancelled),
            outcomes = search => outcomes,
        };

        let mut result = FindResult::default();
        for (block_id, outcome) in outcomes {
            match outcome {
                Ok(Some(object)) => result.objects.push(object),
                Ok(None) => {}
                Err(SpanError::Cancelled) => return Err(SpanError::Cancelled),
                Err(e) => {
                    warn!(tenant = %tenant_id, block_id = %block_id, error = %e, "find failed on block");
                    result.failed_blocks.push(block_id);
                }
            }
        }

        let failed = result.failed_blocks.len();
        if failed > 0 {
            self.metrics.find_failed_blocks.inc_by(failed as u64);
            if failed as f64 / total as f64 > self.config.search.max_failed_blocks_fraction {
                return Err(SpanError::PartialFailure {
                    failed_blocks: result.failed_blocks,
                    total,
                });
            }
        }
        Ok(result)
    }

    /// Rebuild the blocklist from the backend
    ///
    /// Returns `false` without polling when a poll is already running.
    pub async fn poll_blocklist(&self) -> Result<bool> {
        let Some(_flight) = self.polling.try_start() else {
            debug!("blocklist poll already running");
            return Ok(false);
        };

        let results = self.poller.do_poll(&self.blocklist.snapshot()).await?;
        self.blocklist.apply_poll_results(results);
        Ok(true)
    }

    /// Poll now and then every `blocklist_poll` until `shutdown` fires
    pub async fn run_polling(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.blocklist_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_blocklist().await {
                        error!(error = %e, "blocklist poll failed");
                    }
                }
            }
        }
        info!("blocklist polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::{BlockVersion, Encoding, BLOCK_ID_MAX, BLOCK_ID_MIN};
    use tempfile::TempDir;

    fn db(dir: &TempDir, config: DbConfig) -> Db {
        let backend = Arc::new(LocalBackend::new(dir.path().join("blocks")).unwrap());
        let config = DbConfig {
            wal: WalConfig {
                dir: dir.path().join("wal"),
                ..Default::default()
            },
            ..config
        };
        Db::new(
            config,
            backend.clone(),
            backend.clone(),
            backend,
            Arc::new(Metrics::unregistered()),
        )
        .unwrap()
    }

    fn meta(level: u8, age: chrono::Duration) -> BlockMeta {
        let mut meta = BlockMeta::new("t", Uuid::new_v4(), BlockVersion::V2, Encoding::None, "v1");
        meta.compaction_level = level;
        meta.start_time = Utc::now() - age;
        meta
    }

    #[test]
    fn test_should_cache() {
        let dir = TempDir::new().unwrap();
        let db = db(
            &dir,
            DbConfig {
                cache_max_block_age: Duration::from_secs(3600),
                cache_min_compaction_level: 1,
                ..Default::default()
            },
        );
        let now = Utc::now();

        assert!(db.should_cache(&meta(1, chrono::Duration::minutes(1)), now));
        assert!(!db.should_cache(&meta(2, chrono::Duration::hours(2)), now));
        assert!(!db.should_cache(&meta(0, chrono::Duration::minutes(1)), now));
    }

    #[test]
    fn test_should_cache_disabled_limits() {
        let dir = TempDir::new().unwrap();
        let db = db(&dir, DbConfig::default());
        assert!(db.should_cache(&meta(0, chrono::Duration::days(30)), Utc::now()));
    }

    #[test]
    fn test_rejects_bad_fraction() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()).unwrap());
        let config = DbConfig {
            wal: WalConfig {
                dir: dir.path().join("wal"),
                ..Default::default()
            },
            search: SearchConfig {
                concurrency: 1,
                max_failed_blocks_fraction: 1.5,
            },
            ..Default::default()
        };
        let result = Db::new(
            config,
            backend.clone(),
            backend.clone(),
            backend,
            Arc::new(Metrics::unregistered()),
        );
        assert!(matches!(result, Err(SpanError::Config(_))));
    }

    #[tokio::test]
    async fn test_find_validation() {
        let dir = TempDir::new().unwrap();
        let db = db(&dir, DbConfig::default());
        let cancel = CancellationToken::new();

        let err = db.find("t", &[], BLOCK_ID_MIN, BLOCK_ID_MAX, 0, 0, &cancel).await.unwrap_err();
        assert!(matches!(err, SpanError::Validation(_)));
        let err = db.find("t", &[1], "nope", BLOCK_ID_MAX, 0, 0, &cancel).await.unwrap_err();
        assert!(matches!(err, SpanError::Validation(_)));
        let err = db.find("t", &[1], BLOCK_ID_MAX, BLOCK_ID_MIN, 0, 0, &cancel).await.unwrap_err();
        assert!(matches!(err, SpanError::Validation(_)));

        let result = db.find("unknown", &[1], BLOCK_ID_MIN, BLOCK_ID_MAX, 0, 0, &cancel).await.unwrap();
        assert!(result.is_empty());
        assert!(result.failed_blocks.is_empty());
    }

    #[tokio::test]
    async fn test_poll_single_flight() {
        let dir = TempDir::new().unwrap();
        let db = db(&dir, DbConfig::default());
        let flight = db.polling.try_start().unwrap();
        assert!(!db.poll_blocklist().await.unwrap());
        drop(flight);
        assert!(db.poll_blocklist().await.unwrap());
    }
}
