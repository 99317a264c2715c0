//! Compaction and retention
//!
//! Compaction merges small blocks of one level and time window into larger
//! blocks of the next level. A compaction either fully happens or leaves
//! the backend as it found it:
//!
//! 1. Merge inputs by ID and write output `data` and blooms
//! 2. Re-check ownership of the job
//! 3. Write output metas
//! 4. Mark inputs compacted, rolling back marks on failure
//!
//! Any failure deletes the partial outputs and leaves the inputs active.

mod retention;
mod selector;

pub use selector::{job_hash, select_jobs, CompactionJob};

use crate::backend::BackendCompactor;
use crate::block::{BackendBlock, BlockBuilder, BlockIterator};
use crate::db::Db;
use crate::model::object_decoder;
use crate::util::{duration_format, SingleFlight};
use crate::{BlockMeta, Result, SpanError, TimeRange};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Compactor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactorConfig {
    /// Output blocks are cut once their data reaches this size
    pub chunk_size_bytes: u64,
    /// Width of the time window blocks are grouped by
    #[serde(with = "duration_format")]
    pub max_compaction_range: Duration,
    pub min_input_blocks: usize,
    pub max_input_blocks: usize,
    /// Active blocks older than this are retired, zero disables
    #[serde(with = "duration_format")]
    pub block_retention: Duration,
    /// Retired blocks older than this are deleted
    #[serde(with = "duration_format")]
    pub compacted_block_retention: Duration,
    #[serde(with = "duration_format")]
    pub compaction_cycle: Duration,
    pub retention_concurrency: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: crate::config::CHUNK_SIZE_BYTES,
            max_compaction_range: crate::config::MAX_COMPACTION_RANGE,
            min_input_blocks: 2,
            max_input_blocks: 8,
            block_retention: Duration::from_secs(14 * 24 * 3600),
            compacted_block_retention: Duration::from_secs(3600),
            compaction_cycle: Duration::from_secs(30),
            retention_concurrency: 10,
        }
    }
}

/// Decides which compactor instance runs a job
pub trait CompactorSharder: Send + Sync {
    fn owns(&self, job_hash: &str) -> bool;
}

/// Single-instance sharder
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnAll;

impl CompactorSharder for OwnAll {
    fn owns(&self, _job_hash: &str) -> bool {
        true
    }
}

/// Per-tenant settings
pub trait CompactorOverrides: Send + Sync {
    /// Block retention for a tenant, zero to use the configured default
    fn block_retention(&self, tenant_id: &str) -> Duration;
}

/// No per-tenant settings
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverrides;

impl CompactorOverrides for NoOverrides {
    fn block_retention(&self, _tenant_id: &str) -> Duration {
        Duration::ZERO
    }
}

/// Runs compaction and retention against a [`Db`]
pub struct Compactor {
    config: CompactorConfig,
    db: Arc<Db>,
    sharder: Arc<dyn CompactorSharder>,
    overrides: Arc<dyn CompactorOverrides>,
    cycle: SingleFlight,
}

impl Compactor {
    pub fn new(
        config: CompactorConfig,
        db: Arc<Db>,
        sharder: Arc<dyn CompactorSharder>,
        overrides: Arc<dyn CompactorOverrides>,
    ) -> Self {
        Self {
            config,
            db,
            sharder,
            overrides,
            cycle: SingleFlight::new(),
        }
    }

    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// Compact and apply retention every `compaction_cycle` until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.compaction_cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.do_compaction(&shutdown).await {
                        error!(error = %e, "compaction cycle failed");
                    }
                    if let Err(e) = self.do_retention().await {
                        error!(error = %e, "retention cycle failed");
                    }
                }
            }
        }
        info!("compactor stopped");
    }

    /// Run every owned compaction job once, returning the jobs completed
    ///
    /// Does nothing when a cycle is already running.
    pub async fn do_compaction(&self, cancel: &CancellationToken) -> Result<usize> {
        let Some(_flight) = self.cycle.try_start() else {
            debug!("compaction cycle already running");
            return Ok(0);
        };

        let mut completed = 0;
        for tenant in self.db.blocklist().tenants() {
            let metas = self.db.blocklist().metas(&tenant);
            for job in select_jobs(&tenant, &metas, &self.config) {
                if cancel.is_cancelled() {
                    return Err(SpanError::Cancelled);
                }
                if !self.sharder.owns(&job.hash) {
                    continue;
                }
                match self.compact(&job.blocks, &tenant, cancel).await {
                    Ok(_) => completed += 1,
                    Err(SpanError::Cancelled) => return Err(SpanError::Cancelled),
                    Err(e) => warn!(tenant = %tenant, job = %job.hash, error = %e, "compaction failed"),
                }
            }
        }
        Ok(completed)
    }

    /// Merge `inputs` into new blocks one level up
    ///
    /// Returns the committed output metas. On error the backend holds no
    /// outputs and every input is still active.
    pub async fn compact(
        &self,
        inputs: &[BlockMeta],
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<BlockMeta>> {
        if inputs.len() < 2 {
            return Err(SpanError::Validation(format!(
                "compaction needs at least 2 blocks, got {}",
                inputs.len()
            )));
        }
        let level = inputs.iter().map(|m| m.compaction_level).max().unwrap_or(0) + 1;
        let level_label = level.to_string();
        let timer = Instant::now();
        let metrics = self.db.metrics().clone();

        let mut written = Vec::new();
        let result = self.compact_inner(inputs, tenant_id, level, cancel, &mut written).await;

        metrics
            .compaction_duration
            .with_label_values(&[&level_label])
            .observe(timer.elapsed().as_secs_f64());

        match result {
            Ok(outputs) => {
                metrics.compactions.with_label_values(&["success"]).inc();
                let objects: u64 = outputs.iter().map(|m| m.total_objects).sum();
                metrics.compacted_objects.with_label_values(&[&level_label]).inc_by(objects);
                info!(
                    tenant = %tenant_id,
                    inputs = inputs.len(),
                    outputs = outputs.len(),
                    objects,
                    level,
                    "compaction complete"
                );
                Ok(outputs)
            }
            Err(e) => {
                metrics.compactions.with_label_values(&["failed"]).inc();
                self.delete_outputs(&written, tenant_id).await;
                Err(e)
            }
        }
    }

    async fn compact_inner(
        &self,
        inputs: &[BlockMeta],
        tenant_id: &str,
        level: u8,
        cancel: &CancellationToken,
        written: &mut Vec<Uuid>,
    ) -> Result<Vec<BlockMeta>> {
        let data_encoding = inputs[0].data_encoding.clone();
        if let Some(other) = inputs.iter().find(|m| m.data_encoding != data_encoding) {
            return Err(SpanError::Validation(format!(
                "cannot compact data encodings {} and {}",
                data_encoding, other.data_encoding
            )));
        }
        let decoder = object_decoder(&data_encoding)?;
        let job = job_hash(tenant_id, inputs, self.config.max_compaction_range.as_secs() as i64);

        let mut iters = Vec::with_capacity(inputs.len());
        for meta in inputs {
            let block = BackendBlock::new(meta.clone(), self.db.reader().clone(), self.db.metrics().clone());
            iters.push(block.iterator(cancel).await?);
        }
        let mut merger = Merger::new(iters).await?;

        let block_config = &self.db.config().block;
        let estimated = inputs.iter().map(|m| m.total_objects as usize).sum();
        let mut outputs: Vec<BlockMeta> = Vec::new();
        let mut builder: Option<BlockBuilder> = None;

        while let Some((id, parts)) = merger.next().await? {
            if cancel.is_cancelled() {
                return Err(SpanError::Cancelled);
            }

            let ranges: Vec<TimeRange> = parts.iter().map(|(src, _)| inputs[*src].time_range()).collect();
            let object = if parts.len() == 1 {
                parts.into_iter().map(|(_, obj)| obj).next().unwrap_or_default()
            } else {
                let objs: Vec<&[u8]> = parts.iter().map(|(_, obj)| obj.as_slice()).collect();
                decoder.combine(&objs)?
            };
            let (start, end) = match decoder.fast_range(&object) {
                Ok((start, end)) => (start as i64, end as i64),
                Err(_) => (
                    ranges.iter().map(|r| r.start).min().unwrap_or(0),
                    ranges.iter().map(|r| r.end).max().unwrap_or(0),
                ),
            };

            let current = builder.get_or_insert_with(|| {
                let mut template = BlockMeta::new(
                    tenant_id,
                    Uuid::new_v4(),
                    block_config.version,
                    block_config.encoding,
                    data_encoding.clone(),
                );
                template.compaction_level = level;
                written.push(template.block_id);
                BlockBuilder::new(block_config, template, estimated)
            });
            current.add_with_range(&id, object, start, end)?;

            if current.data_length() >= self.config.chunk_size_bytes {
                if let Some(full) = builder.take() {
                    outputs.push(full.finish(self.db.writer().as_ref()).await?);
                }
            }
        }
        if let Some(last) = builder.take() {
            outputs.push(last.finish(self.db.writer().as_ref()).await?);
        }

        if !self.sharder.owns(&job) {
            return Err(SpanError::Compaction(format!("lost ownership of job {}", job)));
        }
        if cancel.is_cancelled() {
            return Err(SpanError::Cancelled);
        }

        for meta in &outputs {
            self.db.writer().write_block_meta(meta).await?;
        }
        self.mark_inputs_compacted(inputs, tenant_id).await?;

        let now = Utc::now();
        let input_ids: Vec<Uuid> = inputs.iter().map(|m| m.block_id).collect();
        let retired = inputs.iter().map(|m| m.clone().into_compacted(now)).collect();
        self.db
            .blocklist()
            .update(tenant_id, outputs.clone(), &input_ids, retired);
        Ok(outputs)
    }

    async fn mark_inputs_compacted(&self, inputs: &[BlockMeta], tenant_id: &str) -> Result<()> {
        let backend = self.db.compactor();
        for (i, meta) in inputs.iter().enumerate() {
            if let Err(e) = backend.mark_block_compacted(meta.block_id, tenant_id).await {
                for marked in &inputs[..i] {
                    if let Err(rollback) = backend.clear_compacted(marked.block_id, tenant_id).await {
                        error!(
                            block_id = %marked.block_id,
                            error = %rollback,
                            "failed to roll back compacted mark"
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn delete_outputs(&self, written: &[Uuid], tenant_id: &str) {
        for block_id in written {
            if let Err(e) = self.db.compactor().clear_block(*block_id, tenant_id).await {
                error!(block_id = %block_id, error = %e, "failed to delete partial compaction output");
            }
        }
    }
}

/// K-way merge of block iterators by ID
struct Merger {
    iters: Vec<BlockIterator>,
    heads: Vec<Option<Vec<u8>>>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
}

impl Merger {
    async fn new(mut iters: Vec<BlockIterator>) -> Result<Self> {
        let mut heads = Vec::with_capacity(iters.len());
        let mut heap = BinaryHeap::new();
        for (i, iter) in iters.iter_mut().enumerate() {
            match iter.next().await? {
                Some((id, obj)) => {
                    heap.push(Reverse((id, i)));
                    heads.push(Some(obj));
                }
                None => heads.push(None),
            }
        }
        Ok(Self { iters, heads, heap })
    }

    /// Next ID with its object from every source holding it
    async fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<(usize, Vec<u8>)>)>> {
        let Some(Reverse((id, src))) = self.heap.pop() else {
            return Ok(None);
        };
        let mut parts = vec![(src, self.advance(src).await?)];

        while let Some(Reverse((next_id, _))) = self.heap.peek() {
            if *next_id != id {
                break;
            }
            if let Some(Reverse((_, other))) = self.heap.pop() {
                parts.push((other, self.advance(other).await?));
            }
        }
        Ok(Some((id, parts)))
    }

    /// Take the buffered object of `src` and queue its next ID
    async fn advance(&mut self, src: usize) -> Result<Vec<u8>> {
        let obj = self.heads[src].take().unwrap_or_default();
        if let Some((id, next)) = self.iters[src].next().await? {
            self.heap.push(Reverse((id, src)));
            self.heads[src] = Some(next);
        }
        Ok(obj)
    }
}
