//! Rebuilds the blocklist from the backend

use super::BlocklistSnapshot;
use crate::backend::{BackendCompactor, BackendReader};
use crate::metrics::Metrics;
use crate::{BlockMeta, CompactedBlockMeta, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lists produced by one poll
#[derive(Debug, Default)]
pub struct PollResults {
    pub metas: HashMap<String, Vec<BlockMeta>>,
    pub compacted: HashMap<String, Vec<CompactedBlockMeta>>,
}

enum Polled {
    Active(BlockMeta),
    Compacted(CompactedBlockMeta),
    Missing,
}

/// Polls every tenant's block metas
pub struct Poller {
    reader: Arc<dyn BackendReader>,
    compactor: Arc<dyn BackendCompactor>,
    concurrency: usize,
    metrics: Arc<Metrics>,
}

impl Poller {
    pub fn new(
        reader: Arc<dyn BackendReader>,
        compactor: Arc<dyn BackendCompactor>,
        concurrency: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            reader,
            compactor,
            concurrency: concurrency.max(1),
            metrics,
        }
    }

    /// Poll the backend
    ///
    /// Failing to list tenants fails the poll. A tenant that fails to poll
    /// keeps its lists from `previous`.
    pub async fn do_poll(&self, previous: &BlocklistSnapshot) -> Result<PollResults> {
        let timer = Instant::now();
        let tenants = self.reader.tenants().await?;
        let mut results = PollResults::default();

        for tenant in tenants {
            let (metas, compacted) = match self.poll_tenant(&tenant).await {
                Ok(lists) => lists,
                Err(e) => {
                    warn!(tenant = %tenant, error = %e, "failed to poll tenant, keeping previous blocklist");
                    self.metrics.poll_errors.inc();
                    (
                        previous.metas(&tenant).as_ref().clone(),
                        previous.compacted_metas(&tenant).as_ref().clone(),
                    )
                }
            };

            self.metrics
                .blocklist_length
                .with_label_values(&[&tenant])
                .set(metas.len() as i64);
            self.metrics
                .compacted_blocklist_length
                .with_label_values(&[&tenant])
                .set(compacted.len() as i64);
            debug!(tenant = %tenant, blocks = metas.len(), compacted = compacted.len(), "polled tenant");

            results.metas.insert(tenant.clone(), metas);
            results.compacted.insert(tenant, compacted);
        }

        self.metrics.poll_duration.observe(timer.elapsed().as_secs_f64());
        Ok(results)
    }

    async fn poll_tenant(&self, tenant_id: &str) -> Result<(Vec<BlockMeta>, Vec<CompactedBlockMeta>)> {
        let block_ids = self.reader.blocks(tenant_id).await?;

        let polled: Vec<Polled> = stream::iter(block_ids)
            .map(|block_id| self.poll_block(block_id, tenant_id))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let mut metas = Vec::new();
        let mut compacted = Vec::new();
        for p in polled {
            match p {
                Polled::Active(meta) => metas.push(meta),
                Polled::Compacted(c) => compacted.push(c),
                Polled::Missing => {}
            }
        }
        metas.sort_by_key(|m| m.start_time);
        compacted.sort_by_key(|c| c.start_time);
        Ok((metas, compacted))
    }

    async fn poll_block(&self, block_id: Uuid, tenant_id: &str) -> Result<Polled> {
        match self.reader.block_meta(block_id, tenant_id).await {
            Ok(meta) => return Ok(Polled::Active(meta)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.compactor.compacted_block_meta(block_id, tenant_id).await {
            Ok(c) => Ok(Polled::Compacted(c)),
            // still being written, or already deleted
            Err(e) if e.is_not_found() => Ok(Polled::Missing),
            Err(e) => Err(e),
        }
    }
}
