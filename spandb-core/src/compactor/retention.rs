//! Block retention
//!
//! Active blocks past the tenant's retention are retired like compaction
//! inputs. Retired blocks past `compacted_block_retention` are deleted.

use super::Compactor;
use crate::{BlockMeta, CompactedBlockMeta, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

impl Compactor {
    /// Apply retention to every tenant once
    pub async fn do_retention(&self) -> Result<()> {
        let now = Utc::now();
        for tenant in self.db.blocklist().tenants() {
            self.retain_tenant(&tenant, now).await;
        }
        Ok(())
    }

    /// Effective block retention of a tenant, zero when disabled
    pub fn block_retention(&self, tenant_id: &str) -> Duration {
        let tenant = self.overrides.block_retention(tenant_id);
        if tenant.is_zero() {
            self.config.block_retention
        } else {
            tenant
        }
    }

    async fn retain_tenant(&self, tenant_id: &str, now: DateTime<Utc>) {
        let retention = self.block_retention(tenant_id);
        if !retention.is_zero() {
            let expired: Vec<BlockMeta> = self
                .db
                .blocklist()
                .metas(tenant_id)
                .iter()
                .filter(|m| older_than(m.end_time, now, retention))
                .filter(|m| self.sharder.owns(&format!("retention-{}-{}", tenant_id, m.block_id)))
                .cloned()
                .collect();
            self.mark_expired(tenant_id, expired, now).await;
        }

        let stale: Vec<CompactedBlockMeta> = self
            .db
            .blocklist()
            .compacted_metas(tenant_id)
            .iter()
            .filter(|c| is_stale(c, now, self.config.compacted_block_retention))
            .cloned()
            .collect();
        self.delete_stale(tenant_id, stale).await;
    }

    async fn mark_expired(&self, tenant_id: &str, expired: Vec<BlockMeta>, now: DateTime<Utc>) {
        let backend = self.db.compactor().clone();
        let marked: Vec<BlockMeta> = stream::iter(expired)
            .map(|meta| {
                let backend = backend.clone();
                async move {
                    match backend.mark_block_compacted(meta.block_id, tenant_id).await {
                        Ok(()) => Some(meta),
                        Err(e) => {
                            warn!(tenant = %tenant_id, block_id = %meta.block_id, error = %e, "failed to retire block");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.config.retention_concurrency.max(1))
            .filter_map(|m| async move { m })
            .collect()
            .await;

        if marked.is_empty() {
            return;
        }
        self.db.metrics().retention_marked.inc_by(marked.len() as u64);
        info!(tenant = %tenant_id, blocks = marked.len(), "retired blocks past retention");

        let ids: Vec<Uuid> = marked.iter().map(|m| m.block_id).collect();
        let retired = marked.into_iter().map(|m| m.into_compacted(now)).collect();
        self.db.blocklist().update(tenant_id, vec![], &ids, retired);
    }

    async fn delete_stale(&self, tenant_id: &str, stale: Vec<CompactedBlockMeta>) {
        let backend = self.db.compactor().clone();
        let deleted: Vec<Uuid> = stream::iter(stale)
            .map(|c| {
                let backend = backend.clone();
                async move {
                    match backend.clear_block(c.block_id, tenant_id).await {
                        Ok(()) => Some(c.block_id),
                        Err(e) => {
                            warn!(tenant = %tenant_id, block_id = %c.block_id, error = %e, "failed to delete block");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.config.retention_concurrency.max(1))
            .filter_map(|id| async move { id })
            .collect()
            .await;

        if deleted.is_empty() {
            return;
        }
        self.db.metrics().retention_deleted.inc_by(deleted.len() as u64);
        info!(tenant = %tenant_id, blocks = deleted.len(), "deleted compacted blocks");
        self.db.blocklist().remove_compacted(tenant_id, &deleted);
    }
}

/// Whether `time` is more than `retention` before `now`
fn older_than(time: DateTime<Utc>, now: DateTime<Utc>, retention: Duration) -> bool {
    now.signed_duration_since(time)
        .to_std()
        .map_or(false, |age| age > retention)
}

/// A retired block is deleted once `retention` has passed; zero deletes at once
fn is_stale(compacted: &CompactedBlockMeta, now: DateTime<Utc>, retention: Duration) -> bool {
    retention.is_zero() || older_than(compacted.compacted_time, now, retention)
}
