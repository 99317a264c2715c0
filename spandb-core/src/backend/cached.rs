//! Cache-aware backend reader

use super::BackendReader;
use crate::cache::Cache;
use crate::metrics::Metrics;
use crate::{BlockMeta, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use uuid::Uuid;

/// Routes reads flagged `should_cache` through a shared cache
///
/// Keys are namespaced by tenant, block and object name (plus offset and
/// length for ranged reads) so tenants never share entries.
pub struct CachedReader {
    next: Arc<dyn BackendReader>,
    cache: Arc<dyn Cache>,
    metrics: Arc<Metrics>,
}

impl CachedReader {
    pub fn new(next: Arc<dyn BackendReader>, cache: Arc<dyn Cache>, metrics: Arc<Metrics>) -> Self {
        Self { next, cache, metrics }
    }

    fn key(name: &str, block_id: Uuid, tenant_id: &str, range: Option<(u64, usize)>) -> String {
        match range {
            Some((offset, len)) => format!("{}:{}:{}:{}:{}", tenant_id, block_id, name, offset, len),
            None => format!("{}:{}:{}", tenant_id, block_id, name),
        }
    }

    async fn lookup(&self, key: &str) -> Option<Bytes> {
        let mut result = self.cache.fetch(&[key.to_string()]).await;
        match result.values.pop() {
            Some(value) => {
                self.metrics.cache_requests.with_label_values(&["hit"]).inc();
                Some(value)
            }
            None => {
                self.metrics.cache_requests.with_label_values(&["miss"]).inc();
                None
            }
        }
    }
}

#[async_trait]
impl BackendReader for CachedReader {
    async fn read(&self, name: &str, block_id: Uuid, tenant_id: &str, should_cache: bool) -> Result<Bytes> {
        if !should_cache {
            return self.next.read(name, block_id, tenant_id, false).await;
        }

        let key = Self::key(name, block_id, tenant_id, None);
        if let Some(value) = self.lookup(&key).await {
            return Ok(value);
        }

        let data = self.next.read(name, block_id, tenant_id, true).await?;
        self.cache.store(vec![key], vec![data.clone()]).await;
        Ok(data)
    }

    async fn read_range(
        &self,
        name: &str,
        block_id: Uuid,
        tenant_id: &str,
        offset: u64,
        buf: &mut [u8],
        should_cache: bool,
    ) -> Result<()> {
        if !should_cache {
            return self.next.read_range(name, block_id, tenant_id, offset, buf, false).await;
        }

        let key = Self::key(name, block_id, tenant_id, Some((offset, buf.len())));
        if let Some(value) = self.lookup(&key).await {
            if value.len() == buf.len() {
                buf.copy_from_slice(&value);
                return Ok(());
            }
        }

        self.next.read_range(name, block_id, tenant_id, offset, buf, true).await?;
        self.cache.store(vec![key], vec![Bytes::copy_from_slice(buf)]).await;
        Ok(())
    }

    async fn tenants(&self) -> Result<Vec<String>> {
        self.next.tenants().await
    }

    async fn blocks(&self, tenant_id: &str) -> Result<Vec<Uuid>> {
        self.next.blocks(tenant_id).await
    }

    async fn block_meta(&self, block_id: Uuid, tenant_id: &str) -> Result<BlockMeta> {
        self.next.block_meta(block_id, tenant_id).await
    }
}
