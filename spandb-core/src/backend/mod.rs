//! Durable object storage for blocks
//!
//! Objects are keyed by `(tenant, block id, name)`:
//!
//! ```text
//! <tenant>/<block_id>/data
//!                    /bloom-0 .. bloom-N
//!                    /meta.json            written last, commits the block
//!                    /meta.compacted.json  present once the block is retired
//!                    /flushed              ingester-local copies only
//! ```

mod cached;
mod local;

pub use cached::CachedReader;
pub use local::LocalBackend;

use crate::{BlockMeta, CompactedBlockMeta, Result, SpanError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Block metadata object
pub const META_NAME: &str = "meta.json";
/// Metadata object of a retired block
pub const COMPACTED_META_NAME: &str = "meta.compacted.json";
/// Paged block contents
pub const DATA_NAME: &str = "data";
/// Marker written once a local block has been copied to the remote backend
pub const FLUSHED_NAME: &str = "flushed";

/// Name of one bloom shard object
pub fn bloom_name(shard: u16) -> String {
    format!("bloom-{}", shard)
}

/// Reject tenant IDs that cannot be used as a path or WAL file name segment
pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    if tenant_id.is_empty() {
        return Err(SpanError::Validation("empty tenant id".into()));
    }
    if tenant_id == "." || tenant_id == ".." || tenant_id.contains(['/', '\\', '+']) {
        return Err(SpanError::Validation(format!("invalid tenant id: {}", tenant_id)));
    }
    Ok(())
}

/// Read side of a backend
#[async_trait]
pub trait BackendReader: Send + Sync {
    /// Read a whole object
    async fn read(&self, name: &str, block_id: Uuid, tenant_id: &str, should_cache: bool) -> Result<Bytes>;

    /// Fill `buf` starting at `offset`
    async fn read_range(
        &self,
        name: &str,
        block_id: Uuid,
        tenant_id: &str,
        offset: u64,
        buf: &mut [u8],
        should_cache: bool,
    ) -> Result<()>;

    /// Every tenant with at least one block
    async fn tenants(&self) -> Result<Vec<String>>;

    /// Every block ID of a tenant, committed or not
    async fn blocks(&self, tenant_id: &str) -> Result<Vec<Uuid>>;

    /// Active meta of a block, `DoesNotExist` if absent
    async fn block_meta(&self, block_id: Uuid, tenant_id: &str) -> Result<BlockMeta> {
        let bytes = self.read(META_NAME, block_id, tenant_id, false).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Write side of a backend
#[async_trait]
pub trait BackendWriter: Send + Sync {
    /// Write a whole object, replacing any previous contents
    async fn write(&self, name: &str, block_id: Uuid, tenant_id: &str, data: Bytes, should_cache: bool) -> Result<()>;

    /// Commit a block by writing its meta
    async fn write_block_meta(&self, meta: &BlockMeta) -> Result<()> {
        let json = serde_json::to_vec(meta)?;
        self.write(META_NAME, meta.block_id, &meta.tenant_id, Bytes::from(json), false)
            .await
    }
}

/// Lifecycle operations used by compaction and retention
#[async_trait]
pub trait BackendCompactor: Send + Sync {
    /// Retire an active block, stamping the compacted time
    async fn mark_block_compacted(&self, block_id: Uuid, tenant_id: &str) -> Result<()>;

    /// Undo `mark_block_compacted`
    async fn clear_compacted(&self, block_id: Uuid, tenant_id: &str) -> Result<()>;

    /// Delete every object of a block
    async fn clear_block(&self, block_id: Uuid, tenant_id: &str) -> Result<()>;

    /// Meta of a retired block, `DoesNotExist` if absent
    async fn compacted_block_meta(&self, block_id: Uuid, tenant_id: &str) -> Result<CompactedBlockMeta>;
}

/// Copy a committed block between backends; the meta goes last
pub async fn copy_block(meta: &BlockMeta, from: &dyn BackendReader, to: &dyn BackendWriter) -> Result<()> {
    let data = from.read(DATA_NAME, meta.block_id, &meta.tenant_id, false).await?;
    to.write(DATA_NAME, meta.block_id, &meta.tenant_id, data, false).await?;

    for shard in 0..meta.bloom_shard_count {
        let name = bloom_name(shard);
        let bloom = from.read(&name, meta.block_id, &meta.tenant_id, false).await?;
        to.write(&name, meta.block_id, &meta.tenant_id, bloom, true).await?;
    }

    to.write_block_meta(meta).await
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Local filesystem rooted at `path`
    Local { path: PathBuf },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            path: PathBuf::from("data/blocks"),
        }
    }
}

/// The three capabilities of one backend
#[derive(Clone)]
pub struct Backend {
    pub reader: Arc<dyn BackendReader>,
    pub writer: Arc<dyn BackendWriter>,
    pub compactor: Arc<dyn BackendCompactor>,
}

/// Build the backend named by the configuration
pub fn new_backend(config: &BackendConfig) -> Result<Backend> {
    match config {
        BackendConfig::Local { path } => {
            let local = Arc::new(LocalBackend::new(path)?);
            Ok(Backend {
                reader: local.clone(),
                writer: local.clone(),
                compactor: local,
            })
        }
    }
}
