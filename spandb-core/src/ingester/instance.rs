//! Per-tenant block manager

use crate::backend::{BackendCompactor, BackendReader, LocalBackend};
use crate::block::{CompletingBlock, HeadBlock, LocalBlock};
use crate::db::Db;
use crate::{Result, SpanError, CURRENT_DATA_ENCODING};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts to take sole ownership of a completing block before clearing it
const CLEAR_ATTEMPTS: usize = 100;

/// Owns one tenant's head, completing and local complete blocks
pub struct TenantBlockManager {
    tenant_id: String,
    db: Arc<Db>,
    local: Arc<LocalBackend>,
    max_bytes_per_object: usize,
    max_objects_per_block: usize,

    /// Written only to append or cut; lookups share it
    head: RwLock<Option<HeadBlock>>,
    /// Oldest first
    completing: RwLock<Vec<Arc<CompletingBlock>>>,
    /// Oldest first
    complete: RwLock<Vec<Arc<LocalBlock>>>,
}

impl TenantBlockManager {
    pub fn new(
        tenant_id: impl Into<String>,
        db: Arc<Db>,
        local: Arc<LocalBackend>,
        max_bytes_per_object: usize,
        max_objects_per_block: usize,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            db,
            local,
            max_bytes_per_object,
            max_objects_per_block,
            head: RwLock::new(None),
            completing: RwLock::new(Vec::new()),
            complete: RwLock::new(Vec::new()),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Append an object to the head block, creating it if needed
    pub fn push_bytes(&self, id: &[u8], object: &[u8], start: i64, end: i64) -> Result<()> {
        if id.is_empty() {
            return Err(SpanError::Validation("empty object id".into()));
        }
        if self.max_bytes_per_object > 0 && object.len() > self.max_bytes_per_object {
            return Err(SpanError::Capacity(format!(
                "object of {} bytes exceeds the {} byte limit",
                object.len(),
                self.max_bytes_per_object
            )));
        }

        let mut head = self.head.write();
        if head.is_none() {
            *head = Some(self.new_head()?);
        }
        let Some(block) = head.as_mut() else {
            return Err(SpanError::Internal("head block missing after creation".into()));
        };

        if self.max_objects_per_block > 0 && block.length() >= self.max_objects_per_block {
            return Err(SpanError::Capacity(format!(
                "head block {} holds the maximum of {} objects",
                block.block_id(),
                self.max_objects_per_block
            )));
        }
        block.append(id, object, start, end)
    }

    fn new_head(&self) -> Result<HeadBlock> {
        let counter = self
            .db
            .metrics()
            .slack_clamped_objects
            .with_label_values(&[&self.tenant_id]);
        let block = self
            .db
            .wal()
            .new_block(Uuid::new_v4(), &self.tenant_id, CURRENT_DATA_ENCODING)?
            .with_clamp_counter(counter);
        debug!(tenant = %self.tenant_id, block_id = %block.block_id(), "created head block");
        Ok(HeadBlock::new(block))
    }

    /// Seal the head block when it is idle for `max_idle`, at least
    /// `max_bytes` large, or `immediate` is set
    ///
    /// Empty head blocks are never cut.
    pub fn cut_block_if_ready(&self, max_idle: Duration, max_bytes: u64, immediate: bool) -> Result<Option<Uuid>> {
        let mut head = self.head.write();
        let ready = match head.as_ref() {
            Some(block) if block.length() > 0 => {
                immediate || block.idle() >= max_idle || block.data_length() >= max_bytes
            }
            _ => false,
        };
        if !ready {
            return Ok(None);
        }

        let Some(block) = head.take() else {
            return Ok(None);
        };
        let completing = block.seal()?;
        let block_id = completing.block_id();
        self.completing.write().push(Arc::new(completing));

        self.db.metrics().blocks_cut.with_label_values(&[&self.tenant_id]).inc();
        info!(tenant = %self.tenant_id, block_id = %block_id, "cut head block");
        Ok(Some(block_id))
    }

    /// Track a block recovered from the WAL
    pub fn add_completing(&self, block: CompletingBlock) {
        self.completing.write().push(Arc::new(block));
    }

    /// Track a complete block found in the local backend
    pub fn add_local(&self, block: LocalBlock) {
        self.complete.write().push(Arc::new(block));
    }

    pub fn completing_block_ids(&self) -> Vec<Uuid> {
        self.completing.read().iter().map(|b| b.block_id()).collect()
    }

    /// Local blocks not yet copied to the remote backend
    pub fn unflushed_block_ids(&self) -> Vec<Uuid> {
        self.complete
            .read()
            .iter()
            .filter(|b| b.flushed_time().is_none())
            .map(|b| b.block_id())
            .collect()
    }

    fn find_completing(&self, block_id: Uuid) -> Option<Arc<CompletingBlock>> {
        self.completing.read().iter().find(|b| b.block_id() == block_id).cloned()
    }

    fn find_local(&self, block_id: Uuid) -> Option<Arc<LocalBlock>> {
        self.complete.read().iter().find(|b| b.block_id() == block_id).cloned()
    }

    /// Complete a block locally, copy it to the remote backend, mark it
    /// flushed and clear the completing block
    ///
    /// Each step checks what earlier attempts already did, so a retry
    /// resumes where a failure stopped and a finished block is a no-op.
    pub async fn complete_block(&self, block_id: Uuid) -> Result<()> {
        let local_block = match self.find_local(block_id) {
            Some(block) => block,
            None => {
                let Some(completing) = self.find_completing(block_id) else {
                    debug!(tenant = %self.tenant_id, block_id = %block_id, "nothing to complete");
                    return Ok(());
                };

                let meta = match self.local.block_meta(block_id, &self.tenant_id).await {
                    Ok(meta) => meta,
                    Err(e) if e.is_not_found() => {
                        // drop leftovers of an earlier attempt before rebuilding
                        self.local.clear_block(block_id, &self.tenant_id).await?;
                        self.db
                            .complete_block_with_backend(&completing, self.local.clone(), self.local.as_ref())
                            .await?
                            .meta()
                            .clone()
                    }
                    Err(e) => return Err(e),
                };

                let block = Arc::new(LocalBlock::open(meta, self.local.clone(), self.db.metrics().clone()).await?);
                self.complete.write().push(block.clone());
                block
            }
        };

        if local_block.flushed_time().is_none() {
            local_block.write(self.db.writer().as_ref()).await?;
            self.db
                .metrics()
                .blocks_flushed
                .with_label_values(&[&self.tenant_id])
                .inc();
        }

        self.clear_completing_block(block_id).await
    }

    /// Stop tracking a completing block and delete its WAL file
    pub async fn clear_completing_block(&self, block_id: Uuid) -> Result<()> {
        let removed = {
            let mut completing = self.completing.write();
            completing
                .iter()
                .position(|b| b.block_id() == block_id)
                .map(|i| completing.remove(i))
        };
        let Some(mut block) = removed else {
            return Ok(());
        };

        // finds may still hold a reference for a moment
        for _ in 0..CLEAR_ATTEMPTS {
            match Arc::try_unwrap(block) {
                Ok(owned) => return owned.clear(),
                Err(shared) => {
                    block = shared;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        self.completing.write().push(block);
        Err(SpanError::Internal(format!(
            "completing block {} is still in use",
            block_id
        )))
    }

    /// Delete local blocks flushed longer than `timeout` ago
    pub async fn clear_flushed_blocks(&self, timeout: Duration) -> Result<()> {
        let now = chrono::Utc::now();
        let expired: Vec<Arc<LocalBlock>> = self
            .complete
            .read()
            .iter()
            .filter(|b| {
                b.flushed_time().map_or(false, |flushed| {
                    now.signed_duration_since(flushed)
                        .to_std()
                        .map_or(false, |age| age > timeout)
                })
            })
            .cloned()
            .collect();

        for block in expired {
            let block_id = block.block_id();
            self.local.clear_block(block_id, &self.tenant_id).await?;
            self.complete.write().retain(|b| b.block_id() != block_id);
            debug!(tenant = %self.tenant_id, block_id = %block_id, "cleared flushed local block");
        }
        Ok(())
    }

    /// Search the head, then completing blocks, then local complete
    /// blocks, newest first; the first hit wins
    ///
    /// `cancel` is checked before every block.
    pub async fn find_by_id(&self, id: &[u8], cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        if cancel.is_cancelled() {
            return Err(SpanError::Cancelled);
        }
        if let Some(head) = self.head.read().as_ref() {
            if let Some(object) = head.find_by_id(id)? {
                return Ok(Some(object));
            }
        }

        let completing: Vec<Arc<CompletingBlock>> = self.completing.read().iter().rev().cloned().collect();
        for block in completing {
            if cancel.is_cancelled() {
                return Err(SpanError::Cancelled);
            }
            if let Some(object) = block.find_by_id(id)? {
                return Ok(Some(object));
            }
        }

        let complete: Vec<Arc<LocalBlock>> = self.complete.read().iter().rev().cloned().collect();
        for block in complete {
            if cancel.is_cancelled() {
                return Err(SpanError::Cancelled);
            }
            match block.find_by_id(id, cancel).await {
                Ok(Some(object)) => return Ok(Some(object)),
                Ok(None) => {}
                // the block may have been cleared under us
                Err(e) if e.is_not_found() => {
                    warn!(tenant = %self.tenant_id, block_id = %block.block_id(), "local block vanished during find");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Whether the head block holds objects
    pub fn has_head_data(&self) -> bool {
        self.head.read().as_ref().map_or(false, |b| b.length() > 0)
    }
}
