//! Block lifecycle types
//!
//! ```text
//! HeadBlock --seal--> CompletingBlock --(complete)--> LocalBlock --write--> remote
//!                            |                            |
//!                          clear                      set_flushed
//! ```

use super::BackendBlock;
use crate::backend::{copy_block, BackendReader, BackendWriter, LocalBackend, FLUSHED_NAME};
use crate::metrics::Metrics;
use crate::wal::AppendBlock;
use crate::{BlockMeta, Result, SpanError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Block currently receiving appends
pub struct HeadBlock {
    inner: AppendBlock,
}

impl HeadBlock {
    pub fn new(inner: AppendBlock) -> Self {
        Self { inner }
    }

    pub fn append(&mut self, id: &[u8], object: &[u8], start: i64, end: i64) -> Result<()> {
        self.inner.append(id, object, start, end)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    pub fn find_by_id(&self, id: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.find_by_id(id)
    }

    pub fn meta(&self) -> &BlockMeta {
        self.inner.meta()
    }

    pub fn block_id(&self) -> Uuid {
        self.inner.block_id()
    }

    pub fn data_length(&self) -> u64 {
        self.inner.data_length()
    }

    /// Records appended, duplicates included
    pub fn length(&self) -> usize {
        self.inner.length()
    }

    pub fn idle(&self) -> Duration {
        self.inner.idle()
    }

    /// Stop accepting appends
    pub fn seal(self) -> Result<CompletingBlock> {
        self.inner.flush()?;
        Ok(CompletingBlock { inner: self.inner })
    }
}

/// Sealed block waiting to be built into a complete block
pub struct CompletingBlock {
    inner: AppendBlock,
}

impl CompletingBlock {
    /// Wrap a block recovered from the WAL
    pub fn from_replay(inner: AppendBlock) -> Self {
        Self { inner }
    }

    pub fn block_id(&self) -> Uuid {
        self.inner.block_id()
    }

    pub fn meta(&self) -> &BlockMeta {
        self.inner.meta()
    }

    pub fn find_by_id(&self, id: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.find_by_id(id)
    }

    /// Every object in ascending ID order, latest write per ID
    pub fn objects(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.objects()
    }

    pub fn data_length(&self) -> u64 {
        self.inner.data_length()
    }

    /// Delete the underlying WAL file
    pub fn clear(self) -> Result<()> {
        self.inner.clear()
    }
}

/// Complete block in the ingester's local backend
pub struct LocalBlock {
    block: BackendBlock,
    local: Arc<LocalBackend>,
    /// Unix millis of the last flush, zero when never flushed
    flushed_unix_millis: AtomicI64,
}

impl LocalBlock {
    /// Open a committed local block, loading its flushed marker
    pub async fn open(meta: BlockMeta, local: Arc<LocalBackend>, metrics: Arc<Metrics>) -> Result<Self> {
        let flushed = match local.read(FLUSHED_NAME, meta.block_id, &meta.tenant_id, false).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                DateTime::parse_from_rfc3339(text.trim())
                    .map_err(|e| SpanError::InvalidFormat(format!("bad flushed marker: {}", e)))?
                    .timestamp_millis()
            }
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };

        Ok(Self {
            block: BackendBlock::new(meta, local.clone(), metrics),
            local,
            flushed_unix_millis: AtomicI64::new(flushed),
        })
    }

    pub fn meta(&self) -> &BlockMeta {
        self.block.meta()
    }

    pub fn block_id(&self) -> Uuid {
        self.block.meta().block_id
    }

    /// When the block was last copied to the remote backend
    pub fn flushed_time(&self) -> Option<DateTime<Utc>> {
        match self.flushed_unix_millis.load(Ordering::Acquire) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    /// Record that the block is in the remote backend
    ///
    /// Calling this again overwrites the marker with the newer time.
    pub async fn set_flushed(&self) -> Result<()> {
        let now = Utc::now();
        let meta = self.block.meta();
        self.local
            .write(
                FLUSHED_NAME,
                meta.block_id,
                &meta.tenant_id,
                Bytes::from(now.to_rfc3339()),
                false,
            )
            .await?;
        self.flushed_unix_millis.store(now.timestamp_millis(), Ordering::Release);
        Ok(())
    }

    /// Copy the block to `remote` and mark it flushed
    pub async fn write(&self, remote: &dyn BackendWriter) -> Result<()> {
        copy_block(self.block.meta(), self.local.as_ref(), remote).await?;
        self.set_flushed().await?;
        info!(
            block_id = %self.block_id(),
            tenant = %self.meta().tenant_id,
            "block flushed to backend"
        );
        Ok(())
    }

    pub async fn find_by_id(&self, id: &[u8], cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        self.block.find_by_id(id, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockBuilder, BlockConfig};
    use crate::wal::{Wal, WalConfig};
    use crate::{BlockVersion, Encoding};
    use tempfile::TempDir;

    async fn local_block(dir: &TempDir) -> (LocalBlock, Arc<LocalBackend>) {
        let local = Arc::new(LocalBackend::new(dir.path().join("local")).unwrap());
        let template = BlockMeta::new("t", Uuid::new_v4(), BlockVersion::V2, Encoding::None, "v1");
        let mut builder = BlockBuilder::new(&BlockConfig::default(), template, 1);
        builder.add(&[1], b"one".to_vec()).unwrap();
        let meta = builder.finish(local.as_ref()).await.unwrap();
        local.write_block_meta(&meta).await.unwrap();

        let block = LocalBlock::open(meta, local.clone(), Arc::new(Metrics::unregistered()))
            .await
            .unwrap();
        (block, local)
    }

    #[test]
    fn test_seal_keeps_objects() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(WalConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let mut head = HeadBlock::new(wal.new_block(Uuid::new_v4(), "t", "v1").unwrap());
        let now = Utc::now().timestamp();
        head.append(&[2], b"two", now, now).unwrap();
        head.append(&[1], b"one", now, now).unwrap();

        let completing = head.seal().unwrap();
        assert_eq!(completing.find_by_id(&[1]).unwrap(), Some(b"one".to_vec()));
        assert_eq!(
            completing.objects().unwrap(),
            vec![(vec![1], b"one".to_vec()), (vec![2], b"two".to_vec())]
        );
        completing.clear().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_set_flushed_idempotent() {
        let dir = TempDir::new().unwrap();
        let (block, local) = local_block(&dir).await;
        assert!(block.flushed_time().is_none());

        block.set_flushed().await.unwrap();
        let first = block.flushed_time().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        block.set_flushed().await.unwrap();
        let second = block.flushed_time().unwrap();
        assert!(second > first);

        // the marker survives a reopen
        let reopened = LocalBlock::open(block.meta().clone(), local, Arc::new(Metrics::unregistered()))
            .await
            .unwrap();
        assert_eq!(reopened.flushed_time(), Some(second));
    }

    #[tokio::test]
    async fn test_write_copies_and_marks() {
        let dir = TempDir::new().unwrap();
        let (block, _local) = local_block(&dir).await;
        let remote = LocalBackend::new(dir.path().join("remote")).unwrap();

        block.write(&remote).await.unwrap();
        assert!(block.flushed_time().is_some());

        let meta = remote.block_meta(block.block_id(), "t").await.unwrap();
        assert_eq!(&meta, block.meta());
        let copy = BackendBlock::new(meta, Arc::new(remote), Arc::new(Metrics::unregistered()));
        assert_eq!(
            copy.find_by_id(&[1], &CancellationToken::new()).await.unwrap(),
            Some(b"one".to_vec())
        );
    }
}
