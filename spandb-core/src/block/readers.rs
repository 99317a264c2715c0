//! Layered random-access readers over a block's `data` object
//!
//! ```text
//! OptimizedReaderAt   answers magic/trailer reads from the meta
//!   CachedReaderAt    routes registered sections through the cache
//!     BackendReaderAt counts bytes, reads through the backend
//! ```

use super::format::{MAGIC, TRAILER_LEN};
use super::CacheControl;
use crate::backend::{BackendReader, DATA_NAME};
use crate::{BlockMeta, Result, SpanError};
use async_trait::async_trait;
use bytes::BufMut;
use parking_lot::RwLock;
use prometheus::IntCounter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Random access into a block's `data` object
///
/// The section setters announce which section the next read belongs to.
/// Readers that do not care about sections keep the default no-ops.
#[async_trait]
pub trait ReaderAt: Send + Sync {
    /// Fill `buf` from `offset`, returning the bytes read
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn set_footer_section(&self, _offset: u64, _len: usize) {}

    fn set_column_index_section(&self, _offset: u64, _len: usize) {}

    fn set_offset_index_section(&self, _offset: u64, _len: usize) {}
}

/// Reads `data` through a backend and counts the bytes it fetched
pub struct BackendReaderAt {
    reader: Arc<dyn BackendReader>,
    block_id: Uuid,
    tenant_id: String,
    bytes_read: AtomicU64,
    bytes_counter: Option<IntCounter>,
    cancel: CancellationToken,
}

impl BackendReaderAt {
    pub fn new(reader: Arc<dyn BackendReader>, meta: &BlockMeta, cancel: CancellationToken) -> Self {
        Self {
            reader,
            block_id: meta.block_id,
            tenant_id: meta.tenant_id.clone(),
            bytes_read: AtomicU64::new(0),
            bytes_counter: None,
            cancel,
        }
    }

    /// Also count bytes into a shared counter
    pub fn with_counter(mut self, counter: IntCounter) -> Self {
        self.bytes_counter = Some(counter);
        self
    }

    /// Total bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Read with `should_cache` set
    pub async fn read_at_with_cache(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read(buf, offset, true).await
    }

    async fn read(&self, buf: &mut [u8], offset: u64, should_cache: bool) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(SpanError::Cancelled);
        }
        self.reader
            .read_range(DATA_NAME, self.block_id, &self.tenant_id, offset, buf, should_cache)
            .await?;

        self.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        if let Some(counter) = &self.bytes_counter {
            counter.inc_by(buf.len() as u64);
        }
        Ok(buf.len())
    }
}

#[async_trait]
impl ReaderAt for BackendReaderAt {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read(buf, offset, false).await
    }
}

/// Routes reads of registered sections through the cache
///
/// A read uses the cache only when its offset and length match a section
/// exactly.
pub struct CachedReaderAt {
    inner: Arc<BackendReaderAt>,
    cache_control: CacheControl,
    sections: RwLock<HashMap<u64, usize>>,
}

impl CachedReaderAt {
    pub fn new(inner: Arc<BackendReaderAt>, cache_control: CacheControl) -> Self {
        Self {
            inner,
            cache_control,
            sections: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, enabled: bool, offset: u64, len: usize) {
        if enabled {
            self.sections.write().insert(offset, len);
        }
    }

    fn is_section(&self, offset: u64, len: usize) -> bool {
        self.sections.read().get(&offset) == Some(&len)
    }
}

#[async_trait]
impl ReaderAt for CachedReaderAt {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if self.is_section(offset, buf.len()) {
            self.inner.read_at_with_cache(buf, offset).await
        } else {
            self.inner.read_at(buf, offset).await
        }
    }

    fn set_footer_section(&self, offset: u64, len: usize) {
        self.register(self.cache_control.footer, offset, len);
    }

    fn set_column_index_section(&self, offset: u64, len: usize) {
        self.register(self.cache_control.column_index, offset, len);
    }

    fn set_offset_index_section(&self, offset: u64, len: usize) {
        self.register(self.cache_control.offset_index, offset, len);
    }
}

/// Answers the magic and trailer reads from the block meta
pub struct OptimizedReaderAt<R> {
    inner: R,
    size: u64,
    footer_size: u32,
}

impl<R: ReaderAt> OptimizedReaderAt<R> {
    pub fn new(inner: R, meta: &BlockMeta) -> Self {
        Self {
            inner,
            size: meta.size,
            footer_size: meta.footer_size,
        }
    }
}

#[async_trait]
impl<R: ReaderAt> ReaderAt for OptimizedReaderAt<R> {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset == 0 && buf.len() == MAGIC.len() {
            buf.copy_from_slice(MAGIC);
            return Ok(buf.len());
        }

        // a zero footer size means the meta predates the field
        if self.footer_size > 0 && buf.len() == TRAILER_LEN && offset + TRAILER_LEN as u64 == self.size {
            let mut trailer = Vec::with_capacity(TRAILER_LEN);
            trailer.put_u32_le(self.footer_size);
            trailer.put_slice(MAGIC);
            buf.copy_from_slice(&trailer);
            return Ok(buf.len());
        }

        self.inner.read_at(buf, offset).await
    }

    fn set_footer_section(&self, offset: u64, len: usize) {
        self.inner.set_footer_section(offset, len);
    }

    fn set_column_index_section(&self, offset: u64, len: usize) {
        self.inner.set_column_index_section(offset, len);
    }

    fn set_offset_index_section(&self, offset: u64, len: usize) {
        self.inner.set_offset_index_section(offset, len);
    }
}

#[async_trait]
impl<T: ReaderAt + ?Sized> ReaderAt for Arc<T> {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_at(buf, offset).await
    }

    fn set_footer_section(&self, offset: u64, len: usize) {
        (**self).set_footer_section(offset, len);
    }

    fn set_column_index_section(&self, offset: u64, len: usize) {
        (**self).set_column_index_section(offset, len);
    }

    fn set_offset_index_section(&self, offset: u64, len: usize) {
        (**self).set_offset_index_section(offset, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendWriter, LocalBackend};
    use crate::{BlockVersion, Encoding};
    use bytes::Bytes;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every `read_range` call as (offset, len, should_cache)
    struct RecordingReader {
        inner: LocalBackend,
        calls: Mutex<Vec<(u64, usize, bool)>>,
    }

    #[async_trait]
    impl BackendReader for RecordingReader {
        async fn read(&self, name: &str, block_id: Uuid, tenant_id: &str, should_cache: bool) -> Result<Bytes> {
            self.inner.read(name, block_id, tenant_id, should_cache).await
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
            self.calls.lock().unwrap().push((offset, buf.len(), should_cache));
            self.inner
                .read_range(name, block_id, tenant_id, offset, buf, should_cache)
                .await
        }

        async fn tenants(&self) -> Result<Vec<String>> {
            self.inner.tenants().await
        }

        async fn blocks(&self, tenant_id: &str) -> Result<Vec<Uuid>> {
            self.inner.blocks(tenant_id).await
        }
    }

    async fn setup(dir: &TempDir) -> (Arc<RecordingReader>, BlockMeta) {
        let backend = LocalBackend::new(dir.path()).unwrap();
        let mut meta = BlockMeta::new("t", Uuid::new_v4(), BlockVersion::V2, Encoding::None, "v1");
        meta.size = 32;
        meta.footer_size = 7;
        backend
            .write(DATA_NAME, meta.block_id, "t", Bytes::from(vec![7u8; 32]), false)
            .await
            .unwrap();
        let reader = Arc::new(RecordingReader {
            inner: backend,
            calls: Mutex::new(Vec::new()),
        });
        (reader, meta)
    }

    #[tokio::test]
    async fn test_backend_reader_counts_bytes() {
        let dir = TempDir::new().unwrap();
        let (reader, meta) = setup(&dir).await;
        let r = BackendReaderAt::new(reader.clone(), &meta, CancellationToken::new());

        let mut buf = [0u8; 10];
        r.read_at(&mut buf, 3).await.unwrap();
        r.read_at_with_cache(&mut buf[..5], 0).await.unwrap();
        assert_eq!(r.bytes_read(), 15);
        assert_eq!(*reader.calls.lock().unwrap(), vec![(3, 10, false), (0, 5, true)]);
    }

    #[tokio::test]
    async fn test_backend_reader_cancelled() {
        let dir = TempDir::new().unwrap();
        let (reader, meta) = setup(&dir).await;
        let cancel = CancellationToken::new();
        let r = BackendReaderAt::new(reader, &meta, cancel.clone());
        cancel.cancel();

        let mut buf = [0u8; 4];
        assert!(matches!(r.read_at(&mut buf, 0).await, Err(SpanError::Cancelled)));
    }

    #[tokio::test]
    async fn test_optimized_reader_skips_backend() {
        let dir = TempDir::new().unwrap();
        let (reader, meta) = setup(&dir).await;
        let backend_reader = Arc::new(BackendReaderAt::new(reader.clone(), &meta, CancellationToken::new()));
        let r = OptimizedReaderAt::new(backend_reader.clone(), &meta);

        let mut magic = [0u8; 4];
        r.read_at(&mut magic, 0).await.unwrap();
        assert_eq!(&magic, MAGIC);

        let mut trailer = [0u8; 8];
        r.read_at(&mut trailer, 24).await.unwrap();
        assert_eq!(&trailer[..4], &7u32.to_le_bytes());
        assert_eq!(&trailer[4..], MAGIC);
        assert_eq!(backend_reader.bytes_read(), 0);

        // anything else passes through
        let mut other = [0u8; 4];
        r.read_at(&mut other, 4).await.unwrap();
        assert_eq!(other, [7u8; 4]);
        assert_eq!(backend_reader.bytes_read(), 4);
    }

    #[tokio::test]
    async fn test_cached_reader_sections() {
        let dir = TempDir::new().unwrap();
        let (reader, meta) = setup(&dir).await;
        let backend_reader = Arc::new(BackendReaderAt::new(reader.clone(), &meta, CancellationToken::new()));
        let control = CacheControl {
            footer: true,
            column_index: false,
            offset_index: true,
        };
        let r = CachedReaderAt::new(backend_reader, control);

        r.set_footer_section(20, 4);
        r.set_column_index_section(10, 4);
        r.set_offset_index_section(14, 6);

        let mut buf = [0u8; 4];
        r.read_at(&mut buf, 20).await.unwrap();
        r.read_at(&mut buf, 10).await.unwrap();
        let mut six = [0u8; 6];
        r.read_at(&mut six, 14).await.unwrap();
        // registered offset but different length
        r.read_at(&mut buf, 14).await.unwrap();

        assert_eq!(
            *reader.calls.lock().unwrap(),
            vec![(20, 4, true), (10, 4, false), (14, 6, true), (14, 4, false)]
        );
    }
}
