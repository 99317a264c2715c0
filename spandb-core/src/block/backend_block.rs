//! Read access to a complete block

use super::bloom::{shard_for, BloomFilter};
use super::format::{decode_page, parse_trailer, Footer, PageBounds, PageLocation, MAGIC, TRAILER_LEN};
use super::readers::{BackendReaderAt, CachedReaderAt, OptimizedReaderAt, ReaderAt};
use super::CacheControl;
use crate::backend::{bloom_name, BackendReader};
use crate::metrics::Metrics;
use crate::{BlockMeta, Result, SpanError};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Parsed indexes of a block's `data` object
struct BlockIndex {
    footer: Footer,
    bounds: Vec<PageBounds>,
    locations: Vec<PageLocation>,
}

impl BlockIndex {
    async fn open(reader: &dyn ReaderAt, size: u64) -> Result<Self> {
        if size < (MAGIC.len() + TRAILER_LEN) as u64 {
            return Err(SpanError::InvalidFormat(format!("block data too small: {} bytes", size)));
        }

        let mut magic = [0u8; 4];
        reader.read_at(&mut magic, 0).await?;
        if &magic != MAGIC {
            return Err(SpanError::InvalidFormat("bad block magic".into()));
        }

        let mut trailer = [0u8; TRAILER_LEN];
        reader.read_at(&mut trailer, size - TRAILER_LEN as u64).await?;
        let footer_len = parse_trailer(&trailer)? as u64;
        let footer_offset = (size - TRAILER_LEN as u64)
            .checked_sub(footer_len)
            .ok_or_else(|| SpanError::InvalidFormat("footer larger than block".into()))?;

        let footer: Footer = read_section(reader, footer_offset, footer_len as usize, SectionKind::Footer).await?;
        let bounds: Vec<PageBounds> = read_section(
            reader,
            footer.column_index.offset,
            footer.column_index.len as usize,
            SectionKind::ColumnIndex,
        )
        .await?;
        let locations: Vec<PageLocation> = read_section(
            reader,
            footer.offset_index.offset,
            footer.offset_index.len as usize,
            SectionKind::OffsetIndex,
        )
        .await?;

        if bounds.len() != locations.len() {
            return Err(SpanError::Corruption(format!(
                "column index has {} pages, offset index {}",
                bounds.len(),
                locations.len()
            )));
        }
        Ok(Self { footer, bounds, locations })
    }

    async fn read_page(&self, reader: &dyn ReaderAt, page: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let location = self.locations[page];
        let mut buf = vec![0u8; location.size as usize];
        reader.read_at(&mut buf, location.offset).await?;

        let records = decode_page(self.footer.version, self.footer.encoding, &buf)?;
        if records.len() != location.num_records as usize {
            return Err(SpanError::Corruption(format!(
                "page {} holds {} records, index says {}",
                page,
                records.len(),
                location.num_records
            )));
        }
        Ok(records)
    }

    /// First page that may hold `id`
    fn page_for(&self, id: &[u8]) -> Option<usize> {
        let page = self.bounds.partition_point(|b| b.max_id.as_slice() < id);
        (page < self.bounds.len() && self.bounds[page].min_id.as_slice() <= id).then_some(page)
    }
}

enum SectionKind {
    Footer,
    ColumnIndex,
    OffsetIndex,
}

async fn read_section<T: serde::de::DeserializeOwned>(
    reader: &dyn ReaderAt,
    offset: u64,
    len: usize,
    kind: SectionKind,
) -> Result<T> {
    match kind {
        SectionKind::Footer => reader.set_footer_section(offset, len),
        SectionKind::ColumnIndex => reader.set_column_index_section(offset, len),
        SectionKind::OffsetIndex => reader.set_offset_index_section(offset, len),
    }
    let mut buf = vec![0u8; len];
    reader.read_at(&mut buf, offset).await?;
    bincode::deserialize(&buf).map_err(|e| SpanError::InvalidFormat(format!("bad block section: {}", e)))
}

/// A committed block in a backend
#[derive(Clone)]
pub struct BackendBlock {
    meta: BlockMeta,
    reader: Arc<dyn BackendReader>,
    cache_control: CacheControl,
    should_cache_bloom: bool,
    metrics: Arc<Metrics>,
}

impl BackendBlock {
    pub fn new(meta: BlockMeta, reader: Arc<dyn BackendReader>, metrics: Arc<Metrics>) -> Self {
        Self {
            meta,
            reader,
            cache_control: CacheControl::default(),
            should_cache_bloom: false,
            metrics,
        }
    }

    /// Choose which `data` sections are read through the cache
    pub fn with_cache_control(mut self, cache_control: CacheControl) -> Self {
        self.cache_control = cache_control;
        self
    }

    /// Read bloom shards through the cache
    pub fn with_cached_bloom(mut self, should_cache: bool) -> Self {
        self.should_cache_bloom = should_cache;
        self
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    fn reader_at(&self, cancel: &CancellationToken) -> OptimizedReaderAt<CachedReaderAt> {
        let backend = BackendReaderAt::new(self.reader.clone(), &self.meta, cancel.clone())
            .with_counter(self.metrics.backend_bytes_read.clone());
        let cached = CachedReaderAt::new(Arc::new(backend), self.cache_control);
        OptimizedReaderAt::new(cached, &self.meta)
    }

    async fn bloom_may_contain(&self, id: &[u8]) -> Result<bool> {
        if self.meta.bloom_shard_count == 0 {
            return Ok(true);
        }
        let shard = shard_for(id, self.meta.bloom_shard_count);
        let bytes = self
            .reader
            .read(
                &bloom_name(shard),
                self.meta.block_id,
                &self.meta.tenant_id,
                self.should_cache_bloom,
            )
            .await?;
        Ok(BloomFilter::from_bytes(&bytes)?.may_contain(id))
    }

    /// Object stored under `id`, if any
    pub async fn find_by_id(&self, id: &[u8], cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        if !self.meta.contains_id(id) {
            return Ok(None);
        }
        if cancel.is_cancelled() {
            return Err(SpanError::Cancelled);
        }
        if !self.bloom_may_contain(id).await? {
            trace!(block_id = %self.meta.block_id, "bloom filter miss");
            return Ok(None);
        }

        let reader = self.reader_at(cancel);
        let index = BlockIndex::open(&reader, self.meta.size).await?;
        let Some(page) = index.page_for(id) else {
            return Ok(None);
        };

        let records = index.read_page(&reader, page).await?;
        Ok(records
            .binary_search_by(|(record_id, _)| record_id.as_slice().cmp(id))
            .ok()
            .map(|i| records[i].1.clone()))
    }

    /// Stream every object in ascending ID order
    pub async fn iterator(&self, cancel: &CancellationToken) -> Result<BlockIterator> {
        let reader = self.reader_at(cancel);
        let index = BlockIndex::open(&reader, self.meta.size).await?;
        Ok(BlockIterator {
            reader,
            index,
            next_page: 0,
            buffered: VecDeque::new(),
        })
    }
}

/// Page-by-page iterator over a block
pub struct BlockIterator {
    reader: OptimizedReaderAt<CachedReaderAt>,
    index: BlockIndex,
    next_page: usize,
    buffered: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl BlockIterator {
    /// Next `(id, object)` pair, `None` once the block is exhausted
    pub async fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        while self.buffered.is_empty() {
            if self.next_page >= self.index.locations.len() {
                return Ok(None);
            }
            let records = self.index.read_page(&self.reader, self.next_page).await?;
            self.next_page += 1;
            self.buffered.extend(records);
        }
        Ok(self.buffered.pop_front())
    }

    /// Objects in the block according to its footer
    pub fn total_objects(&self) -> u64 {
        self.index.footer.total_objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendWriter, LocalBackend};
    use crate::block::{BlockBuilder, BlockConfig};
    use crate::{BlockVersion, Encoding};
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn write_block(backend: &LocalBackend, config: &BlockConfig, count: u32) -> BlockMeta {
        let template = BlockMeta::new("t", Uuid::new_v4(), BlockVersion::V1, Encoding::None, "v1");
        let mut builder = BlockBuilder::new(config, template, count as usize);
        for i in 0..count {
            let id = (i * 2).to_be_bytes();
            builder.add(&id, format!("object-{}", i * 2).into_bytes()).unwrap();
        }
        let meta = builder.finish(backend).await.unwrap();
        backend.write_block_meta(&meta).await.unwrap();
        meta
    }

    #[tokio::test]
    async fn test_find_by_id_every_format() {
        for version in BlockVersion::all() {
            for encoding in Encoding::all() {
                let dir = TempDir::new().unwrap();
                let backend = Arc::new(LocalBackend::new(dir.path()).unwrap());
                let config = BlockConfig {
                    version: *version,
                    encoding: *encoding,
                    page_size_bytes: 200,
                    ..Default::default()
                };
                let meta = write_block(&backend, &config, 500).await;
                let block = BackendBlock::new(meta, backend.clone(), Arc::new(Metrics::unregistered()));
                let cancel = CancellationToken::new();

                for i in (0..1000u32).step_by(37) {
                    let found = block.find_by_id(&i.to_be_bytes(), &cancel).await.unwrap();
                    if i % 2 == 0 {
                        assert_eq!(found, Some(format!("object-{}", i).into_bytes()));
                    } else {
                        assert_eq!(found, None);
                    }
                }
                // outside [min_id, max_id]
                assert_eq!(block.find_by_id(&5000u32.to_be_bytes(), &cancel).await.unwrap(), None);
            }
        }
    }

    #[tokio::test]
    async fn test_iterator_ascending() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()).unwrap());
        let config = BlockConfig {
            page_size_bytes: 64,
            ..Default::default()
        };
        let meta = write_block(&backend, &config, 100).await;
        let block = BackendBlock::new(meta, backend.clone(), Arc::new(Metrics::unregistered()));

        let mut iter = block.iterator(&CancellationToken::new()).await.unwrap();
        assert_eq!(iter.total_objects(), 100);
        let mut ids = Vec::new();
        while let Some((id, _)) = iter.next().await.unwrap() {
            ids.push(id);
        }
        assert_eq!(ids.len(), 100);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_find_cancelled() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()).unwrap());
        let meta = write_block(&backend, &BlockConfig::default(), 10).await;
        let block = BackendBlock::new(meta, backend.clone(), Arc::new(Metrics::unregistered()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = block.find_by_id(&2u32.to_be_bytes(), &cancel).await.unwrap_err();
        assert!(matches!(err, SpanError::Cancelled));
    }

    #[tokio::test]
    async fn test_bytes_read_metric() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()).unwrap());
        let meta = write_block(&backend, &BlockConfig::default(), 10).await;
        let metrics = Arc::new(Metrics::unregistered());
        let block = BackendBlock::new(meta.clone(), backend.clone(), metrics.clone());

        block.find_by_id(&4u32.to_be_bytes(), &CancellationToken::new()).await.unwrap();
        let read = metrics.backend_bytes_read.get();
        // magic and trailer come from the meta
        assert!(read > 0 && read < meta.size);
    }
}
