//! Block builder for writing sorted objects to a backend

use super::bloom::ShardedBloomFilter;
use super::format::{encode_page, Footer, PageBounds, PageLocation, Section, MAGIC};
use super::BlockConfig;
use crate::backend::{bloom_name, BackendWriter, DATA_NAME};
use crate::{BlockMeta, Result, SpanError};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// Builds one complete block from objects added in ascending ID order
pub struct BlockBuilder {
    config: BlockConfig,
    meta: BlockMeta,
    bloom: ShardedBloomFilter,

    // Current state
    data: BytesMut,
    page: Vec<(Vec<u8>, Vec<u8>)>,
    page_bytes: usize,
    last_id: Option<Vec<u8>>,

    // Index data
    column_index: Vec<PageBounds>,
    offset_index: Vec<PageLocation>,
}

impl BlockBuilder {
    /// Create a builder
    ///
    /// `meta` supplies the block identity, compaction level, data encoding
    /// and initial time range. Object counts and ID bounds are recomputed
    /// from the added objects; version and encoding come from `config`.
    pub fn new(config: &BlockConfig, mut meta: BlockMeta, estimated_objects: usize) -> Self {
        meta.version = config.version;
        meta.encoding = config.encoding;
        meta.total_objects = 0;
        meta.min_id.clear();
        meta.max_id.clear();
        meta.size = 0;
        meta.footer_size = 0;

        let mut data = BytesMut::with_capacity(config.page_size_bytes + MAGIC.len());
        data.put_slice(MAGIC);

        Self {
            bloom: ShardedBloomFilter::new(config.bloom_fp, config.bloom_shard_size_bytes, estimated_objects),
            config: config.clone(),
            meta,
            data,
            page: Vec::new(),
            page_bytes: 0,
            last_id: None,
            column_index: Vec::new(),
            offset_index: Vec::new(),
        }
    }

    /// Add an object; IDs must be strictly ascending
    pub fn add(&mut self, id: &[u8], object: Vec<u8>) -> Result<()> {
        self.add_with_range(id, object, 0, 0)
    }

    /// Add an object and widen the block time range to `[start, end]`;
    /// zero bounds leave the range untouched
    pub fn add_with_range(&mut self, id: &[u8], object: Vec<u8>, start: i64, end: i64) -> Result<()> {
        if id.is_empty() {
            return Err(SpanError::Validation("empty object id".into()));
        }
        if let Some(last) = &self.last_id {
            if id <= last.as_slice() {
                return Err(SpanError::Validation(format!(
                    "object ids must be strictly ascending: {} after {}",
                    hex_id(id),
                    hex_id(last)
                )));
            }
        }

        self.bloom.add(id);
        self.meta.object_added(id, start, end);
        self.last_id = Some(id.to_vec());
        self.page_bytes += id.len() + object.len();
        self.page.push((id.to_vec(), object));

        if self.page_bytes >= self.config.page_size_bytes {
            self.flush_page()?;
        }
        Ok(())
    }

    /// Bytes of `data` written so far, including the open page
    pub fn data_length(&self) -> u64 {
        (self.data.len() + self.page_bytes) as u64
    }

    /// Objects added so far
    pub fn len(&self) -> u64 {
        self.meta.total_objects
    }

    pub fn is_empty(&self) -> bool {
        self.meta.total_objects == 0
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    fn flush_page(&mut self) -> Result<()> {
        if self.page.is_empty() {
            return Ok(());
        }

        let page = std::mem::take(&mut self.page);
        let encoded = encode_page(self.config.version, self.config.encoding, &page)?;

        self.column_index.push(PageBounds {
            min_id: page[0].0.clone(),
            max_id: page[page.len() - 1].0.clone(),
        });
        self.offset_index.push(PageLocation {
            offset: self.data.len() as u64,
            size: encoded.len() as u32,
            num_records: page.len() as u32,
        });
        self.data.put_slice(&encoded);
        self.page_bytes = 0;
        Ok(())
    }

    fn write_section(&mut self, bytes: &[u8]) -> Section {
        let section = Section {
            offset: self.data.len() as u64,
            len: bytes.len() as u32,
        };
        self.data.put_slice(bytes);
        section
    }

    /// Write `data` and the bloom shards, returning the final meta
    ///
    /// The block is not committed until the caller writes the meta.
    pub async fn finish(mut self, writer: &dyn BackendWriter) -> Result<BlockMeta> {
        self.flush_page()?;

        let column_index = bincode::serialize(&self.column_index)?;
        let column_index = self.write_section(&column_index);
        let offset_index = bincode::serialize(&self.offset_index)?;
        let offset_index = self.write_section(&offset_index);

        let footer = bincode::serialize(&Footer {
            version: self.config.version,
            encoding: self.config.encoding,
            total_objects: self.meta.total_objects,
            column_index,
            offset_index,
        })?;
        self.data.put_slice(&footer);
        self.data.put_u32_le(footer.len() as u32);
        self.data.put_slice(MAGIC);

        self.meta.size = self.data.len() as u64;
        self.meta.footer_size = footer.len() as u32;
        self.meta.bloom_shard_count = self.bloom.shard_count();

        let block_id = self.meta.block_id;
        let tenant_id = self.meta.tenant_id.clone();
        writer
            .write(DATA_NAME, block_id, &tenant_id, self.data.freeze(), false)
            .await?;
        for (shard, bytes) in self.bloom.marshal().into_iter().enumerate() {
            writer
                .write(&bloom_name(shard as u16), block_id, &tenant_id, Bytes::from(bytes), true)
                .await?;
        }

        debug!(
            block_id = %block_id,
            tenant = %tenant_id,
            objects = self.meta.total_objects,
            pages = self.offset_index.len(),
            size = self.meta.size,
            "block data written"
        );
        Ok(self.meta)
    }
}

fn hex_id(id: &[u8]) -> String {
    id.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendReader, LocalBackend};
    use crate::{BlockVersion, Encoding};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn template() -> BlockMeta {
        BlockMeta::new("t", Uuid::new_v4(), BlockVersion::V1, Encoding::None, "v1")
    }

    #[test]
    fn test_ids_must_ascend() {
        let mut builder = BlockBuilder::new(&BlockConfig::default(), template(), 10);
        builder.add(&[2], vec![1]).unwrap();
        assert!(builder.add(&[2], vec![1]).is_err());
        assert!(builder.add(&[1], vec![1]).is_err());
        assert!(builder.add(&[], vec![1]).is_err());
        builder.add(&[3], vec![1]).unwrap();
        assert_eq!(builder.len(), 2);
    }

    #[tokio::test]
    async fn test_finish_writes_data_and_blooms() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let config = BlockConfig {
            page_size_bytes: 256,
            bloom_shard_size_bytes: 16,
            ..Default::default()
        };

        let mut builder = BlockBuilder::new(&config, template(), 100);
        for i in 0..100u8 {
            builder.add_with_range(&[i, i], vec![i; 20], 1000 + i as i64, 2000).unwrap();
        }
        let meta = builder.finish(&backend).await.unwrap();

        assert_eq!(meta.version, BlockVersion::V2);
        assert_eq!(meta.encoding, Encoding::Lz4);
        assert_eq!(meta.total_objects, 100);
        assert_eq!(meta.min_id, vec![0, 0]);
        assert_eq!(meta.max_id, vec![99, 99]);
        assert_eq!(meta.start_time.timestamp(), 1000);
        assert!(meta.bloom_shard_count > 1);

        let data = backend.read(DATA_NAME, meta.block_id, "t", false).await.unwrap();
        assert_eq!(data.len() as u64, meta.size);
        assert_eq!(&data[..4], MAGIC);
        assert_eq!(&data[data.len() - 4..], MAGIC);
        for shard in 0..meta.bloom_shard_count {
            backend.read(&bloom_name(shard), meta.block_id, "t", false).await.unwrap();
        }
        // not committed yet
        assert!(backend.block_meta(meta.block_id, "t").await.unwrap_err().is_not_found());
    }
}
