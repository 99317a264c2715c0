//! Complete blocks
//!
//! A complete block is immutable and lives in a backend as three kinds of
//! objects: `data` (paged objects plus indexes), one `bloom-N` per shard and
//! `meta.json`, which is written last and commits the block.
//!
//! Blocks move through their lifecycle by consuming transitions:
//! [`HeadBlock`] is sealed into a [`CompletingBlock`], which is built into a
//! complete block and then cleared.

mod backend_block;
mod bloom;
mod builder;
mod format;
mod lifecycle;
mod readers;

pub use backend_block::{BackendBlock, BlockIterator};
pub use bloom::{shard_for, BloomFilter, ShardedBloomFilter};
pub use builder::BlockBuilder;
pub use format::{Footer, PageBounds, PageLocation, Section, MAGIC};
pub use lifecycle::{CompletingBlock, HeadBlock, LocalBlock};
pub use readers::{BackendReaderAt, CachedReaderAt, OptimizedReaderAt, ReaderAt};

use crate::{BlockVersion, Encoding};
use serde::{Deserialize, Serialize};

/// Format of blocks written by this process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Page layout
    pub version: BlockVersion,
    /// Page compression
    pub encoding: Encoding,
    /// Uncompressed bytes per page before a new page is started
    pub page_size_bytes: usize,
    /// Bloom filter false positive rate
    pub bloom_fp: f64,
    /// Target size of one bloom shard
    pub bloom_shard_size_bytes: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            version: BlockVersion::default(),
            encoding: Encoding::Lz4,
            page_size_bytes: crate::config::PAGE_SIZE_BYTES,
            bloom_fp: crate::config::BLOOM_FP,
            bloom_shard_size_bytes: crate::config::BLOOM_SHARD_SIZE_BYTES,
        }
    }
}

/// Which sections of a block's `data` object are read through the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheControl {
    pub footer: bool,
    pub column_index: bool,
    pub offset_index: bool,
}

impl CacheControl {
    /// Cache every section
    pub fn all() -> Self {
        Self {
            footer: true,
            column_index: true,
            offset_index: true,
        }
    }
}
