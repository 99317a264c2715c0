//! Core types for SpanDB

use crate::{Result, SpanError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lowest possible block ID, used as an open lower bound for block ranges
pub const BLOCK_ID_MIN: &str = "00000000-0000-0000-0000-000000000000";

/// Highest possible block ID, used as an open upper bound for block ranges
pub const BLOCK_ID_MAX: &str = "ffffffff-ffff-ffff-ffff-ffffffffffff";

/// Object encoding written by the current object decoder
pub const CURRENT_DATA_ENCODING: &str = "v1";

/// Compression applied to block pages and WAL records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Stored as-is
    #[default]
    None,
    /// LZ4 with a prepended length
    Lz4,
}

impl Encoding {
    /// Every supported encoding
    pub fn all() -> &'static [Encoding] {
        &[Encoding::None, Encoding::Lz4]
    }

    /// Name used in file names and metas
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::None => "none",
            Encoding::Lz4 => "lz4",
        }
    }

    /// Compress a buffer
    pub fn compress(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Encoding::None => data.to_vec(),
            Encoding::Lz4 => lz4_flex::compress_prepend_size(data),
        }
    }

    /// Decompress a buffer
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encoding::None => Ok(data.to_vec()),
            Encoding::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| SpanError::Compression(e.to_string())),
        }
    }
}

impl FromStr for Encoding {
    type Err = SpanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Encoding::None),
            "lz4" => Ok(Encoding::Lz4),
            other => Err(SpanError::Validation(format!("unknown encoding: {}", other))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Page layout of a complete block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockVersion {
    /// Row pages: id and object interleaved
    V1,
    /// Columnar pages: an id column followed by an object column
    #[default]
    V2,
}

impl BlockVersion {
    /// Every supported version
    pub fn all() -> &'static [BlockVersion] {
        &[BlockVersion::V1, BlockVersion::V2]
    }

    /// Name used in file names and metas
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockVersion::V1 => "v1",
            BlockVersion::V2 => "v2",
        }
    }
}

impl FromStr for BlockVersion {
    type Err = SpanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v1" => Ok(BlockVersion::V1),
            "v2" => Ok(BlockVersion::V2),
            other => Err(SpanError::Validation(format!("unknown block version: {}", other))),
        }
    }
}

impl fmt::Display for BlockVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time range in unix seconds, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start (inclusive)
    pub start: i64,
    /// End (inclusive)
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Duration in seconds
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

/// Metadata of one block, stored as `meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Page layout
    pub version: BlockVersion,
    /// Globally unique, never reused
    pub block_id: Uuid,
    pub tenant_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_objects: u64,
    /// Size of the `data` object in bytes
    pub size: u64,
    pub compaction_level: u8,
    /// Page compression
    pub encoding: Encoding,
    /// Object encoding understood by the object decoder
    pub data_encoding: String,
    pub min_id: Vec<u8>,
    pub max_id: Vec<u8>,
    pub bloom_shard_count: u16,
    /// Length of the serialized footer inside `data`
    pub footer_size: u32,
}

impl BlockMeta {
    /// Create an empty meta
    pub fn new(
        tenant_id: impl Into<String>,
        block_id: Uuid,
        version: BlockVersion,
        encoding: Encoding,
        data_encoding: impl Into<String>,
    ) -> Self {
        Self {
            version,
            block_id,
            tenant_id: tenant_id.into(),
            start_time: DateTime::<Utc>::default(),
            end_time: DateTime::<Utc>::default(),
            total_objects: 0,
            size: 0,
            compaction_level: 0,
            encoding,
            data_encoding: data_encoding.into(),
            min_id: Vec::new(),
            max_id: Vec::new(),
            bloom_shard_count: 0,
            footer_size: 0,
        }
    }

    /// Extend ID and time bounds with a newly added object
    pub fn object_added(&mut self, id: &[u8], start: i64, end: i64) {
        if start > 0 && (self.start_time.timestamp() == 0 || start < self.start_time.timestamp()) {
            self.start_time = unix_to_time(start);
        }
        if end > self.end_time.timestamp() {
            self.end_time = unix_to_time(end);
        }

        if self.total_objects == 0 || id < self.min_id.as_slice() {
            self.min_id = id.to_vec();
        }
        if self.total_objects == 0 || id > self.max_id.as_slice() {
            self.max_id = id.to_vec();
        }
        self.total_objects += 1;
    }

    /// Block time range in unix seconds
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start_time.timestamp(), self.end_time.timestamp())
    }

    /// Check if an ID is within `[min_id, max_id]`
    pub fn contains_id(&self, id: &[u8]) -> bool {
        self.total_objects > 0 && id >= self.min_id.as_slice() && id <= self.max_id.as_slice()
    }

    /// Retire the block
    pub fn into_compacted(self, compacted_time: DateTime<Utc>) -> CompactedBlockMeta {
        CompactedBlockMeta {
            meta: self,
            compacted_time,
        }
    }
}

/// Metadata of a block retired by compaction or retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactedBlockMeta {
    #[serde(flatten)]
    pub meta: BlockMeta,
    pub compacted_time: DateTime<Utc>,
}

impl std::ops::Deref for CompactedBlockMeta {
    type Target = BlockMeta;

    fn deref(&self) -> &BlockMeta {
        &self.meta
    }
}

/// Parse one end of a block ID range
pub fn parse_block_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| SpanError::Validation(format!("invalid block id {}: {}", s, e)))
}

/// Convert unix seconds to a UTC time, saturating to the epoch when out of range
pub fn unix_to_time(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
