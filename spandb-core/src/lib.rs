//! SpanDB Core - Multi-Tenant Trace Block Storage Engine
//!
//! Stores ID-addressed trace objects for many tenants:
//! - Durable ingestion through a per-block write-ahead log
//! - Immutable, bloom-indexed blocks in an object-store style backend
//! - Background compaction and retention
//!
//! # Architecture
//!
//! - **WAL / Head block**: append-only file per block, replayed on restart
//! - **Block**: sealed columnar container (`data` + `bloom-N` + `meta.json`)
//! - **Ingester**: per-tenant manager that cuts, completes and flushes blocks
//! - **Blocklist**: polled, immutable snapshot of every tenant's block metas
//! - **Compactor**: merges small blocks and enforces retention
//! - **Reader stack**: byte-counting, magic-shortcut and section-caching readers

pub mod backend;
pub mod block;
pub mod blocklist;
pub mod cache;
pub mod compactor;
pub mod db;
pub mod ingester;
pub mod metrics;
pub mod model;
pub mod util;
pub mod wal;

mod error;
mod types;

pub use error::{Result, SpanError};
pub use types::*;

/// SpanDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Slack applied to block start/end times around wall-clock time
    pub const INGESTION_SLACK: Duration = Duration::from_secs(2 * 60);

    /// Blocklist poll interval
    pub const BLOCKLIST_POLL: Duration = Duration::from_secs(5 * 60);

    /// Compacted blocks stay searchable for this many poll intervals
    pub const COMPACTED_BLOCK_FRESHNESS_POLLS: u32 = 2;

    /// Bloom filter false positive rate
    pub const BLOOM_FP: f64 = 0.01;

    /// Target size of one bloom shard (100KB)
    pub const BLOOM_SHARD_SIZE_BYTES: usize = 100 * 1024;

    /// Upper bound on bloom shards per block
    pub const MAX_BLOOM_SHARDS: usize = 1000;

    /// Target uncompressed page size inside a block (1MB)
    pub const PAGE_SIZE_BYTES: usize = 1024 * 1024;

    /// Maximum size of a block produced by compaction (100MB)
    pub const CHUNK_SIZE_BYTES: u64 = 100 * 1024 * 1024;

    /// Maximum time span one compaction group may cover
    pub const MAX_COMPACTION_RANGE: Duration = Duration::from_secs(60 * 60);

    /// Head block size that forces a cut (500MB)
    pub const MAX_BLOCK_BYTES: u64 = 500 * 1024 * 1024;

    /// Head block age that forces a cut
    pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(30 * 60);

    /// Keys per background cache write-back batch
    pub const CACHE_WRITEBACK_BATCH: usize = 100;
}
