//! Byte caches
//!
//! A cache is best effort: a miss is never an error and a failed store is
//! silently forgotten.

mod background;

pub use background::{BackgroundCache, BackgroundConfig, FullQueuePolicy};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Result of a cache lookup
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FetchResult {
    /// Keys that were found, in input order
    pub found: Vec<String>,
    /// Values for `found`, same order
    pub values: Vec<Bytes>,
    /// Keys that were not found, in input order
    pub missing: Vec<String>,
}

/// Generic byte-keyed cache
#[async_trait]
pub trait Cache: Send + Sync {
    /// Associate each key with its value
    async fn store(&self, keys: Vec<String>, values: Vec<Bytes>);

    /// Look up keys; every key ends up in exactly one of `found` or `missing`
    async fn fetch(&self, keys: &[String]) -> FetchResult;

    /// Release background resources
    async fn stop(&self) {}
}

/// Memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Total value bytes kept before evicting least recently used entries
    pub max_size_bytes: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 256 * 1024 * 1024,
        }
    }
}

/// In-process LRU cache bounded by value bytes
pub struct MemoryCache {
    max_size_bytes: usize,
    inner: Mutex<MemoryCacheInner>,
}

struct MemoryCacheInner {
    entries: LruCache<String, Bytes>,
    size_bytes: usize,
}

impl MemoryCache {
    /// Create a new memory cache
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            max_size_bytes: config.max_size_bytes,
            inner: Mutex::new(MemoryCacheInner {
                entries: LruCache::unbounded(),
                size_bytes: 0,
            }),
        }
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total cached value bytes
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size_bytes
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn store(&self, keys: Vec<String>, values: Vec<Bytes>) {
        let mut inner = self.inner.lock();
        for (key, value) in keys.into_iter().zip(values) {
            // Values larger than the whole cache would evict everything else
            if value.len() > self.max_size_bytes {
                continue;
            }
            let added = value.len();
            if let Some(old) = inner.entries.put(key, value) {
                inner.size_bytes -= old.len();
            }
            inner.size_bytes += added;

            while inner.size_bytes > self.max_size_bytes {
                match inner.entries.pop_lru() {
                    Some((_, evicted)) => inner.size_bytes -= evicted.len(),
                    None => break,
                }
            }
        }
    }

    async fn fetch(&self, keys: &[String]) -> FetchResult {
        let mut inner = self.inner.lock();
        let mut result = FetchResult::default();
        for key in keys {
            match inner.entries.get(key) {
                Some(value) => {
                    result.found.push(key.clone());
                    result.values.push(value.clone());
                }
                None => result.missing.push(key.clone()),
            }
        }
        result
    }
}
