//! Background write-back cache
//!
//! `store` only enqueues; a fixed pool of workers drains a bounded queue into
//! the wrapped cache. What happens when the queue is full is decided by
//! [`FullQueuePolicy`].

use super::{Cache, FetchResult};
use crate::config::CACHE_WRITEBACK_BATCH;
use crate::metrics::Metrics;
use crate::{Result, SpanError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Behaviour of `store` when the write-back queue is full. There is no
/// default; operators pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullQueuePolicy {
    /// Wait for queue space
    Block,
    /// Drop the batch and count it
    Drop,
}

/// Background cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Worker tasks draining the queue
    pub writeback_workers: usize,
    /// Queue capacity in batches
    pub writeback_buffer: usize,
    /// Unset until configured; see [`BackgroundConfig::policy`]
    pub full_queue_policy: Option<FullQueuePolicy>,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            writeback_workers: 10,
            writeback_buffer: 10_000,
            full_queue_policy: None,
        }
    }
}

impl BackgroundConfig {
    /// The configured full-queue policy, or a config error when none was set
    pub fn policy(&self) -> Result<FullQueuePolicy> {
        self.full_queue_policy.ok_or_else(|| {
            SpanError::Config("cache full_queue_policy must be set to \"block\" or \"drop\"".to_string())
        })
    }
}

struct WriteBatch {
    keys: Vec<String>,
    values: Vec<Bytes>,
}

/// Shared between the cache handle and its workers
struct Pending {
    batches: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn done(&self) {
        if self.batches.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Write-back wrapper around another cache
pub struct BackgroundCache {
    inner: Arc<dyn Cache>,
    tx: mpsc::Sender<WriteBatch>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WriteBatch>>>,
    policy: FullQueuePolicy,
    pending: Arc<Pending>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl BackgroundCache {
    /// Wrap `inner` and start the workers. Must be called inside a Tokio runtime.
    pub fn new(
        inner: Arc<dyn Cache>,
        config: &BackgroundConfig,
        policy: FullQueuePolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<WriteBatch>(config.writeback_buffer.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending = Arc::new(Pending {
            batches: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let shutdown = CancellationToken::new();

        let workers = (0..config.writeback_workers.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                let inner = Arc::clone(&inner);
                let pending = Arc::clone(&pending);
                let shutdown = shutdown.clone();
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    loop {
                        let batch = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            batch = async { rx.lock().await.recv().await } => batch,
                        };
                        let Some(batch) = batch else { break };
                        metrics.cache_queue_length.dec();
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                pending.done();
                                break;
                            }
                            _ = inner.store(batch.keys, batch.values) => {}
                        }
                        pending.done();
                    }
                })
            })
            .collect();

        Self {
            inner,
            tx,
            rx,
            policy,
            pending,
            shutdown,
            workers: Mutex::new(workers),
            metrics,
        }
    }

    /// Wait until every queued batch has been written
    pub async fn flush(&self) {
        loop {
            let notified = self.pending.idle.notified();
            if self.pending.batches.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn enqueued(&self) {
        self.pending.batches.fetch_add(1, Ordering::AcqRel);
        self.metrics.cache_queue_length.inc();
    }
}

#[async_trait]
impl Cache for BackgroundCache {
    async fn store(&self, mut keys: Vec<String>, mut values: Vec<Bytes>) {
        while !keys.is_empty() {
            let n = keys.len().min(CACHE_WRITEBACK_BATCH);
            let rest_keys = keys.split_off(n);
            let rest_values = values.split_off(n.min(values.len()));
            let batch = WriteBatch { keys, values };
            keys = rest_keys;
            values = rest_values;

            match self.policy {
                FullQueuePolicy::Block => {
                    self.enqueued();
                    if self.tx.send(batch).await.is_err() {
                        self.metrics.cache_queue_length.dec();
                        self.pending.done();
                        debug!("cache write-back queue closed");
                        return;
                    }
                }
                FullQueuePolicy::Drop => {
                    self.enqueued();
                    if let Err(e) = self.tx.try_send(batch) {
                        self.metrics.cache_queue_length.dec();
                        self.pending.done();
                        self.metrics.cache_dropped_writes.inc();
                        warn!(error = %e, "cache write-back queue full, dropping batch");
                    }
                }
            }
        }
    }

    async fn fetch(&self, keys: &[String]) -> FetchResult {
        self.inner.fetch(keys).await
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }

        // Whatever is still queued is abandoned so that `flush` returns
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut abandoned = 0;
        while let Ok(_batch) = rx.try_recv() {
            self.metrics.cache_queue_length.dec();
            self.pending.done();
            abandoned += 1;
        }
        if abandoned > 0 {
            debug!(batches = abandoned, "discarded queued cache write-backs on stop");
        }
        self.inner.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{check_miss, check_multiple, check_single, random_entries};
    use crate::cache::{MemoryCache, MemoryCacheConfig};
    use std::time::Duration;

    fn background(workers: usize, buffer: usize, policy: FullQueuePolicy) -> BackgroundCache {
        BackgroundCache::new(
            Arc::new(MemoryCache::new(MemoryCacheConfig::default())),
            &BackgroundConfig {
                writeback_workers: workers,
                writeback_buffer: buffer,
                full_queue_policy: Some(policy),
            },
            policy,
            Arc::new(Metrics::unregistered()),
        )
    }

    #[tokio::test]
    async fn test_background() {
        let cache = background(1, 100, FullQueuePolicy::Block);
        let (keys, values) = random_entries();
        cache.store(keys.clone(), values.clone()).await;
        cache.flush().await;

        check_single(&cache, &keys, &values).await;
        check_multiple(&cache, &keys, &values).await;
        check_miss(&cache).await;
        cache.stop().await;
    }

    /// Never completes a store, so the queue fills up
    struct StuckCache;

    #[async_trait]
    impl Cache for StuckCache {
        async fn store(&self, _keys: Vec<String>, _values: Vec<Bytes>) {
            std::future::pending::<()>().await;
        }

        async fn fetch(&self, keys: &[String]) -> FetchResult {
            FetchResult {
                missing: keys.to_vec(),
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_drop_policy_counts_dropped_batches() {
        let metrics = Arc::new(Metrics::unregistered());
        let cache = BackgroundCache::new(
            Arc::new(StuckCache),
            &BackgroundConfig {
                writeback_workers: 1,
                writeback_buffer: 1,
                full_queue_policy: Some(FullQueuePolicy::Drop),
            },
            FullQueuePolicy::Drop,
            Arc::clone(&metrics),
        );

        // 5 batches: one taken by the stuck worker, one queued, the rest dropped
        for i in 0..5 {
            cache.store(vec![i.to_string()], vec![Bytes::from_static(b"x")]).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(metrics.cache_dropped_writes.get(), 3);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let cache = Arc::new(background(1, 1, FullQueuePolicy::Block));
        let (keys, values) = random_entries();

        let store = {
            let cache = Arc::clone(&cache);
            let (keys, values) = (keys.clone(), values.clone());
            tokio::spawn(async move { cache.store(keys, values).await })
        };
        tokio::time::timeout(Duration::from_secs(5), store).await.unwrap().unwrap();
        cache.flush().await;

        check_multiple(cache.as_ref(), &keys, &values).await;
    }

    #[tokio::test]
    async fn test_flush_returns_after_stop() {
        let cache = BackgroundCache::new(
            Arc::new(StuckCache),
            &BackgroundConfig {
                writeback_workers: 1,
                writeback_buffer: 4,
                full_queue_policy: Some(FullQueuePolicy::Drop),
            },
            FullQueuePolicy::Drop,
            Arc::new(Metrics::unregistered()),
        );

        // one batch held by the stuck worker, the rest queued
        for i in 0..3 {
            cache.store(vec![i.to_string()], vec![Bytes::from_static(b"x")]).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.stop().await;

        tokio::time::timeout(Duration::from_secs(5), cache.flush())
            .await
            .expect("flush after stop must not hang");
    }

    #[test]
    fn test_unset_policy_is_rejected() {
        let config: BackgroundConfig = serde_json::from_str(r#"{"writeback_workers": 2}"#).unwrap();
        assert_eq!(config.writeback_workers, 2);
        assert!(matches!(config.policy(), Err(SpanError::Config(_))));

        let config: BackgroundConfig = serde_json::from_str(r#"{"full_queue_policy": "block"}"#).unwrap();
        assert_eq!(config.policy().unwrap(), FullQueuePolicy::Block);
    }
}
