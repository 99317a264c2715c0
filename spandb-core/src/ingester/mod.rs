//! Ingester
//!
//! Accepts objects per tenant into WAL-backed head blocks, cuts them into
//! completing blocks, completes those into a local backend and flushes
//! them to the remote backend through a bounded queue of flush jobs.

mod instance;

pub use instance::TenantBlockManager;

use crate::backend::{validate_tenant_id, BackendCompactor, BackendReader, LocalBackend};
use crate::block::{CompletingBlock, LocalBlock};
use crate::db::Db;
use crate::util::duration_format;
use crate::{Result, SpanError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cut-and-drain rounds `stop` runs before giving up on leftover head data
const STOP_SWEEPS: usize = 3;

/// Ingester configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngesterConfig {
    /// Root of the local backend holding complete, not yet expired blocks
    pub local_dir: PathBuf,
    /// Head block size that forces a cut
    pub max_block_bytes: u64,
    /// Head block idle time that forces a cut
    #[serde(with = "duration_format")]
    pub max_block_duration: Duration,
    /// Interval of the cut and cleanup sweep
    #[serde(with = "duration_format")]
    pub flush_check_period: Duration,
    /// Tasks working the flush queue
    pub concurrent_flushes: usize,
    /// Capacity of the flush queue
    pub flush_queue_size: usize,
    /// Attempts per block before a flush is abandoned
    pub max_flush_attempts: u32,
    /// Delay before the first retry, doubled on every further retry
    #[serde(with = "duration_format")]
    pub flush_backoff: Duration,
    /// How long flushed blocks stay in the local backend
    #[serde(with = "duration_format")]
    pub complete_block_timeout: Duration,
    /// Extra start-time slack for objects replayed from the WAL
    #[serde(with = "duration_format")]
    pub replay_start_slack: Duration,
    /// Largest accepted object, zero for no limit
    pub max_bytes_per_object: usize,
    /// Objects a head block may hold, zero for no limit
    pub max_objects_per_block: usize,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("data/local"),
            max_block_bytes: crate::config::MAX_BLOCK_BYTES,
            max_block_duration: crate::config::MAX_BLOCK_DURATION,
            flush_check_period: Duration::from_secs(10),
            concurrent_flushes: 4,
            flush_queue_size: 1024,
            max_flush_attempts: 5,
            flush_backoff: Duration::from_secs(1),
            complete_block_timeout: Duration::from_secs(15 * 60),
            replay_start_slack: crate::config::MAX_BLOCK_DURATION,
            max_bytes_per_object: 5 * 1024 * 1024,
            max_objects_per_block: 0,
        }
    }
}

/// A queued flush of one block
#[derive(Debug, Clone)]
struct FlushOp {
    tenant_id: String,
    block_id: Uuid,
    attempts: u32,
}

/// Multi-tenant ingester
pub struct Ingester {
    config: IngesterConfig,
    db: Arc<Db>,
    local: Arc<LocalBackend>,
    instances: RwLock<HashMap<String, Arc<TenantBlockManager>>>,

    flush_tx: mpsc::Sender<FlushOp>,
    flush_rx: tokio::sync::Mutex<mpsc::Receiver<FlushOp>>,
    /// Blocks queued, being flushed or waiting for a retry
    in_flight: Mutex<HashSet<Uuid>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Set when `stop` begins; pushes are refused from then on
    stopping: CancellationToken,
    shutdown: CancellationToken,
}

impl Ingester {
    /// Replay the WAL, rediscover local blocks and start the flush workers
    ///
    /// Every replayed block and every local block that never reached the
    /// remote backend is queued for flushing.
    pub async fn start(config: IngesterConfig, db: Arc<Db>) -> Result<Arc<Self>> {
        if config.concurrent_flushes == 0 {
            return Err(SpanError::Config("concurrent_flushes must be at least 1".into()));
        }

        let local = Arc::new(LocalBackend::new(&config.local_dir)?);
        let (flush_tx, flush_rx) = mpsc::channel(config.flush_queue_size.max(1));

        let ingester = Arc::new(Self {
            config,
            db,
            local,
            instances: RwLock::new(HashMap::new()),
            flush_tx,
            flush_rx: tokio::sync::Mutex::new(flush_rx),
            in_flight: Mutex::new(HashSet::new()),
            workers: Mutex::new(Vec::new()),
            stopping: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        });

        ingester.replay_wal()?;
        ingester.rediscover_local_blocks().await?;

        {
            let mut workers = ingester.workers.lock();
            for worker in 0..ingester.config.concurrent_flushes {
                let this = ingester.clone();
                workers.push(tokio::spawn(async move { this.flush_loop(worker).await }));
            }
        }

        for instance in ingester.instances() {
            let mut pending = instance.completing_block_ids();
            pending.extend(instance.unflushed_block_ids());
            for block_id in pending {
                ingester.enqueue(instance.tenant_id(), block_id).await;
            }
        }

        Ok(ingester)
    }

    pub fn config(&self) -> &IngesterConfig {
        &self.config
    }

    fn replay_wal(&self) -> Result<()> {
        let blocks = self.db.wal().rescan_blocks(self.config.replay_start_slack)?;
        for block in blocks {
            let tenant_id = block.meta().tenant_id.clone();
            self.instance(&tenant_id)
                .add_completing(CompletingBlock::from_replay(block));
            self.db.metrics().wal_replayed_blocks.inc();
        }
        Ok(())
    }

    /// Load complete blocks left in the local backend by a previous run
    ///
    /// Blocks without a meta were never completed and are deleted. A local
    /// block that also came back from the WAL is deleted as well; the WAL
    /// copy is completed again.
    async fn rediscover_local_blocks(&self) -> Result<()> {
        for tenant_id in self.local.tenants().await? {
            let instance = self.instance(&tenant_id);
            let replayed: HashSet<Uuid> = instance.completing_block_ids().into_iter().collect();

            for block_id in self.local.blocks(&tenant_id).await? {
                if replayed.contains(&block_id) {
                    warn!(tenant = %tenant_id, block_id = %block_id, "local block also in wal, keeping the wal copy");
                    self.local.clear_block(block_id, &tenant_id).await?;
                    continue;
                }

                let meta = match self.local.block_meta(block_id, &tenant_id).await {
                    Ok(meta) => meta,
                    Err(e) if e.is_not_found() => {
                        warn!(tenant = %tenant_id, block_id = %block_id, "removing incomplete local block");
                        self.local.clear_block(block_id, &tenant_id).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let block = LocalBlock::open(meta, self.local.clone(), self.db.metrics().clone()).await?;
                info!(
                    tenant = %tenant_id,
                    block_id = %block_id,
                    flushed = block.flushed_time().is_some(),
                    "rediscovered local block"
                );
                instance.add_local(block);
            }
        }
        Ok(())
    }

    /// Manager of a tenant, created on first use
    pub fn instance(&self, tenant_id: &str) -> Arc<TenantBlockManager> {
        if let Some(instance) = self.instances.read().get(tenant_id) {
            return instance.clone();
        }
        self.instances
            .write()
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(TenantBlockManager::new(
                    tenant_id,
                    self.db.clone(),
                    self.local.clone(),
                    self.config.max_bytes_per_object,
                    self.config.max_objects_per_block,
                ))
            })
            .clone()
    }

    /// Every tenant manager
    pub fn instances(&self) -> Vec<Arc<TenantBlockManager>> {
        self.instances.read().values().cloned().collect()
    }

    /// Accept one object for a tenant
    pub fn push(&self, tenant_id: &str, id: &[u8], object: &[u8], start: i64, end: i64) -> Result<()> {
        if self.stopping.is_cancelled() {
            return Err(SpanError::Cancelled);
        }
        validate_tenant_id(tenant_id)?;
        self.instance(tenant_id).push_bytes(id, object, start, end)
    }

    /// Find an object held by the ingester, `None` if no block has it
    pub async fn find_by_id(
        &self,
        tenant_id: &str,
        id: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        let instance = self.instances.read().get(tenant_id).cloned();
        match instance {
            Some(instance) => instance.find_by_id(id, cancel).await,
            None => Ok(None),
        }
    }

    /// Cut ready head blocks, queue them and expire old local blocks
    pub async fn sweep(&self, immediate: bool) {
        for instance in self.instances() {
            match instance.cut_block_if_ready(
                self.config.max_block_duration,
                self.config.max_block_bytes,
                immediate,
            ) {
                Ok(Some(block_id)) => self.enqueue(instance.tenant_id(), block_id).await,
                Ok(None) => {}
                Err(e) => error!(tenant = %instance.tenant_id(), error = %e, "failed to cut head block"),
            }

            if let Err(e) = instance.clear_flushed_blocks(self.config.complete_block_timeout).await {
                warn!(tenant = %instance.tenant_id(), error = %e, "failed to clear flushed blocks");
            }
        }
    }

    /// Sweep every `flush_check_period` until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.flush_check_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep(false).await,
            }
        }
        debug!("ingester sweep loop stopped");
    }

    /// Blocks queued or being flushed
    pub fn pending_flushes(&self) -> usize {
        self.in_flight.lock().len()
    }

    async fn enqueue(&self, tenant_id: &str, block_id: Uuid) {
        if !self.in_flight.lock().insert(block_id) {
            return;
        }
        let op = FlushOp {
            tenant_id: tenant_id.to_string(),
            block_id,
            attempts: 0,
        };
        self.send(op).await;
    }

    async fn send(&self, op: FlushOp) {
        let block_id = op.block_id;
        self.db.metrics().flush_queue_length.inc();
        if self.flush_tx.send(op).await.is_err() {
            self.db.metrics().flush_queue_length.dec();
            self.in_flight.lock().remove(&block_id);
            warn!(block_id = %block_id, "flush queue closed");
        }
    }

    async fn flush_loop(self: Arc<Self>, worker: usize) {
        loop {
            let op = {
                let mut rx = self.flush_rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    op = rx.recv() => op,
                }
            };
            let Some(op) = op else {
                break;
            };
            self.db.metrics().flush_queue_length.dec();
            self.handle_flush(op).await;
        }
        debug!(worker, "flush worker stopped");
    }

    async fn handle_flush(self: &Arc<Self>, mut op: FlushOp) {
        let instance = self.instance(&op.tenant_id);
        match instance.complete_block(op.block_id).await {
            Ok(()) => {
                debug!(tenant = %op.tenant_id, block_id = %op.block_id, "flushed block");
                self.in_flight.lock().remove(&op.block_id);
            }
            Err(e) => {
                op.attempts += 1;
                self.db
                    .metrics()
                    .flush_failures
                    .with_label_values(&[&op.tenant_id])
                    .inc();

                if op.attempts >= self.config.max_flush_attempts {
                    error!(
                        tenant = %op.tenant_id,
                        block_id = %op.block_id,
                        attempts = op.attempts,
                        error = %e,
                        "giving up on block flush"
                    );
                    self.in_flight.lock().remove(&op.block_id);
                    return;
                }

                let backoff = self.config.flush_backoff.saturating_mul(2u32.saturating_pow(op.attempts - 1));
                warn!(
                    tenant = %op.tenant_id,
                    block_id = %op.block_id,
                    attempts = op.attempts,
                    error = %e,
                    "block flush failed, retrying in {:?}",
                    backoff
                );
                let this = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = this.shutdown.cancelled() => {
                            this.in_flight.lock().remove(&op.block_id);
                        }
                        _ = tokio::time::sleep(backoff) => this.send(op).await,
                    }
                });
            }
        }
    }

    /// Cut every head block, wait for all flushes to finish and stop the
    /// flush workers
    ///
    /// Pushes are rejected once this is called.
    pub async fn stop(&self) {
        info!("stopping ingester");
        self.stopping.cancel();

        // a push that raced the flag may have opened a new head block
        for _ in 0..STOP_SWEEPS {
            self.sweep(true).await;
            while self.pending_flushes() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if !self.instances().iter().any(|i| i.has_head_data()) {
                break;
            }
        }

        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "flush worker panicked");
            }
        }
        info!("ingester stopped");
    }
}
