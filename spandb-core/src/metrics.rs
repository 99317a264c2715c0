//! Prometheus metrics
//!
//! All metrics live on a caller-supplied [`Registry`]; components receive an
//! `Arc<Metrics>` through their constructors.

use crate::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};

/// Engine metrics
pub struct Metrics {
    /// Objects whose start/end was clamped into the ingestion slack window
    pub slack_clamped_objects: IntCounterVec,
    /// Head blocks cut into completing blocks
    pub blocks_cut: IntCounterVec,
    /// Blocks copied to the remote backend
    pub blocks_flushed: IntCounterVec,
    /// Failed flush attempts
    pub flush_failures: IntCounterVec,
    /// Flush operations waiting in the queue
    pub flush_queue_length: IntGauge,
    /// Blocks recovered from the WAL on startup
    pub wal_replayed_blocks: IntCounter,

    /// Active blocks per tenant
    pub blocklist_length: IntGaugeVec,
    /// Compacted blocks per tenant
    pub compacted_blocklist_length: IntGaugeVec,
    /// Duration of a full blocklist poll
    pub poll_duration: Histogram,
    /// Tenants that failed to poll
    pub poll_errors: IntCounter,

    /// Compaction outcomes by result label
    pub compactions: IntCounterVec,
    /// Objects written by compaction, by output level
    pub compacted_objects: IntCounterVec,
    /// Duration of one compaction job
    pub compaction_duration: HistogramVec,
    /// Blocks marked compacted by retention
    pub retention_marked: IntCounter,
    /// Compacted blocks deleted by retention
    pub retention_deleted: IntCounter,

    /// Blocks read during finds
    pub find_blocks_queried: IntCounter,
    /// Blocks that failed during finds
    pub find_failed_blocks: IntCounter,
    /// Bytes read from the backend by the block reader stack
    pub backend_bytes_read: IntCounter,

    /// Cache write-back batches waiting in the queue
    pub cache_queue_length: IntGauge,
    /// Cache write-back batches dropped because the queue was full
    pub cache_dropped_writes: IntCounter,
    /// Cache lookups by result label
    pub cache_requests: IntCounterVec,
}

impl Metrics {
    /// Create and register all metrics on `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let m = Self {
            slack_clamped_objects: IntCounterVec::new(
                Opts::new("spandb_ingestion_slack_clamped_total", "Objects clamped to the ingestion slack window"),
                &["tenant"],
            )?,
            blocks_cut: IntCounterVec::new(
                Opts::new("spandb_ingester_blocks_cut_total", "Head blocks cut"),
                &["tenant"],
            )?,
            blocks_flushed: IntCounterVec::new(
                Opts::new("spandb_ingester_blocks_flushed_total", "Blocks flushed to the backend"),
                &["tenant"],
            )?,
            flush_failures: IntCounterVec::new(
                Opts::new("spandb_ingester_flush_failures_total", "Failed flush attempts"),
                &["tenant"],
            )?,
            flush_queue_length: IntGauge::new("spandb_ingester_flush_queue_length", "Queued flush operations")?,
            wal_replayed_blocks: IntCounter::new("spandb_wal_replayed_blocks_total", "Blocks replayed from the WAL")?,

            blocklist_length: IntGaugeVec::new(
                Opts::new("spandb_blocklist_length", "Active blocks per tenant"),
                &["tenant"],
            )?,
            compacted_blocklist_length: IntGaugeVec::new(
                Opts::new("spandb_blocklist_compacted_length", "Compacted blocks per tenant"),
                &["tenant"],
            )?,
            poll_duration: Histogram::with_opts(HistogramOpts::new(
                "spandb_blocklist_poll_duration_seconds",
                "Blocklist poll duration",
            ))?,
            poll_errors: IntCounter::new("spandb_blocklist_poll_errors_total", "Tenant poll failures")?,

            compactions: IntCounterVec::new(
                Opts::new("spandb_compactions_total", "Compaction jobs by outcome"),
                &["outcome"],
            )?,
            compacted_objects: IntCounterVec::new(
                Opts::new("spandb_compaction_objects_written_total", "Objects written by compaction"),
                &["level"],
            )?,
            compaction_duration: HistogramVec::new(
                HistogramOpts::new("spandb_compaction_duration_seconds", "Compaction job duration"),
                &["level"],
            )?,
            retention_marked: IntCounter::new("spandb_retention_marked_total", "Blocks marked compacted by retention")?,
            retention_deleted: IntCounter::new("spandb_retention_deleted_total", "Compacted blocks deleted")?,

            find_blocks_queried: IntCounter::new("spandb_find_blocks_queried_total", "Blocks searched by ID")?,
            find_failed_blocks: IntCounter::new("spandb_find_failed_blocks_total", "Blocks that failed during a find")?,
            backend_bytes_read: IntCounter::new("spandb_backend_bytes_read_total", "Bytes read from block data objects")?,

            cache_queue_length: IntGauge::new("spandb_cache_background_queue_length", "Queued cache write-backs")?,
            cache_dropped_writes: IntCounter::new(
                "spandb_cache_background_dropped_total",
                "Cache write-back batches dropped on a full queue",
            )?,
            cache_requests: IntCounterVec::new(
                Opts::new("spandb_cache_requests_total", "Cache lookups by result"),
                &["result"],
            )?,
        };

        registry.register(Box::new(m.slack_clamped_objects.clone()))?;
        registry.register(Box::new(m.blocks_cut.clone()))?;
        registry.register(Box::new(m.blocks_flushed.clone()))?;
        registry.register(Box::new(m.flush_failures.clone()))?;
        registry.register(Box::new(m.flush_queue_length.clone()))?;
        registry.register(Box::new(m.wal_replayed_blocks.clone()))?;
        registry.register(Box::new(m.blocklist_length.clone()))?;
        registry.register(Box::new(m.compacted_blocklist_length.clone()))?;
        registry.register(Box::new(m.poll_duration.clone()))?;
        registry.register(Box::new(m.poll_errors.clone()))?;
        registry.register(Box::new(m.compactions.clone()))?;
        registry.register(Box::new(m.compacted_objects.clone()))?;
        registry.register(Box::new(m.compaction_duration.clone()))?;
        registry.register(Box::new(m.retention_marked.clone()))?;
        registry.register(Box::new(m.retention_deleted.clone()))?;
        registry.register(Box::new(m.find_blocks_queried.clone()))?;
        registry.register(Box::new(m.find_failed_blocks.clone()))?;
        registry.register(Box::new(m.backend_bytes_read.clone()))?;
        registry.register(Box::new(m.cache_queue_length.clone()))?;
        registry.register(Box::new(m.cache_dropped_writes.clone()))?;
        registry.register(Box::new(m.cache_requests.clone()))?;

        Ok(m)
    }

    /// Metrics on a private registry, for tests and tools
    pub fn unregistered() -> Self {
        // Registration only fails on duplicate names, which a fresh registry cannot have
        match Self::new(&Registry::new()) {
            Ok(m) => m,
            Err(e) => unreachable!("fresh registry rejected metrics: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics.blocks_cut.with_label_values(&["t1"]).inc();
        metrics.cache_dropped_writes.inc();

        let names: Vec<String> = registry.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"spandb_ingester_blocks_cut_total".to_string()));
        assert!(names.contains(&"spandb_cache_background_dropped_total".to_string()));

        // Same names on the same registry are rejected
        assert!(Metrics::new(&registry).is_err());
    }
}
