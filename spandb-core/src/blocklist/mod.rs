//! Per-tenant lists of block metas
//!
//! Readers clone an `Arc` to an immutable snapshot; writers build a new
//! snapshot and swap it in. A poll replaces whole tenants, while local
//! updates from compaction adjust a single tenant in between polls.

mod include;
mod poller;

pub use include::{include_block, include_compacted_block};
pub use poller::{PollResults, Poller};

use crate::{BlockMeta, CompactedBlockMeta};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Immutable view of every tenant's blocks
#[derive(Debug, Default)]
pub struct BlocklistSnapshot {
    metas: HashMap<String, Arc<Vec<BlockMeta>>>,
    compacted: HashMap<String, Arc<Vec<CompactedBlockMeta>>>,
}

impl BlocklistSnapshot {
    pub fn metas(&self, tenant_id: &str) -> Arc<Vec<BlockMeta>> {
        self.metas.get(tenant_id).cloned().unwrap_or_default()
    }

    pub fn compacted_metas(&self, tenant_id: &str) -> Arc<Vec<CompactedBlockMeta>> {
        self.compacted.get(tenant_id).cloned().unwrap_or_default()
    }
}

/// Shared blocklist
#[derive(Debug, Default)]
pub struct Blocklist {
    snapshot: RwLock<Arc<BlocklistSnapshot>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<BlocklistSnapshot> {
        self.snapshot.read().clone()
    }

    /// Active blocks of a tenant, start time ascending
    pub fn metas(&self, tenant_id: &str) -> Arc<Vec<BlockMeta>> {
        self.snapshot().metas(tenant_id)
    }

    /// Compacted blocks of a tenant
    pub fn compacted_metas(&self, tenant_id: &str) -> Arc<Vec<CompactedBlockMeta>> {
        self.snapshot().compacted_metas(tenant_id)
    }

    /// Tenants with at least one active or compacted block
    pub fn tenants(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut tenants: Vec<String> = snapshot
            .metas
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(t, _)| t.clone())
            .chain(
                snapshot
                    .compacted
                    .iter()
                    .filter(|(_, c)| !c.is_empty())
                    .map(|(t, _)| t.clone()),
            )
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        tenants.sort();
        tenants
    }

    /// Replace the blocklist with the results of a poll
    pub fn apply_poll_results(&self, results: PollResults) {
        let snapshot = BlocklistSnapshot {
            metas: results
                .metas
                .into_iter()
                .map(|(tenant, metas)| (tenant, Arc::new(metas)))
                .collect(),
            compacted: results
                .compacted
                .into_iter()
                .map(|(tenant, compacted)| (tenant, Arc::new(compacted)))
                .collect(),
        };
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// Apply a local change to one tenant
    ///
    /// Blocks in `remove` leave the active list, `add` joins it and
    /// `compacted_add` joins the compacted list.
    pub fn update(
        &self,
        tenant_id: &str,
        add: Vec<BlockMeta>,
        remove: &[Uuid],
        compacted_add: Vec<CompactedBlockMeta>,
    ) {
        let mut guard = self.snapshot.write();
        let current = guard.clone();

        let removed: HashSet<&Uuid> = remove.iter().collect();
        let mut metas: Vec<BlockMeta> = current
            .metas(tenant_id)
            .iter()
            .filter(|m| !removed.contains(&m.block_id))
            .cloned()
            .collect();
        let existing: HashSet<Uuid> = metas.iter().map(|m| m.block_id).collect();
        metas.extend(add.into_iter().filter(|m| !existing.contains(&m.block_id)));
        metas.sort_by_key(|m| m.start_time);

        let mut compacted: Vec<CompactedBlockMeta> = current.compacted_metas(tenant_id).as_ref().clone();
        let existing: HashSet<Uuid> = compacted.iter().map(|c| c.block_id).collect();
        compacted.extend(compacted_add.into_iter().filter(|c| !existing.contains(&c.block_id)));

        let mut next = BlocklistSnapshot {
            metas: current.metas.clone(),
            compacted: current.compacted.clone(),
        };
        next.metas.insert(tenant_id.to_string(), Arc::new(metas));
        next.compacted.insert(tenant_id.to_string(), Arc::new(compacted));
        *guard = Arc::new(next);
    }

    /// Drop retired blocks from the compacted list
    pub fn remove_compacted(&self, tenant_id: &str, remove: &[Uuid]) {
        let mut guard = self.snapshot.write();
        let current = guard.clone();
        let removed: HashSet<&Uuid> = remove.iter().collect();
        let compacted: Vec<CompactedBlockMeta> = current
            .compacted_metas(tenant_id)
            .iter()
            .filter(|c| !removed.contains(&c.block_id))
            .cloned()
            .collect();

        let mut next = BlocklistSnapshot {
            metas: current.metas.clone(),
            compacted: current.compacted.clone(),
        };
        next.compacted.insert(tenant_id.to_string(), Arc::new(compacted));
        *guard = Arc::new(next);
    }
}
