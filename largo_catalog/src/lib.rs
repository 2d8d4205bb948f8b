//! The per-tenant catalog of blocks.
//!
//! The source of truth is the object store itself: a block exists iff its
//! `meta.json` does. Every reader caches the listing and refreshes it
//! periodically; block metadata is immutable so only membership and
//! tombstones need re-checking. Tombstoned blocks disappear from the visible
//! set immediately while their bytes survive the grace period, and corrupt
//! blocks can be quarantined so queries stop touching them.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use block_file::BlockStore;
use data_types::{BlockId, BlockMeta, BlockTombstone, TenantId};
use metric::{Metric, U64Counter};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::RwLock;
use snafu::Snafu;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Errors raised while refreshing the catalog.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("block store error: {source}"))]
    Store { source: block_file::StoreError },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One catalog row: a block plus its tombstone, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockListEntry {
    /// The block's descriptor.
    pub meta: BlockMeta,
    /// Set once the compaction leader superseded the block.
    pub tombstone: Option<BlockTombstone>,
}

#[derive(Debug, Default)]
struct TenantState {
    entries: BTreeMap<BlockId, BlockListEntry>,
    quarantined: BTreeSet<BlockId>,
}

/// Cached, periodically refreshed view of every tenant's block list.
#[derive(Debug)]
pub struct BlockCatalog {
    store: BlockStore,
    state: RwLock<BTreeMap<TenantId, TenantState>>,
    poll_count: Metric<U64Counter>,
    quarantine_count: Metric<U64Counter>,
}

impl BlockCatalog {
    /// Create an empty catalog over `store`.
    pub fn new(store: BlockStore, metric_registry: &metric::Registry) -> Self {
        Self {
            store,
            state: Default::default(),
            poll_count: metric_registry
                .register_metric("catalog_poll_count", "block list refreshes by outcome"),
            quarantine_count: metric_registry.register_metric(
                "catalog_quarantined_blocks",
                "blocks excluded from queries after integrity errors",
            ),
        }
    }

    /// The block store this catalog lists.
    pub fn block_store(&self) -> &BlockStore {
        &self.store
    }

    /// Re-list one tenant from the object store.
    ///
    /// Metadata of known blocks is reused (blocks are immutable);
    /// tombstones are re-checked for entries that do not have one yet.
    pub async fn refresh_tenant(&self, tenant: &TenantId) -> Result<()> {
        let result = self.refresh_tenant_inner(tenant).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.poll_count.recorder(&[("outcome", outcome)]).inc(1);
        result
    }

    async fn refresh_tenant_inner(&self, tenant: &TenantId) -> Result<()> {
        let ids = self
            .store
            .list_block_ids(tenant)
            .await
            .map_err(|source| Error::Store { source })?;

        // figure out which blocks are new or still lack a tombstone, without
        // holding the lock across IO
        let (known, need_tombstone_check): (BTreeMap<BlockId, BlockListEntry>, Vec<BlockId>) = {
            let state = self.state.read();
            let tenant_state = state.get(tenant);
            let known = tenant_state
                .map(|s| s.entries.clone())
                .unwrap_or_default();
            let need = known
                .values()
                .filter(|e| e.tombstone.is_none())
                .map(|e| e.meta.id)
                .collect();
            (known, need)
        };

        let mut entries = BTreeMap::new();
        for id in ids {
            match known.get(&id) {
                Some(entry) => {
                    let mut entry = entry.clone();
                    if need_tombstone_check.contains(&id) {
                        entry.tombstone = self
                            .store
                            .fetch_tombstone(tenant, &id)
                            .await
                            .map_err(|source| Error::Store { source })?;
                    }
                    entries.insert(id, entry);
                }
                None => {
                    // a directory without meta.json is an in-flight upload
                    // (or an orphan); skip it until it is published
                    let meta = match self.store.fetch_meta(tenant, &id).await {
                        Ok(meta) => meta,
                        Err(e) if e.is_not_found() => {
                            debug!(tenant=%tenant, block_id=%id, "unpublished block dir, skipping");
                            continue;
                        }
                        Err(source) => return Err(Error::Store { source }),
                    };
                    let tombstone = self
                        .store
                        .fetch_tombstone(tenant, &id)
                        .await
                        .map_err(|source| Error::Store { source })?;
                    entries.insert(id, BlockListEntry { meta, tombstone });
                }
            }
        }

        let mut state = self.state.write();
        let tenant_state = state.entry(tenant.clone()).or_default();
        tenant_state.entries = entries;
        Ok(())
    }

    /// Refresh the set of known tenants and each tenant's block list.
    pub async fn refresh_all(&self) -> Result<()> {
        let tenants = self
            .store
            .list_tenants()
            .await
            .map_err(|source| Error::Store { source })?;
        for tenant in tenants {
            self.refresh_tenant(&tenant).await?;
        }
        Ok(())
    }

    /// Tenants currently present in the cache.
    pub fn tenants(&self) -> Vec<TenantId> {
        self.state.read().keys().cloned().collect()
    }

    /// Blocks eligible for queries: published, not tombstoned, not
    /// quarantined.
    pub fn visible_blocks(&self, tenant: &TenantId) -> Vec<BlockMeta> {
        let state = self.state.read();
        let Some(tenant_state) = state.get(tenant) else {
            return vec![];
        };
        tenant_state
            .entries
            .values()
            .filter(|e| e.tombstone.is_none() && !tenant_state.quarantined.contains(&e.meta.id))
            .map(|e| e.meta.clone())
            .collect()
    }

    /// Every cached entry, including tombstoned blocks. Compaction planning
    /// and deletion need the full view.
    pub fn all_entries(&self, tenant: &TenantId) -> Vec<BlockListEntry> {
        let state = self.state.read();
        state
            .get(tenant)
            .map(|s| s.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Exclude a corrupt block from queries on this node.
    pub fn mark_bad(&self, tenant: &TenantId, block_id: &BlockId) {
        warn!(tenant=%tenant, %block_id, "quarantining block after integrity error");
        let mut state = self.state.write();
        state
            .entry(tenant.clone())
            .or_default()
            .quarantined
            .insert(*block_id);
        drop(state);
        self.quarantine_count
            .recorder(&[("reason", "integrity")])
            .inc(1);
    }

    /// True if the block was quarantined on this node.
    pub fn is_quarantined(&self, tenant: &TenantId, block_id: &BlockId) -> bool {
        self.state
            .read()
            .get(tenant)
            .map(|s| s.quarantined.contains(block_id))
            .unwrap_or(false)
    }

    /// Drop a block from the cache immediately (e.g. after deleting it).
    pub fn forget(&self, tenant: &TenantId, block_id: &BlockId) {
        let mut state = self.state.write();
        if let Some(tenant_state) = state.get_mut(tenant) {
            tenant_state.entries.remove(block_id);
            tenant_state.quarantined.remove(block_id);
        }
    }
}

/// Periodically refresh all tenants until shutdown.
pub async fn run_poll_loop(
    catalog: Arc<BlockCatalog>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if let Err(e) = catalog.refresh_all().await {
            warn!(error=%e, "block list refresh failed, keeping cached view");
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.cancelled() => {
                info!("catalog poll loop shutting down");
                return;
            }
        }
    }
}
