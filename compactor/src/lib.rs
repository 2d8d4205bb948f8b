//! The compactor: merges small blocks into larger ones, removes the span
//! duplicates replication produced, enforces retention, and sweeps orphaned
//! uploads.
//!
//! A single leader (elected through the ring) plans jobs and owns tombstone
//! writes; workers execute merge jobs under expiring leases. Output blocks
//! are published atomically (`meta.json` last), then the inputs are
//! tombstoned and physically deleted only after a grace period so queriers
//! mid-read never observe removal.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use block_file::BlockConfig;
use data_types::TenantId;
use largo_catalog::BlockCatalog;
use largo_ring::{MemberId, Ring};
use largo_time::TimeProvider;
use metric::{Metric, U64Counter};
use observability_deps::tracing::{error, info};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

mod exec;
mod plan;

pub use exec::{Error, Result};
pub use plan::{plan_tenant, CompactionJob, JobScheduler, PlanConfig};

/// The ring key whose single owner is the compaction scheduler leader.
const SCHEDULER_LEADER_KEY: &[u8] = b"compaction-scheduler";

/// Compactor knobs.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Maximum input blocks merged per job.
    pub input_blocks_per_job: usize,
    /// Target combined input size per job.
    pub job_target_bytes: u64,
    /// Time between tombstoning a block and deleting its bytes. Must
    /// exceed the longest expected query duration.
    pub grace_period: Duration,
    /// Retention applied to tenants without an override. `None` keeps data
    /// forever.
    pub default_retention: Option<Duration>,
    /// Per-tenant retention overrides.
    pub retention_per_tenant: HashMap<TenantId, Duration>,
    /// Unpublished uploads older than this are swept.
    pub orphan_age: Duration,
    /// Worker lease duration for one job.
    pub lease_duration: Duration,
    /// Layout of output blocks.
    pub block: BlockConfig,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            input_blocks_per_job: 4,
            job_target_bytes: 1024 * 1024 * 1024,
            grace_period: Duration::from_secs(3600),
            default_retention: None,
            retention_per_tenant: HashMap::new(),
            orphan_age: Duration::from_secs(6 * 3600),
            lease_duration: Duration::from_secs(300),
            block: BlockConfig::default(),
        }
    }
}

/// The compactor of one process.
#[derive(Debug)]
pub struct Compactor {
    pub(crate) config: CompactorConfig,
    pub(crate) catalog: Arc<BlockCatalog>,
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    ring: Arc<Ring>,
    member_id: MemberId,
    scheduler: JobScheduler,

    pub(crate) job_count: Metric<U64Counter>,
    pub(crate) retention_count: Metric<U64Counter>,
    pub(crate) orphan_count: Metric<U64Counter>,
}

impl Compactor {
    /// Create a compactor participating in `ring` as `member_id`.
    pub fn new(
        config: CompactorConfig,
        catalog: Arc<BlockCatalog>,
        ring: Arc<Ring>,
        member_id: MemberId,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Self {
        let scheduler = JobScheduler::new(Arc::clone(&time_provider), config.lease_duration);
        Self {
            config,
            catalog,
            time_provider,
            ring,
            member_id,
            scheduler,
            job_count: metric_registry
                .register_metric("compactor_job_count", "compaction job outcomes"),
            retention_count: metric_registry.register_metric(
                "compactor_retention_blocks",
                "blocks tombstoned by retention, per tenant",
            ),
            orphan_count: metric_registry.register_metric(
                "compactor_swept_orphans",
                "unpublished block directories swept, per tenant",
            ),
        }
    }

    /// True if this process currently owns the scheduler role.
    pub fn is_leader(&self) -> bool {
        self.ring.is_leader(&self.member_id, SCHEDULER_LEADER_KEY)
    }

    /// The job scheduler (leader fills it, workers drain it).
    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    fn retention_for(&self, tenant: &TenantId) -> Option<Duration> {
        self.config
            .retention_per_tenant
            .get(tenant)
            .copied()
            .or(self.config.default_retention)
    }

    /// One leader pass: refresh the catalog, plan merge jobs, apply
    /// retention, delete expired tombstones, sweep orphans.
    pub async fn leader_pass(&self) -> Result<()> {
        self.catalog
            .refresh_all()
            .await
            .map_err(|source| Error::Catalog { source })?;
        self.scheduler.release_expired();

        let plan_config = PlanConfig {
            input_blocks_per_job: self.config.input_blocks_per_job,
            job_target_bytes: self.config.job_target_bytes,
        };
        for tenant in self.catalog.tenants() {
            let blocks = self.catalog.visible_blocks(&tenant);
            self.scheduler
                .offer(plan_tenant(&tenant, blocks, &plan_config));
        }

        self.apply_retention().await?;
        self.delete_expired().await?;
        self.sweep_orphans().await?;
        Ok(())
    }

    /// One worker pass: drain and execute leased jobs.
    pub async fn worker_pass(&self, cancel: &CancellationToken) {
        while let Some(job) = self.scheduler.acquire(self.member_id.as_str()) {
            match self.execute(&job, cancel).await {
                Ok(_) => {}
                Err(e) => {
                    self.job_count.recorder(&[("outcome", "error")]).inc(1);
                    error!(error=%e, job=%job.key(), "compaction job failed");
                }
            }
            // completion (or abandonment) releases the lease either way; a
            // failed input set is re-planned on the next leader pass
            self.scheduler.complete(&job);
            if cancel.is_cancelled() {
                return;
            }
        }
    }
}

/// Interval between compaction passes.
const PASS_INTERVAL: Duration = Duration::from_secs(30);

/// Run leader and worker passes until shutdown.
pub async fn run_compactor_loop(compactor: Arc<Compactor>, shutdown: CancellationToken) {
    loop {
        if compactor.is_leader() {
            if let Err(e) = compactor.leader_pass().await {
                error!(error=%e, "compaction leader pass failed");
            }
        }
        compactor.worker_pass(&shutdown).await;

        tokio::select! {
            _ = tokio::time::sleep(PASS_INTERVAL) => {}
            _ = shutdown.cancelled() => {
                info!("compactor loop shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_file::{encode_block, BlockStore, EncodedBlock};
    use data_types::{
        BlockId, CompactionLevel, Resource, Span, SpanId, SpanKind, SpanStatus, TraceId, TraceRow,
    };
    use largo_ring::{MemberState, RingConfig};
    use largo_time::{MockProvider, Time};
    use object_store::memory::InMemory;
    use std::collections::BTreeSet;

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn span(trace_n: u8, span_n: u8) -> Span {
        Span {
            trace_id: TraceId::new([trace_n; 16]),
            span_id: SpanId::new([span_n; 8]),
            parent_span_id: None,
            name: format!("op-{span_n}").into(),
            kind: SpanKind::Internal,
            start_unix_nanos: trace_n as i64 * 1_000,
            end_unix_nanos: trace_n as i64 * 1_000 + 10,
            status: SpanStatus::default(),
            attributes: vec![],
            events: vec![],
            links: vec![],
        }
    }

    fn rows(traces: &[(u8, &[u8])]) -> Vec<TraceRow> {
        let mut rows: Vec<TraceRow> = traces
            .iter()
            .map(|(trace_n, span_ns)| {
                let mut row = TraceRow::new(TraceId::new([*trace_n; 16]));
                row.push_spans(
                    &Resource {
                        service_name: "svc".into(),
                        attributes: vec![],
                    },
                    span_ns.iter().map(|s| span(*trace_n, *s)),
                );
                row
            })
            .collect();
        rows.sort_by_key(|r| r.trace_id);
        rows
    }

    struct Fixture {
        compactor: Compactor,
        store: BlockStore,
        time_provider: Arc<MockProvider>,
    }

    fn fixture(config: CompactorConfig) -> Fixture {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let registry = metric::Registry::new();
        let store = BlockStore::new(Arc::new(InMemory::new()));
        let catalog = Arc::new(BlockCatalog::new(store.clone(), &registry));
        let ring = Arc::new(Ring::new(
            RingConfig::default(),
            Arc::clone(&time_provider) as _,
            &registry,
        ));
        let member_id = MemberId::new("compactor-0");
        ring.join(member_id.clone(), "compactor-0:8080");
        ring.set_state(&member_id, MemberState::Active);

        let compactor = Compactor::new(
            config,
            catalog,
            ring,
            member_id,
            Arc::clone(&time_provider) as _,
            &registry,
        );
        Fixture {
            compactor,
            store,
            time_provider,
        }
    }

    async fn publish(fixture: &Fixture, rows: Vec<TraceRow>, level: CompactionLevel) -> EncodedBlock {
        let block = encode_block(
            tenant(),
            BlockId::new(),
            level,
            rows,
            &BlockConfig::default(),
        )
        .unwrap();
        fixture.store.publish(&block).await.unwrap();
        block
    }

    async fn span_set(fixture: &Fixture, meta: &data_types::BlockMeta) -> BTreeSet<(TraceId, SpanId, u64)> {
        let reader = fixture.store.reader(&tenant(), &meta.id).await.unwrap();
        let mut set = BTreeSet::new();
        for i in 0..reader.row_group_count() {
            for row in reader.read_row_group(i).await.unwrap() {
                for batch in &row.batches {
                    for span in &batch.spans {
                        set.insert((row.trace_id, span.span_id, span.attributes_hash()));
                    }
                }
            }
        }
        set
    }

    #[tokio::test]
    async fn merge_dedups_replica_duplicates() {
        let fixture = fixture(CompactorConfig::default());
        // two replicas flushed the same 3 spans of trace 1; replica b also
        // has an extra span of trace 2
        let a = publish(
            &fixture,
            rows(&[(1, &[1, 2, 3])]),
            CompactionLevel::INITIAL,
        )
        .await;
        let b = publish(
            &fixture,
            rows(&[(1, &[1, 2, 3]), (2, &[1])]),
            CompactionLevel::INITIAL,
        )
        .await;
        fixture.compactor.catalog.refresh_all().await.unwrap();

        let job = CompactionJob {
            tenant: tenant(),
            inputs: vec![a.meta.clone(), b.meta.clone()],
        };
        let output = fixture
            .compactor
            .execute(&job, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.compaction_level, CompactionLevel::new(1));
        assert_eq!(output.trace_count, 2);
        assert_eq!(output.span_count, 4, "duplicates collapsed");

        // inputs are tombstoned, output is the only visible block
        let visible = fixture.compactor.catalog.visible_blocks(&tenant());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, output.id);
    }

    #[tokio::test]
    async fn compaction_is_associative_on_content() {
        let config = CompactorConfig::default();

        // build the same three blocks in two fixtures
        let left = fixture(config.clone());
        let right = fixture(config);
        let mut left_metas = vec![];
        let mut right_metas = vec![];
        for f in [&left, &right] {
            let metas = vec![
                publish(f, rows(&[(1, &[1, 2])]), CompactionLevel::INITIAL).await.meta,
                publish(f, rows(&[(1, &[2, 3]), (2, &[1])]), CompactionLevel::INITIAL).await.meta,
                publish(f, rows(&[(2, &[1, 2]), (3, &[1])]), CompactionLevel::INITIAL).await.meta,
            ];
            if std::ptr::eq(f, &left) {
                left_metas = metas;
            } else {
                right_metas = metas;
            }
        }
        left.compactor.catalog.refresh_all().await.unwrap();
        right.compactor.catalog.refresh_all().await.unwrap();
        let cancel = CancellationToken::new();

        // left: compact(compact(A, B), C)
        let ab = left
            .compactor
            .execute(
                &CompactionJob {
                    tenant: tenant(),
                    inputs: vec![left_metas[0].clone(), left_metas[1].clone()],
                },
                &cancel,
            )
            .await
            .unwrap();
        let ab_c = left
            .compactor
            .execute(
                &CompactionJob {
                    tenant: tenant(),
                    inputs: vec![ab, left_metas[2].clone()],
                },
                &cancel,
            )
            .await
            .unwrap();

        // right: compact(A, compact(B, C))
        let bc = right
            .compactor
            .execute(
                &CompactionJob {
                    tenant: tenant(),
                    inputs: vec![right_metas[1].clone(), right_metas[2].clone()],
                },
                &cancel,
            )
            .await
            .unwrap();
        let a_bc = right
            .compactor
            .execute(
                &CompactionJob {
                    tenant: tenant(),
                    inputs: vec![right_metas[0].clone(), bc],
                },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(
            span_set(&left, &ab_c).await,
            span_set(&right, &a_bc).await,
            "same deduped span set regardless of merge order"
        );
    }

    #[tokio::test]
    async fn retention_tombstones_then_grace_deletes() {
        let mut config = CompactorConfig::default();
        config.default_retention = Some(Duration::from_secs(60));
        config.grace_period = Duration::from_secs(30);
        let fixture = fixture(config);

        // block data ends at ~1000-1010ns, essentially at t=0
        let block = publish(&fixture, rows(&[(1, &[1])]), CompactionLevel::INITIAL).await;
        fixture.compactor.catalog.refresh_all().await.unwrap();

        // within retention: untouched
        fixture.compactor.apply_retention().await.unwrap();
        assert_eq!(fixture.compactor.catalog.visible_blocks(&tenant()).len(), 1);

        // beyond retention: tombstoned but bytes survive the grace period
        fixture.time_provider.inc(Duration::from_secs(120));
        fixture.compactor.apply_retention().await.unwrap();
        assert!(fixture.compactor.catalog.visible_blocks(&tenant()).is_empty());
        fixture.compactor.delete_expired().await.unwrap();
        assert!(fixture
            .store
            .fetch_meta(&tenant(), &block.meta.id)
            .await
            .is_ok());

        // grace over: physically deleted
        fixture.time_provider.inc(Duration::from_secs(31));
        fixture.compactor.delete_expired().await.unwrap();
        assert!(fixture
            .store
            .fetch_meta(&tenant(), &block.meta.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn orphan_sweep_removes_stale_unpublished_uploads() {
        let mut config = CompactorConfig::default();
        config.orphan_age = Duration::from_secs(60);
        let fixture = fixture(config);

        // a crashed upload: data object without meta.json
        let block = encode_block(
            tenant(),
            BlockId::new(),
            CompactionLevel::INITIAL,
            rows(&[(1, &[1])]),
            &BlockConfig::default(),
        )
        .unwrap();
        let path = block_file::block_object(&tenant(), &block.meta.id, block_file::DATA_OBJECT);
        fixture
            .store
            .object_store()
            .put(&path, block.data.clone())
            .await
            .unwrap();

        // too fresh to sweep (the in-memory store stamps objects with the
        // wall clock, so advance the mock far enough to clear any skew)
        fixture.compactor.sweep_orphans().await.unwrap();
        assert_eq!(
            fixture.store.list_block_ids(&tenant()).await.unwrap().len(),
            1
        );

        // the mock clock starts at 1970; jump past the real upload stamp
        // plus the orphan age
        fixture
            .time_provider
            .set(largo_time::SystemProvider::new().now() + Duration::from_secs(3600));
        fixture.compactor.sweep_orphans().await.unwrap();
        assert!(fixture.store.list_block_ids(&tenant()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_member_is_leader() {
        let fixture = fixture(CompactorConfig::default());
        assert!(fixture.compactor.is_leader());
    }

    #[tokio::test]
    async fn leader_pass_plans_and_worker_executes() {
        let mut config = CompactorConfig::default();
        config.input_blocks_per_job = 4;
        let fixture = fixture(config);

        publish(&fixture, rows(&[(1, &[1])]), CompactionLevel::INITIAL).await;
        publish(&fixture, rows(&[(1, &[2])]), CompactionLevel::INITIAL).await;

        fixture.compactor.leader_pass().await.unwrap();
        assert_eq!(fixture.compactor.scheduler().queued(), 1);

        fixture
            .compactor
            .worker_pass(&CancellationToken::new())
            .await;

        let visible = fixture.compactor.catalog.visible_blocks(&tenant());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].compaction_level, CompactionLevel::new(1));
        assert_eq!(visible[0].span_count, 2);
    }

    #[tokio::test]
    async fn cancelled_job_stops_merging() {
        let fixture = fixture(CompactorConfig::default());
        let a = publish(&fixture, rows(&[(1, &[1])]), CompactionLevel::INITIAL).await;
        let b = publish(&fixture, rows(&[(2, &[1])]), CompactionLevel::INITIAL).await;
        fixture.compactor.catalog.refresh_all().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fixture
            .compactor
            .execute(
                &CompactionJob {
                    tenant: tenant(),
                    inputs: vec![a.meta, b.meta],
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
