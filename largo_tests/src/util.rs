//! The in-process test cluster: N ingesters behind a ring, one
//! distributor, catalog, querier pool, frontend, and compactor, all over
//! one in-memory object store and one mock clock.

use async_trait::async_trait;
use block_file::{BlockConfig, BlockStore};
use compactor::{Compactor, CompactorConfig};
use data_types::{
    AttributeValue, Resource, Span, SpanBatch, SpanId, SpanKind, SpanStatus, TenantId, TimeRange,
    TraceId, TraceRow,
};
use distributor::{Distributor, DistributorConfig, SinkError, SpanSink, StaticSinks};
use ingester::{Ingester, IngesterConfig};
use largo_catalog::BlockCatalog;
use largo_ring::{MemberId, MemberState, Ring, RingConfig};
use largo_time::{MockProvider, Time, TimeProvider};
use object_store::memory::InMemory;
use parking_lot::RwLock;
use predicate::SpanPredicate;
use querier::{ConnectionError, IngesterConnection, Querier, QuerierConfig};
use query_frontend::{worker::run_querier_worker, FrontendConfig, QueryFrontend};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// One ingester slot: the instance can be swapped on restart and marked
/// dead to simulate a crash.
#[derive(Debug)]
pub struct IngesterSlot {
    pub member_id: MemberId,
    instance: RwLock<Arc<Ingester>>,
    dead: AtomicBool,
    wal_dir: Arc<tempfile::TempDir>,
}

impl IngesterSlot {
    /// The current instance.
    pub fn instance(&self) -> Arc<Ingester> {
        Arc::clone(&self.instance.read())
    }

    /// True if the slot currently simulates a crashed process.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct SlotSink(Arc<IngesterSlot>);

#[async_trait]
impl SpanSink for SlotSink {
    async fn write(&self, tenant: &TenantId, batch: SpanBatch) -> Result<(), SinkError> {
        if self.0.is_dead() {
            return Err(SinkError::Unavailable("ingester down".to_string()));
        }
        self.0.instance().write(tenant, batch).map_err(|e| match e {
            ingester::WriteError::Paused => SinkError::Capacity,
            other => SinkError::Unavailable(other.to_string()),
        })
    }
}

#[derive(Debug, Default)]
struct SlotConnection {
    slots: HashMap<MemberId, Arc<IngesterSlot>>,
}

impl SlotConnection {
    fn alive(&self, member: &MemberId) -> Result<Arc<Ingester>, ConnectionError> {
        let slot = self
            .slots
            .get(member)
            .ok_or_else(|| ConnectionError::Unreachable {
                member: member.to_string(),
                reason: "unknown member".to_string(),
            })?;
        if slot.is_dead() {
            return Err(ConnectionError::Unreachable {
                member: member.to_string(),
                reason: "ingester down".to_string(),
            });
        }
        Ok(slot.instance())
    }
}

#[async_trait]
impl IngesterConnection for SlotConnection {
    async fn trace_spans(
        &self,
        member: &MemberId,
        tenant: &TenantId,
        trace_id: &TraceId,
    ) -> Result<Option<TraceRow>, ConnectionError> {
        self.alive(member)?
            .trace_spans(tenant, trace_id)
            .await
            .map_err(|e| ConnectionError::Unreachable {
                member: member.to_string(),
                reason: e.to_string(),
            })
    }

    async fn search_spans(
        &self,
        member: &MemberId,
        tenant: &TenantId,
        predicate: &SpanPredicate,
        time_range: TimeRange,
    ) -> Result<Vec<TraceRow>, ConnectionError> {
        self.alive(member)?
            .search_spans(tenant, predicate, time_range)
            .await
            .map_err(|e| ConnectionError::Unreachable {
                member: member.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Cluster shape knobs.
#[derive(Debug, Clone)]
pub struct TestClusterConfig {
    pub ingesters: usize,
    pub replication_factor: usize,
    pub frontend_workers: usize,
    pub block: BlockConfig,
}

impl Default for TestClusterConfig {
    fn default() -> Self {
        Self {
            ingesters: 3,
            replication_factor: 3,
            frontend_workers: 2,
            block: BlockConfig::default(),
        }
    }
}

/// An in-process cluster of all components.
#[derive(Debug)]
pub struct TestCluster {
    pub time_provider: Arc<MockProvider>,
    pub metric_registry: Arc<metric::Registry>,
    pub store: BlockStore,
    pub ring: Arc<Ring>,
    pub slots: Vec<Arc<IngesterSlot>>,
    pub distributor: Arc<Distributor>,
    pub catalog: Arc<BlockCatalog>,
    pub frontend: QueryFrontend,
    pub compactor: Arc<Compactor>,
    shutdown: CancellationToken,
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TestCluster {
    /// Build and start a cluster.
    pub fn new(config: TestClusterConfig) -> Self {
        test_helpers::maybe_start_logging();

        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let metric_registry = Arc::new(metric::Registry::new());
        let store = BlockStore::new(Arc::new(InMemory::new()));
        let shutdown = CancellationToken::new();

        let ring = Arc::new(Ring::new(
            RingConfig::default(),
            Arc::clone(&time_provider) as _,
            &metric_registry,
        ));

        let mut slots = vec![];
        let mut sinks = StaticSinks::default();
        let mut connection = SlotConnection::default();
        for i in 0..config.ingesters {
            let member_id = MemberId::new(format!("ingester-{i}"));
            ring.join(member_id.clone(), format!("ingester-{i}:8080"));
            ring.set_state(&member_id, MemberState::Active);

            let wal_dir = Arc::new(test_helpers::tmp_dir().expect("tmp dir"));
            let instance = Self::make_ingester(
                &config,
                wal_dir.path(),
                &store,
                &time_provider,
                &metric_registry,
            );
            let slot = Arc::new(IngesterSlot {
                member_id: member_id.clone(),
                instance: RwLock::new(instance),
                dead: AtomicBool::new(false),
                wal_dir,
            });
            sinks.insert(member_id.clone(), Arc::new(SlotSink(Arc::clone(&slot))) as _);
            connection.slots.insert(member_id, Arc::clone(&slot));
            slots.push(slot);
        }

        let distributor = Arc::new(Distributor::new(
            DistributorConfig {
                replication_factor: config.replication_factor,
                ..DistributorConfig::default()
            },
            Arc::clone(&ring),
            Arc::new(sinks),
            Arc::clone(&time_provider) as _,
            &metric_registry,
        ));

        let catalog = Arc::new(BlockCatalog::new(store.clone(), &metric_registry));
        let querier = Arc::new(Querier::new(
            QuerierConfig {
                replication_factor: config.replication_factor,
                ..QuerierConfig::default()
            },
            Arc::clone(&catalog),
            Arc::clone(&ring),
            Arc::new(connection),
            &metric_registry,
        ));

        let frontend = QueryFrontend::new(
            FrontendConfig {
                query_timeout: Duration::from_secs(10),
                ..FrontendConfig::default()
            },
            &metric_registry,
        );
        for worker in 0..config.frontend_workers.max(1) {
            tokio::spawn(run_querier_worker(
                frontend.clone(),
                Arc::clone(&querier),
                format!("worker-{worker}"),
                shutdown.clone(),
            ));
        }

        let compactor_member = MemberId::new("compactor-0");
        ring.join(compactor_member.clone(), "compactor-0:8080");
        ring.set_state(&compactor_member, MemberState::Active);
        let compactor = Arc::new(Compactor::new(
            CompactorConfig {
                block: config.block.clone(),
                grace_period: Duration::from_secs(3600),
                ..CompactorConfig::default()
            },
            Arc::clone(&catalog),
            Arc::clone(&ring),
            compactor_member,
            Arc::clone(&time_provider) as _,
            &metric_registry,
        ));

        Self {
            time_provider,
            metric_registry,
            store,
            ring,
            slots,
            distributor,
            catalog,
            frontend,
            compactor,
            shutdown,
        }
    }

    fn make_ingester(
        config: &TestClusterConfig,
        wal_dir: &std::path::Path,
        store: &BlockStore,
        time_provider: &Arc<MockProvider>,
        metric_registry: &metric::Registry,
    ) -> Arc<Ingester> {
        let mut ingester_config = IngesterConfig::new(wal_dir);
        ingester_config.block = config.block.clone();
        let ingester = Arc::new(Ingester::new(
            ingester_config,
            store.clone(),
            Arc::clone(time_provider) as Arc<dyn TimeProvider>,
            metric_registry,
        ));
        ingester.replay().expect("replay");
        ingester
    }

    /// Simulate an ingester crash: unreachable and removed from the
    /// healthy ring.
    pub fn kill_ingester(&self, index: usize) {
        let slot = &self.slots[index];
        slot.dead.store(true, Ordering::SeqCst);
        self.ring.set_state(&slot.member_id, MemberState::Unhealthy);
    }

    /// Restart an ingester: a fresh instance over the same WAL directory.
    pub fn restart_ingester(&self, index: usize) {
        let slot = &self.slots[index];
        let config = TestClusterConfig::default();
        let instance = Self::make_ingester(
            &config,
            slot.wal_dir.path(),
            &self.store,
            &self.time_provider,
            &self.metric_registry,
        );
        *slot.instance.write() = instance;
        slot.dead.store(false, Ordering::SeqCst);
        self.ring.set_state(&slot.member_id, MemberState::Active);
    }

    /// Cut and flush every live ingester, then refresh the catalog so the
    /// new blocks are queryable.
    pub async fn flush_all(&self) {
        for slot in &self.slots {
            if slot.is_dead() {
                continue;
            }
            let ingester = slot.instance();
            ingester.cut_all();
            ingester.flush_ready(true).await.expect("flush");
        }
        self.catalog.refresh_all().await.expect("refresh");
    }

    /// One full compaction pass.
    pub async fn compact(&self) {
        self.compactor.leader_pass().await.expect("leader pass");
        self.compactor
            .worker_pass(&CancellationToken::new())
            .await;
        self.catalog.refresh_all().await.expect("refresh");
    }
}

/// The default test tenant.
pub fn tenant() -> TenantId {
    TenantId::new("test-tenant").unwrap()
}

/// A trace id whose low byte is `n`.
pub fn trace_id(n: u64) -> TraceId {
    let mut bytes = [0u8; 16];
    bytes[8..].copy_from_slice(&n.to_be_bytes());
    TraceId::new(bytes)
}

/// One span of `trace`, identified by `span_n`.
pub fn span(trace: TraceId, span_n: u64, status_code: i64) -> Span {
    Span {
        trace_id: trace,
        span_id: SpanId::new(span_n.to_be_bytes()),
        parent_span_id: (span_n > 1).then(|| SpanId::new(1u64.to_be_bytes())),
        name: format!("op-{span_n}").into(),
        kind: SpanKind::Server,
        start_unix_nanos: 1_000,
        end_unix_nanos: 2_000,
        status: SpanStatus::default(),
        attributes: vec![(
            "http.status_code".into(),
            AttributeValue::Int(status_code),
        )],
        events: vec![],
        links: vec![],
    }
}

/// A batch under the shared test resource.
pub fn batch_of(spans: Vec<Span>) -> SpanBatch {
    SpanBatch {
        resource: Resource {
            service_name: "test-service".into(),
            attributes: vec![],
        },
        spans,
    }
}

/// A batch with one span of `trace`, identified by `span_n`.
pub fn span_batch(trace: TraceId, span_n: u64, status_code: i64) -> SpanBatch {
    batch_of(vec![span(trace, span_n, status_code)])
}
