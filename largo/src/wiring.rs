//! In-process adapters and single-binary assembly.
//!
//! In a scattered deployment the distributor reaches ingesters over the
//! network and queriers dial ingesters via the ring; those clients are
//! external collaborators. The monolithic binary wires the same traits
//! directly to the local component instances.

use crate::config::LargoConfig;
use async_trait::async_trait;
use block_file::{BlockConfig, BlockStore};
use compactor::{Compactor, CompactorConfig};
use data_types::{SpanBatch, TenantId, TimeRange, TraceId, TraceRow};
use distributor::{Distributor, DistributorConfig, SinkError, SpanSink, StaticSinks};
use ingester::{Ingester, IngesterConfig};
use largo_catalog::BlockCatalog;
use largo_ring::{MemberId, MemberState, Ring, RingConfig};
use largo_time::{SystemProvider, TimeProvider};
use object_store::DynObjectStore;
use observability_deps::tracing::info;
use predicate::SpanPredicate;
use querier::{ConnectionError, IngesterConnection, Querier, QuerierConfig};
use query_frontend::{worker::run_querier_worker, FrontendConfig, QueryFrontend};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use wal::WalConfig;

/// Writes straight into a local [`Ingester`].
#[derive(Debug)]
pub struct LocalSpanSink(pub Arc<Ingester>);

#[async_trait]
impl SpanSink for LocalSpanSink {
    async fn write(&self, tenant: &TenantId, batch: SpanBatch) -> Result<(), SinkError> {
        self.0.write(tenant, batch).map_err(|e| match e {
            ingester::WriteError::Paused => SinkError::Capacity,
            other => SinkError::Unavailable(other.to_string()),
        })
    }
}

/// Queries local [`Ingester`] instances by ring member.
#[derive(Debug, Default)]
pub struct LocalIngesters {
    members: HashMap<MemberId, Arc<Ingester>>,
}

impl LocalIngesters {
    fn get(&self, member: &MemberId) -> Result<&Arc<Ingester>, ConnectionError> {
        self.members
            .get(member)
            .ok_or_else(|| ConnectionError::Unreachable {
                member: member.to_string(),
                reason: "not a local ingester".to_string(),
            })
    }
}

#[async_trait]
impl IngesterConnection for LocalIngesters {
    async fn trace_spans(
        &self,
        member: &MemberId,
        tenant: &TenantId,
        trace_id: &TraceId,
    ) -> Result<Option<TraceRow>, ConnectionError> {
        self.get(member)?
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
        self.get(member)?
            .search_spans(tenant, predicate, time_range)
            .await
            .map_err(|e| ConnectionError::Unreachable {
                member: member.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Everything one monolithic process runs.
#[derive(Debug)]
pub struct AllInOne {
    pub distributor: Arc<Distributor>,
    pub frontend: QueryFrontend,
    pub shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl AllInOne {
    /// Assemble and start every component against one object store.
    pub fn build(config: &LargoConfig) -> Result<Self, crate::Error> {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        let metric_registry = Arc::new(metric::Registry::new());
        let shutdown = CancellationToken::new();
        let mut tasks = vec![];

        let object_store: Arc<DynObjectStore> = match &config.object_store_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|source| crate::Error::DataDir {
                    path: dir.clone(),
                    source,
                })?;
                Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(dir).map_err(
                        |source| crate::Error::ObjectStore {
                            source: Box::new(source),
                        },
                    )?,
                )
            }
            None => {
                info!("no object_store_dir configured, using in-memory storage");
                Arc::new(object_store::memory::InMemory::new())
            }
        };
        let block_store = BlockStore::new(object_store);

        // one ring, one member of each role
        let ring = Arc::new(Ring::new(
            RingConfig::default(),
            Arc::clone(&time_provider),
            &metric_registry,
        ));
        let member_id = MemberId::new("local-0");
        ring.join(member_id.clone(), config.http_bind.clone());
        ring.set_state(&member_id, MemberState::Active);
        tasks.push(tokio::spawn(largo_ring::run_heartbeat_loop(
            Arc::clone(&ring),
            member_id.clone(),
            shutdown.clone(),
        )));

        let block_config = BlockConfig {
            row_group_target_bytes: config.block.row_group_target_bytes,
            dedicated_columns: config.dedicated_columns(),
        };

        // ingester
        let mut ingester_config = IngesterConfig::new(&config.ingester.wal_dir);
        ingester_config.max_trace_bytes = config.ingester.max_trace_bytes;
        ingester_config.max_trace_idle = Duration::from_secs(config.ingester.max_trace_idle);
        ingester_config.max_trace_age = Duration::from_secs(config.ingester.max_trace_age);
        ingester_config.linger_period = Duration::from_secs(config.ingester.linger_period);
        ingester_config.block = block_config.clone();
        ingester_config.wal = WalConfig {
            root: config.ingester.wal_dir.clone(),
            segment_size: config.ingester.wal.segment_size,
        };
        let ingester = Arc::new(Ingester::new(
            ingester_config,
            block_store.clone(),
            Arc::clone(&time_provider),
            &metric_registry,
        ));
        ingester.replay().map_err(crate::Error::Replay)?;
        tasks.push(tokio::spawn(ingester::run_ingester_loop(
            Arc::clone(&ingester),
            shutdown.clone(),
        )));

        // distributor; a single local replica clamps RF to 1
        let mut sinks = StaticSinks::default();
        sinks.insert(
            member_id.clone(),
            Arc::new(LocalSpanSink(Arc::clone(&ingester))) as _,
        );
        let replication_factor = usize::min(config.replication_factor.max(1), 1);
        let distributor = Arc::new(Distributor::new(
            DistributorConfig {
                replication_factor,
                ..DistributorConfig::default()
            },
            Arc::clone(&ring),
            Arc::new(sinks),
            Arc::clone(&time_provider),
            &metric_registry,
        ));

        // catalog + querier + frontend workers
        let catalog = Arc::new(BlockCatalog::new(block_store, &metric_registry));
        tasks.push(tokio::spawn(largo_catalog::run_poll_loop(
            Arc::clone(&catalog),
            Duration::from_secs(15),
            shutdown.clone(),
        )));

        let mut local_ingesters = LocalIngesters::default();
        local_ingesters
            .members
            .insert(member_id.clone(), Arc::clone(&ingester));
        let querier = Arc::new(Querier::new(
            QuerierConfig {
                concurrent_block_reads: config.querier.concurrent_block_reads,
                replication_factor,
                fail_on_corrupt_block: false,
            },
            Arc::clone(&catalog),
            Arc::clone(&ring),
            Arc::new(local_ingesters),
            &metric_registry,
        ));

        let frontend = QueryFrontend::new(
            FrontendConfig {
                trace_shards: config.frontend.trace_shards,
                search_shards: config.frontend.search_shards,
                max_retries: config.frontend.max_retries,
                query_timeout: Duration::from_secs(config.frontend.query_timeout),
                ..FrontendConfig::default()
            },
            &metric_registry,
        );
        for worker in 0..config.frontend.workers.max(1) {
            tasks.push(tokio::spawn(run_querier_worker(
                frontend.clone(),
                Arc::clone(&querier),
                format!("local-0/worker-{worker}"),
                shutdown.clone(),
            )));
        }

        // compactor
        let compactor = Arc::new(Compactor::new(
            CompactorConfig {
                input_blocks_per_job: config.compactor.input_blocks_per_job,
                grace_period: Duration::from_secs(config.compactor.grace_period),
                orphan_age: Duration::from_secs(config.compactor.orphan_age),
                default_retention: config.default_retention.map(Duration::from_secs),
                retention_per_tenant: config.retention(),
                block: block_config,
                ..CompactorConfig::default()
            },
            catalog,
            Arc::clone(&ring),
            member_id,
            Arc::clone(&time_provider),
            &metric_registry,
        ));
        tasks.push(tokio::spawn(compactor::run_compactor_loop(
            compactor,
            shutdown.clone(),
        )));

        Ok(Self {
            distributor,
            frontend,
            shutdown,
            tasks,
        })
    }

    /// Cancel every background loop and wait for them to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
