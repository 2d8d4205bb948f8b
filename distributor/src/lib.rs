//! The distributor: validates incoming batches against per-tenant limits,
//! shards spans by trace id over the ingester ring, and acknowledges once a
//! write quorum of replicas accepted each trace's spans.
//!
//! Over-limit spans are dropped and counted, never failed: by the time a
//! limit fires, dropping load is the only thing that protects the rest of
//! the tenant's traffic. Partial replica failures surface as per-tenant
//! counters plus one terminal status on the request.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::{ErrorCode, Span, SpanBatch, TenantId};
use futures::future::join_all;
use largo_ring::{MemberId, Ring};
use largo_time::{Time, TimeProvider};
use metric::{Metric, U64Counter};
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

/// One ingester replica's write endpoint.
///
/// The in-process deployment wires this straight to an `Ingester`; the
/// networked client is an external collaborator.
#[async_trait]
pub trait SpanSink: Debug + Send + Sync {
    /// Write a batch to this replica. Must be durable (WAL'd) on `Ok`.
    async fn write(&self, tenant: &TenantId, batch: SpanBatch) -> Result<(), SinkError>;
}

/// Why a replica write failed.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The replica is shedding load.
    #[error("replica over capacity")]
    Capacity,
    /// The replica could not be reached or errored internally.
    #[error("replica unavailable: {0}")]
    Unavailable(String),
}

/// Maps ring members to their write endpoints.
pub trait SinkResolver: Debug + Send + Sync {
    /// The sink for a member, if the process knows how to reach it.
    fn sink(&self, member: &MemberId) -> Option<Arc<dyn SpanSink>>;
}

/// Static member-to-sink table, used by single-process deployments and
/// tests.
#[derive(Debug, Default)]
pub struct StaticSinks {
    sinks: HashMap<MemberId, Arc<dyn SpanSink>>,
}

impl StaticSinks {
    /// Register a member's sink.
    pub fn insert(&mut self, member: MemberId, sink: Arc<dyn SpanSink>) {
        self.sinks.insert(member, sink);
    }
}

impl SinkResolver for StaticSinks {
    fn sink(&self, member: &MemberId) -> Option<Arc<dyn SpanSink>> {
        self.sinks.get(member).map(Arc::clone)
    }
}

/// Per-tenant ingest limits. Zero means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct TenantLimits {
    /// Spans per second across the tenant.
    pub max_spans_per_sec: u64,
    /// Upper bound on one span's estimated size.
    pub max_span_bytes: usize,
    /// Upper bound on one span's attribute bytes.
    pub max_attribute_bytes: usize,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_spans_per_sec: 0,
            max_span_bytes: 1024 * 1024,
            max_attribute_bytes: 128 * 1024,
        }
    }
}

/// Distributor knobs.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Ingester replicas per trace.
    pub replication_factor: usize,
    /// Deadline for the whole replica fan-out.
    pub write_timeout: Duration,
    /// Limits applied to tenants without an override.
    pub default_limits: TenantLimits,
    /// Per-tenant limit overrides.
    pub tenant_limits: HashMap<TenantId, TenantLimits>,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            write_timeout: Duration::from_secs(5),
            default_limits: TenantLimits::default(),
            tenant_limits: HashMap::new(),
        }
    }
}

/// Terminal status of a rejected write.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Not enough replicas acknowledged within the deadline.
    #[error("write quorum not met: {acks} of {needed} acks for trace group")]
    QuorumNotMet {
        /// Acks received for the worst trace group.
        acks: usize,
        /// Quorum requirement.
        needed: usize,
    },

    /// The ring has no healthy ingesters.
    #[error("no healthy ingesters in the ring")]
    NoHealthyIngesters,

    /// Every replica reported capacity pressure.
    #[error("all replicas over capacity")]
    OverCapacity,
}

impl WriteError {
    /// The stable machine-readable code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::QuorumNotMet { .. } | Self::NoHealthyIngesters => ErrorCode::Quorum,
            Self::OverCapacity => ErrorCode::Capacity,
        }
    }
}

/// What a successful write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    /// Spans accepted and replicated.
    pub spans_accepted: usize,
    /// Spans dropped by limit enforcement.
    pub spans_dropped: usize,
}

#[derive(Debug, Default)]
struct RateWindow {
    window_start: Option<Time>,
    count: u64,
}

/// The distributor of one process.
#[derive(Debug)]
pub struct Distributor {
    config: DistributorConfig,
    ring: Arc<Ring>,
    sinks: Arc<dyn SinkResolver>,
    time_provider: Arc<dyn TimeProvider>,
    rate: Mutex<HashMap<TenantId, RateWindow>>,

    accepted_spans: Metric<U64Counter>,
    dropped_spans: Metric<U64Counter>,
    replica_writes: Metric<U64Counter>,
}

impl Distributor {
    /// Create a distributor over the ingester `ring`.
    pub fn new(
        config: DistributorConfig,
        ring: Arc<Ring>,
        sinks: Arc<dyn SinkResolver>,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Self {
        Self {
            config,
            ring,
            sinks,
            time_provider,
            rate: Default::default(),
            accepted_spans: metric_registry
                .register_metric("distributor_accepted_spans", "spans accepted per tenant"),
            dropped_spans: metric_registry.register_metric(
                "distributor_dropped_spans",
                "spans dropped by limit enforcement, per tenant and reason",
            ),
            replica_writes: metric_registry.register_metric(
                "distributor_replica_writes",
                "per-replica write outcomes",
            ),
        }
    }

    fn limits(&self, tenant: &TenantId) -> TenantLimits {
        self.config
            .tenant_limits
            .get(tenant)
            .copied()
            .unwrap_or(self.config.default_limits)
    }

    /// Count a span against the tenant's per-second budget; false means
    /// over limit.
    fn admit_rate(&self, tenant: &TenantId, limits: &TenantLimits) -> bool {
        if limits.max_spans_per_sec == 0 {
            return true;
        }
        let now = self.time_provider.now();
        let mut rate = self.rate.lock();
        let window = rate.entry(tenant.clone()).or_default();
        let rolled = window
            .window_start
            .and_then(|start| now.checked_duration_since(start))
            .map(|age| age >= Duration::from_secs(1))
            .unwrap_or(true);
        if rolled {
            window.window_start = Some(now);
            window.count = 0;
        }
        if window.count >= limits.max_spans_per_sec {
            return false;
        }
        window.count += 1;
        true
    }

    fn enforce_limits(&self, tenant: &TenantId, batch: SpanBatch) -> (SpanBatch, usize) {
        let limits = self.limits(tenant);
        let mut dropped = 0usize;
        let mut drop_reason = |reason: &'static str| {
            dropped += 1;
            self.dropped_spans
                .recorder([
                    ("tenant", tenant.to_string()),
                    ("reason", reason.to_string()),
                ])
                .inc(1);
        };

        let spans: Vec<Span> = batch
            .spans
            .into_iter()
            .filter(|span| {
                let attr_bytes: usize = span
                    .attributes
                    .iter()
                    .map(|(k, v)| k.len() + v.size_bytes())
                    .sum();
                if limits.max_span_bytes > 0 && span.size_bytes() > limits.max_span_bytes {
                    drop_reason("span_bytes");
                    return false;
                }
                if limits.max_attribute_bytes > 0 && attr_bytes > limits.max_attribute_bytes {
                    drop_reason("attribute_bytes");
                    return false;
                }
                if !self.admit_rate(tenant, &limits) {
                    drop_reason("rate");
                    return false;
                }
                true
            })
            .collect();

        (
            SpanBatch {
                resource: batch.resource,
                spans,
            },
            dropped,
        )
    }

    /// Route one batch: validate, shard by trace id, replicate, wait for
    /// quorum.
    pub async fn write(
        &self,
        tenant: &TenantId,
        batch: SpanBatch,
    ) -> Result<WriteSummary, WriteError> {
        let (batch, dropped) = self.enforce_limits(tenant, batch);
        let accepted = batch.spans.len();
        if accepted == 0 {
            // a fully-dropped batch is still a success: limits drop, they
            // don't fail
            return Ok(WriteSummary {
                spans_accepted: 0,
                spans_dropped: dropped,
            });
        }

        // group spans by trace id and resolve each group's replica set
        let mut by_trace: HashMap<data_types::TraceId, Vec<Span>> = HashMap::new();
        for span in batch.spans {
            by_trace.entry(span.trace_id).or_default().push(span);
        }

        let rf = self.config.replication_factor;
        let quorum = rf / 2 + 1;

        // per-owner sub-batches, remembering which trace groups ride on each
        let mut per_owner: HashMap<MemberId, Vec<Span>> = HashMap::new();
        let mut owners_by_trace: HashMap<data_types::TraceId, Vec<MemberId>> = HashMap::new();
        for (trace_id, spans) in by_trace {
            let mut key = Vec::with_capacity(tenant.as_str().len() + 16);
            key.extend_from_slice(tenant.as_str().as_bytes());
            key.extend_from_slice(trace_id.as_bytes());
            let owners = self.ring.owners(&key, rf);
            if owners.is_empty() {
                return Err(WriteError::NoHealthyIngesters);
            }
            owners_by_trace.insert(
                trace_id,
                owners.iter().map(|m| m.id.clone()).collect(),
            );
            for owner in owners {
                per_owner
                    .entry(owner.id)
                    .or_default()
                    .extend(spans.iter().cloned());
            }
        }

        // parallel replica dispatch under one deadline
        let resource = batch.resource;
        let writes = per_owner.into_iter().map(|(member, spans)| {
            let sub_batch = SpanBatch {
                resource: resource.clone(),
                spans,
            };
            let sink = self.sinks.sink(&member);
            let timeout = self.config.write_timeout;
            async move {
                let result = match sink {
                    Some(sink) => {
                        match tokio::time::timeout(timeout, sink.write(tenant, sub_batch)).await
                        {
                            Ok(result) => result,
                            Err(_) => Err(SinkError::Unavailable("write timeout".into())),
                        }
                    }
                    None => Err(SinkError::Unavailable("no route to member".into())),
                };
                (member, result)
            }
        });
        let results: HashMap<MemberId, Result<(), SinkError>> =
            join_all(writes).await.into_iter().collect();

        for (member, result) in &results {
            let outcome = if result.is_ok() { "ok" } else { "error" };
            self.replica_writes
                .recorder([
                    ("member", member.as_str().to_string()),
                    ("outcome", outcome.to_string()),
                ])
                .inc(1);
            if let Err(e) = result {
                warn!(member=%member, error=%e, "replica write failed");
            }
        }

        // every trace group must reach quorum
        let mut worst_acks = usize::MAX;
        for owners in owners_by_trace.values() {
            let acks = owners
                .iter()
                .filter(|m| matches!(results.get(m), Some(Ok(()))))
                .count();
            worst_acks = worst_acks.min(acks);
        }
        if worst_acks < quorum {
            let all_capacity = results
                .values()
                .all(|r| matches!(r, Err(SinkError::Capacity)));
            if all_capacity {
                return Err(WriteError::OverCapacity);
            }
            return Err(WriteError::QuorumNotMet {
                acks: worst_acks,
                needed: quorum,
            });
        }

        self.accepted_spans
            .recorder([("tenant", tenant.to_string())])
            .inc(accepted as u64);
        debug!(
            tenant=%tenant,
            accepted,
            dropped,
            "batch replicated"
        );
        Ok(WriteSummary {
            spans_accepted: accepted,
            spans_dropped: dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{Resource, SpanId, SpanKind, SpanStatus, TraceId};
    use largo_ring::{MemberState, RingConfig};
    use largo_time::MockProvider;
    use parking_lot::Mutex as PlMutex;

    #[derive(Debug, Default)]
    struct RecordingSink {
        batches: PlMutex<Vec<SpanBatch>>,
        fail: PlMutex<Option<&'static str>>,
    }

    impl RecordingSink {
        fn span_count(&self) -> usize {
            self.batches.lock().iter().map(|b| b.spans.len()).sum()
        }
    }

    #[async_trait]
    impl SpanSink for RecordingSink {
        async fn write(&self, _tenant: &TenantId, batch: SpanBatch) -> Result<(), SinkError> {
            match *self.fail.lock() {
                Some("capacity") => Err(SinkError::Capacity),
                Some(reason) => Err(SinkError::Unavailable(reason.to_string())),
                None => {
                    self.batches.lock().push(batch);
                    Ok(())
                }
            }
        }
    }

    struct Fixture {
        distributor: Distributor,
        sinks: Vec<Arc<RecordingSink>>,
        time_provider: Arc<MockProvider>,
    }

    fn fixture(members: usize, config: DistributorConfig) -> Fixture {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let registry = metric::Registry::new();
        let ring = Arc::new(Ring::new(
            RingConfig::default(),
            Arc::clone(&time_provider) as _,
            &registry,
        ));

        let mut static_sinks = StaticSinks::default();
        let mut sinks = vec![];
        for i in 0..members {
            let id = MemberId::new(format!("ingester-{i}"));
            ring.join(id.clone(), format!("ingester-{i}:8080"));
            ring.set_state(&id, MemberState::Active);
            let sink = Arc::new(RecordingSink::default());
            static_sinks.insert(id, Arc::clone(&sink) as _);
            sinks.push(sink);
        }

        let distributor = Distributor::new(
            config,
            ring,
            Arc::new(static_sinks),
            Arc::clone(&time_provider) as _,
            &registry,
        );
        Fixture {
            distributor,
            sinks,
            time_provider,
        }
    }

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn batch(trace_ns: &[u8]) -> SpanBatch {
        SpanBatch {
            resource: Resource {
                service_name: "svc".into(),
                attributes: vec![],
            },
            spans: trace_ns
                .iter()
                .map(|n| Span {
                    trace_id: TraceId::new([*n; 16]),
                    span_id: SpanId::new([*n; 8]),
                    parent_span_id: None,
                    name: "op".into(),
                    kind: SpanKind::Internal,
                    start_unix_nanos: 0,
                    end_unix_nanos: 1,
                    status: SpanStatus::default(),
                    attributes: vec![],
                    events: vec![],
                    links: vec![],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn replicates_to_rf_ingesters() {
        let fixture = fixture(5, DistributorConfig::default());
        let summary = fixture
            .distributor
            .write(&tenant(), batch(&[1]))
            .await
            .unwrap();
        assert_eq!(summary.spans_accepted, 1);

        let replicas = fixture
            .sinks
            .iter()
            .filter(|s| s.span_count() == 1)
            .count();
        assert_eq!(replicas, 3, "span must land on exactly RF replicas");
    }

    #[tokio::test]
    async fn same_trace_routes_to_same_replicas() {
        let fixture = fixture(5, DistributorConfig::default());
        fixture
            .distributor
            .write(&tenant(), batch(&[1]))
            .await
            .unwrap();
        fixture
            .distributor
            .write(&tenant(), batch(&[1]))
            .await
            .unwrap();

        for sink in &fixture.sinks {
            let count = sink.span_count();
            assert!(count == 0 || count == 2, "replica set must be stable");
        }
    }

    #[tokio::test]
    async fn quorum_tolerates_one_failure_of_three() {
        let fixture = fixture(3, DistributorConfig::default());
        *fixture.sinks[0].fail.lock() = Some("down");

        let summary = fixture
            .distributor
            .write(&tenant(), batch(&[1]))
            .await
            .unwrap();
        assert_eq!(summary.spans_accepted, 1);
    }

    #[tokio::test]
    async fn quorum_failure_is_an_error() {
        let fixture = fixture(3, DistributorConfig::default());
        *fixture.sinks[0].fail.lock() = Some("down");
        *fixture.sinks[1].fail.lock() = Some("down");
        *fixture.sinks[2].fail.lock() = Some("down");

        let err = fixture
            .distributor
            .write(&tenant(), batch(&[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::QuorumNotMet { acks: 0, needed: 2 }));
        assert_eq!(err.code(), ErrorCode::Quorum);
    }

    #[tokio::test]
    async fn capacity_pressure_surfaces_as_capacity() {
        let fixture = fixture(3, DistributorConfig::default());
        for sink in &fixture.sinks {
            *sink.fail.lock() = Some("capacity");
        }

        let err = fixture
            .distributor
            .write(&tenant(), batch(&[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::OverCapacity));
        assert_eq!(err.code(), ErrorCode::Capacity);
    }

    #[tokio::test]
    async fn oversized_spans_are_dropped_not_failed() {
        let mut config = DistributorConfig::default();
        config.default_limits.max_span_bytes = 1;
        let fixture = fixture(3, config);

        let summary = fixture
            .distributor
            .write(&tenant(), batch(&[1, 2]))
            .await
            .unwrap();
        assert_eq!(summary.spans_accepted, 0);
        assert_eq!(summary.spans_dropped, 2);
        assert!(fixture.sinks.iter().all(|s| s.span_count() == 0));
    }

    #[tokio::test]
    async fn rate_limit_drops_excess_spans_per_window() {
        let mut config = DistributorConfig::default();
        config.default_limits.max_spans_per_sec = 2;
        let fixture = fixture(3, config);

        let summary = fixture
            .distributor
            .write(&tenant(), batch(&[1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(summary.spans_accepted, 2);
        assert_eq!(summary.spans_dropped, 1);

        // the window rolls over and admits again
        fixture.time_provider.inc(Duration::from_secs(1));
        let summary = fixture
            .distributor
            .write(&tenant(), batch(&[4]))
            .await
            .unwrap();
        assert_eq!(summary.spans_accepted, 1);
    }
}
