//! The querier: executes sub-queries against recent data (ingesters, via
//! the ring) and historical data (object-store blocks, via the catalog),
//! merging both worlds into deduplicated trace rows.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::{BlockId, BlockMeta, TenantId, TimeRange, TraceId, TraceRow};
use futures::future::join_all;
use largo_catalog::BlockCatalog;
use largo_ring::Ring;
use metric::{Metric, U64Counter};
use observability_deps::tracing::{debug, warn};
use predicate::SpanPredicate;
use siphasher::sip::SipHasher24;
use snafu::Snafu;
use std::{fmt::Debug, hash::Hasher, sync::Arc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Errors reaching an ingester replica.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ConnectionError {
    #[snafu(display("ingester {member} unreachable: {reason}"))]
    Unreachable { member: String, reason: String },
}

/// Access to the in-memory data of ingesters, addressed by ring member.
///
/// The networked client is an external collaborator; tests and
/// single-process deployments provide in-process implementations.
#[async_trait]
pub trait IngesterConnection: Debug + Send + Sync {
    /// All spans the member holds for the trace.
    async fn trace_spans(
        &self,
        member: &largo_ring::MemberId,
        tenant: &TenantId,
        trace_id: &TraceId,
    ) -> Result<Option<TraceRow>, ConnectionError>;

    /// Matching traces in the member's memory.
    async fn search_spans(
        &self,
        member: &largo_ring::MemberId,
        tenant: &TenantId,
        predicate: &SpanPredicate,
        time_range: TimeRange,
    ) -> Result<Vec<TraceRow>, ConnectionError>;
}

/// Errors executing a sub-query.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("block {block_id} read failed: {source}"))]
    BlockRead {
        block_id: BlockId,
        source: block_file::ReadError,
    },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which slice of the candidate block set a sub-query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSelector {
    /// This sub-query's index, `0 <= index < total`.
    pub index: u32,
    /// Total shards the frontend split the query into.
    pub total: u32,
}

impl ShardSelector {
    /// The unsharded query.
    pub const ALL: Self = Self { index: 0, total: 1 };

    /// True if this shard is responsible for the block.
    pub fn covers(&self, block_id: &BlockId) -> bool {
        if self.total <= 1 {
            return true;
        }
        let mut hasher = SipHasher24::new_with_keys(0x7368_6172, 0x645f_626c);
        hasher.write(block_id.get().as_bytes());
        (hasher.finish() % self.total as u64) == self.index as u64
    }

    /// Ingesters are probed by exactly one shard so their spans are not
    /// fetched `total` times.
    pub fn covers_ingesters(&self) -> bool {
        self.index == 0
    }
}

/// Querier knobs.
#[derive(Debug, Clone)]
pub struct QuerierConfig {
    /// Concurrent block reads per querier process.
    pub concurrent_block_reads: usize,
    /// Replication factor of the ingester ring (how many owners to probe).
    pub replication_factor: usize,
    /// If true, a corrupt block fails the sub-query; otherwise it is
    /// quarantined, skipped, and the result flagged partial.
    pub fail_on_corrupt_block: bool,
}

impl Default for QuerierConfig {
    fn default() -> Self {
        Self {
            concurrent_block_reads: 8,
            replication_factor: 3,
            fail_on_corrupt_block: false,
        }
    }
}

/// The result of one sub-query.
#[derive(Debug, Default)]
pub struct SubQueryResult {
    /// Matching traces, deduplicated within this sub-query.
    pub traces: Vec<TraceRow>,
    /// True if some source failed or was skipped; the frontend propagates
    /// this into the response's `partial` flag.
    pub partial: bool,
}

/// The querier of one process.
#[derive(Debug)]
pub struct Querier {
    config: QuerierConfig,
    catalog: Arc<BlockCatalog>,
    ingester_ring: Arc<Ring>,
    ingesters: Arc<dyn IngesterConnection>,
    block_read_slots: Arc<Semaphore>,

    blocks_scanned: Metric<U64Counter>,
    blocks_skipped: Metric<U64Counter>,
}

impl Querier {
    /// Create a querier.
    pub fn new(
        config: QuerierConfig,
        catalog: Arc<BlockCatalog>,
        ingester_ring: Arc<Ring>,
        ingesters: Arc<dyn IngesterConnection>,
        metric_registry: &metric::Registry,
    ) -> Self {
        let block_read_slots = Arc::new(Semaphore::new(config.concurrent_block_reads.max(1)));
        Self {
            config,
            catalog,
            ingester_ring,
            ingesters,
            block_read_slots,
            blocks_scanned: metric_registry
                .register_metric("querier_blocks_scanned", "blocks read per query kind"),
            blocks_skipped: metric_registry.register_metric(
                "querier_blocks_skipped",
                "blocks skipped by bloom, range, or shard checks",
            ),
        }
    }

    /// Probe the owners of `trace_id` for in-memory spans.
    ///
    /// A single successful response suffices for availability; additional
    /// responses only add completeness via dedup. Partial is flagged when
    /// every probe failed.
    async fn probe_ingesters(
        &self,
        tenant: &TenantId,
        trace_id: &TraceId,
    ) -> (Vec<TraceRow>, bool) {
        let mut key = Vec::with_capacity(tenant.as_str().len() + 16);
        key.extend_from_slice(tenant.as_str().as_bytes());
        key.extend_from_slice(trace_id.as_bytes());
        let owners = self
            .ingester_ring
            .owners(&key, self.config.replication_factor);
        if owners.is_empty() {
            return (vec![], false);
        }

        let probes = owners.iter().map(|member| {
            let member_id = member.id.clone();
            async move {
                self.ingesters
                    .trace_spans(&member_id, tenant, trace_id)
                    .await
            }
        });

        let mut rows = vec![];
        let mut ok_probes = 0usize;
        for result in join_all(probes).await {
            match result {
                Ok(Some(row)) => {
                    ok_probes += 1;
                    rows.push(row);
                }
                Ok(None) => ok_probes += 1,
                Err(e) => warn!(error=%e, "ingester probe failed"),
            }
        }
        (rows, ok_probes == 0)
    }

    fn candidate_blocks(
        &self,
        tenant: &TenantId,
        shard: &ShardSelector,
        filter: impl Fn(&BlockMeta) -> bool,
    ) -> Vec<BlockMeta> {
        let mut candidates = vec![];
        for meta in self.catalog.visible_blocks(tenant) {
            if !shard.covers(&meta.id) {
                self.blocks_skipped.recorder(&[("reason", "shard")]).inc(1);
                continue;
            }
            if !filter(&meta) {
                self.blocks_skipped.recorder(&[("reason", "range")]).inc(1);
                continue;
            }
            candidates.push(meta);
        }
        candidates
    }

    /// Handle a corrupt block per policy. `Ok(())` means the block was
    /// quarantined and the scan may continue.
    fn handle_block_error(
        &self,
        tenant: &TenantId,
        block_id: BlockId,
        source: block_file::ReadError,
    ) -> Result<()> {
        if source.is_corruption() {
            self.catalog.mark_bad(tenant, &block_id);
            if !self.config.fail_on_corrupt_block {
                return Ok(());
            }
        }
        Err(Error::BlockRead { block_id, source })
    }

    /// Point lookup over this shard's blocks plus (on shard 0) the
    /// ingester ring.
    pub async fn trace_by_id(
        &self,
        tenant: &TenantId,
        trace_id: &TraceId,
        shard: ShardSelector,
    ) -> Result<SubQueryResult> {
        let mut result = SubQueryResult::default();
        let mut rows: Vec<TraceRow> = vec![];

        if shard.covers_ingesters() {
            let (ingester_rows, partial) = self.probe_ingesters(tenant, trace_id).await;
            rows.extend(ingester_rows);
            result.partial |= partial;
        }

        let candidates =
            self.candidate_blocks(tenant, &shard, |meta| meta.covers_trace_id(trace_id));
        for meta in candidates {
            let _slot = self
                .block_read_slots
                .acquire()
                .await
                .expect("semaphore never closed");

            // bloom gate before touching the data object
            let bloom = match self
                .catalog
                .block_store()
                .fetch_bloom(tenant, &meta.id)
                .await
            {
                Ok(bloom) => bloom,
                Err(e) => {
                    warn!(block_id=%meta.id, error=%e, "bloom fetch failed, flagging partial");
                    result.partial = true;
                    continue;
                }
            };
            if !bloom.contains(trace_id) {
                self.blocks_skipped.recorder(&[("reason", "bloom")]).inc(1);
                continue;
            }

            self.blocks_scanned
                .recorder(&[("kind", "trace_by_id")])
                .inc(1);
            let found = async {
                let reader = self.catalog.block_store().reader(tenant, &meta.id).await?;
                reader.find_trace(trace_id).await
            }
            .await;
            match found {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {} // bloom false positive
                Err(source) => {
                    self.handle_block_error(tenant, meta.id, source)?;
                    result.partial = true;
                }
            }
        }

        // merge all sources into one deduplicated row
        let mut merged: Option<TraceRow> = None;
        for row in rows {
            match &mut merged {
                Some(existing) => existing.merge(row),
                None => merged = Some(row),
            }
        }
        if let Some(row) = merged {
            result.traces.push(row);
        }
        Ok(result)
    }

    /// Filter scan over this shard's blocks plus (on shard 0) the ingester
    /// ring. `limit` bounds the trace count returned by this sub-query.
    pub async fn search(
        &self,
        tenant: &TenantId,
        predicate: &SpanPredicate,
        time_range: TimeRange,
        shard: ShardSelector,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<SubQueryResult> {
        let mut result = SubQueryResult::default();
        let mut rows: Vec<TraceRow> = vec![];

        if shard.covers_ingesters() {
            let owners = self.ingester_ring.healthy_members();
            let probes = owners.iter().map(|member| {
                let member_id = member.id.clone();
                async move {
                    self.ingesters
                        .search_spans(&member_id, tenant, predicate, time_range)
                        .await
                }
            });
            for probe in join_all(probes).await {
                match probe {
                    Ok(found) => rows.extend(found),
                    Err(e) => {
                        warn!(error=%e, "ingester search failed");
                        result.partial = true;
                    }
                }
            }
        }

        let candidates = self.candidate_blocks(tenant, &shard, |meta| {
            meta.time_range.overlaps(&time_range)
        });
        for meta in candidates {
            if cancel.is_cancelled() {
                result.partial = true;
                break;
            }
            let _slot = self
                .block_read_slots
                .acquire()
                .await
                .expect("semaphore never closed");

            self.blocks_scanned.recorder(&[("kind", "search")]).inc(1);
            let scanned = async {
                let reader = self.catalog.block_store().reader(tenant, &meta.id).await?;
                reader.search(predicate, time_range, cancel).await
            }
            .await;
            match scanned {
                Ok(found) => {
                    result.partial |= found.cancelled;
                    rows.extend(found.traces);
                }
                Err(source) => {
                    self.handle_block_error(tenant, meta.id, source)?;
                    result.partial = true;
                }
            }
        }

        // merge duplicates across sources (a trace may live in several
        // blocks and in ingester memory at once)
        rows.sort_by_key(|r| r.trace_id);
        let mut merged: Vec<TraceRow> = vec![];
        for row in rows {
            match merged.last_mut() {
                Some(last) if last.trace_id == row.trace_id => last.merge(row),
                _ => merged.push(row),
            }
        }
        merged.truncate(limit);

        debug!(
            tenant=%tenant,
            shard=?shard,
            traces=merged.len(),
            partial=result.partial,
            "search sub-query done"
        );
        result.traces = merged;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_file::{encode_block, BlockConfig, BlockStore};
    use data_types::{
        AttributeValue, CompactionLevel, Resource, Span, SpanId, SpanKind, SpanStatus,
    };
    use largo_ring::{MemberId, MemberState, RingConfig};
    use largo_time::{MockProvider, Time};
    use object_store::memory::InMemory;
    use parking_lot::Mutex;
    use predicate::{CompareOp, Field, Scalar};
    use std::collections::HashMap;

    /// In-memory stand-in for the ingester fleet.
    #[derive(Debug, Default)]
    struct FakeIngesters {
        rows: Mutex<HashMap<MemberId, Vec<TraceRow>>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl IngesterConnection for FakeIngesters {
        async fn trace_spans(
            &self,
            member: &MemberId,
            _tenant: &TenantId,
            trace_id: &TraceId,
        ) -> Result<Option<TraceRow>, ConnectionError> {
            if *self.fail.lock() {
                return UnreachableSnafu {
                    member: member.to_string(),
                    reason: "down",
                }
                .fail();
            }
            Ok(self
                .rows
                .lock()
                .get(member)
                .and_then(|rows| rows.iter().find(|r| &r.trace_id == trace_id).cloned()))
        }

        async fn search_spans(
            &self,
            member: &MemberId,
            _tenant: &TenantId,
            predicate: &SpanPredicate,
            time_range: TimeRange,
        ) -> Result<Vec<TraceRow>, ConnectionError> {
            if *self.fail.lock() {
                return UnreachableSnafu {
                    member: member.to_string(),
                    reason: "down",
                }
                .fail();
            }
            Ok(self
                .rows
                .lock()
                .get(member)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| {
                            row.time_range().overlaps(&time_range)
                                && row.batches.iter().any(|b| {
                                    b.spans.iter().any(|s| {
                                        predicate.evaluate(&predicate::FullSpanLens {
                                            span: s,
                                            resource: &b.resource,
                                        })
                                    })
                                })
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn span(trace_n: u8, span_n: u8, status: i64) -> Span {
        Span {
            trace_id: TraceId::new([trace_n; 16]),
            span_id: SpanId::new([span_n; 8]),
            parent_span_id: None,
            name: "op".into(),
            kind: SpanKind::Server,
            start_unix_nanos: trace_n as i64 * 1_000,
            end_unix_nanos: trace_n as i64 * 1_000 + 10,
            status: SpanStatus::default(),
            attributes: vec![("http.status_code".into(), AttributeValue::Int(status))],
            events: vec![],
            links: vec![],
        }
    }

    fn row(trace_n: u8, span_ns: &[u8], status: i64) -> TraceRow {
        let mut row = TraceRow::new(TraceId::new([trace_n; 16]));
        row.push_spans(
            &Resource {
                service_name: "svc".into(),
                attributes: vec![],
            },
            span_ns.iter().map(|s| span(trace_n, *s, status)),
        );
        row
    }

    struct Fixture {
        querier: Querier,
        catalog: Arc<BlockCatalog>,
        store: BlockStore,
        ingesters: Arc<FakeIngesters>,
        ring: Arc<Ring>,
    }

    async fn fixture(config: QuerierConfig) -> Fixture {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let registry = metric::Registry::new();
        let store = BlockStore::new(Arc::new(InMemory::new()));
        let catalog = Arc::new(BlockCatalog::new(store.clone(), &registry));
        let ring = Arc::new(Ring::new(
            RingConfig::default(),
            Arc::clone(&time_provider) as _,
            &registry,
        ));
        let ingesters = Arc::new(FakeIngesters::default());
        let querier = Querier::new(
            config,
            Arc::clone(&catalog),
            Arc::clone(&ring),
            Arc::clone(&ingesters) as _,
            &registry,
        );
        Fixture {
            querier,
            catalog,
            store,
            ingesters,
            ring,
        }
    }

    fn activate_member(ring: &Ring, name: &str) -> MemberId {
        let id = MemberId::new(name.to_string());
        ring.join(id.clone(), format!("{name}:8080"));
        ring.set_state(&id, MemberState::Active);
        id
    }

    async fn publish_rows(fixture: &Fixture, rows: Vec<TraceRow>) {
        let block = encode_block(
            tenant(),
            BlockId::new(),
            CompactionLevel::INITIAL,
            rows,
            &BlockConfig::default(),
        )
        .unwrap();
        fixture.store.publish(&block).await.unwrap();
        fixture.catalog.refresh_tenant(&tenant()).await.unwrap();
    }

    #[tokio::test]
    async fn merges_block_and_ingester_spans() {
        let fixture = fixture(QuerierConfig::default()).await;
        let member = activate_member(&fixture.ring, "ingester-0");

        // span 1 is historical, spans 1 + 2 are in ingester memory (overlap)
        publish_rows(&fixture, vec![row(1, &[1], 200)]).await;
        fixture
            .ingesters
            .rows
            .lock()
            .insert(member, vec![row(1, &[1, 2], 200)]);

        let result = fixture
            .querier
            .trace_by_id(&tenant(), &TraceId::new([1; 16]), ShardSelector::ALL)
            .await
            .unwrap();
        assert!(!result.partial);
        assert_eq!(result.traces.len(), 1);
        assert_eq!(result.traces[0].span_count(), 2, "deduplicated union");
    }

    #[tokio::test]
    async fn bloom_negative_blocks_are_not_read() {
        let fixture = fixture(QuerierConfig::default()).await;
        publish_rows(&fixture, vec![row(1, &[1], 200)]).await;

        let result = fixture
            .querier
            .trace_by_id(&tenant(), &TraceId::new([2; 16]), ShardSelector::ALL)
            .await
            .unwrap();
        assert!(result.traces.is_empty());

        assert_eq!(
            fixture
                .querier
                .blocks_skipped
                .get_observer(&metric::Attributes::from(&[("reason", "bloom")]))
                .unwrap()
                .fetch(),
            1
        );
    }

    #[tokio::test]
    async fn failed_ingester_probes_flag_partial() {
        let fixture = fixture(QuerierConfig::default()).await;
        activate_member(&fixture.ring, "ingester-0");
        *fixture.ingesters.fail.lock() = true;

        let result = fixture
            .querier
            .trace_by_id(&tenant(), &TraceId::new([1; 16]), ShardSelector::ALL)
            .await
            .unwrap();
        assert!(result.partial);
    }

    #[tokio::test]
    async fn search_returns_matching_traces_with_limit() {
        let fixture = fixture(QuerierConfig::default()).await;
        publish_rows(
            &fixture,
            vec![
                row(1, &[1], 500),
                row(2, &[1], 200),
                row(3, &[1], 500),
                row(4, &[1], 500),
            ],
        )
        .await;

        let predicate = SpanPredicate::Compare {
            field: Field::Attribute("http.status_code".into()),
            op: CompareOp::Eq,
            value: Scalar::Int(500),
        };
        let result = fixture
            .querier
            .search(
                &tenant(),
                &predicate,
                TimeRange::new(i64::MIN, i64::MAX),
                ShardSelector::ALL,
                2,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.traces.len(), 2, "limit applies");
        assert!(result
            .traces
            .iter()
            .all(|t| t.batches[0].spans[0].attributes[0].1 == AttributeValue::Int(500)));
    }

    #[tokio::test]
    async fn corrupt_block_is_quarantined_and_flagged() {
        let fixture = fixture(QuerierConfig::default()).await;
        publish_rows(&fixture, vec![row(1, &[1], 200)]).await;

        // corrupt the data object in place
        let meta = &fixture.catalog.visible_blocks(&tenant())[0];
        let path = block_file::block_object(&tenant(), &meta.id, block_file::DATA_OBJECT);
        fixture
            .store
            .object_store()
            .put(&path, bytes::Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        let result = fixture
            .querier
            .trace_by_id(&tenant(), &TraceId::new([1; 16]), ShardSelector::ALL)
            .await
            .unwrap();
        assert!(result.partial);
        assert!(result.traces.is_empty());
        assert!(fixture.catalog.is_quarantined(&tenant(), &meta.id));

        // subsequent queries skip the block entirely
        let result = fixture
            .querier
            .trace_by_id(&tenant(), &TraceId::new([1; 16]), ShardSelector::ALL)
            .await
            .unwrap();
        assert!(!result.partial);
    }

    #[tokio::test]
    async fn corrupt_block_fails_hard_when_policy_says_so() {
        let fixture = fixture(QuerierConfig {
            fail_on_corrupt_block: true,
            ..QuerierConfig::default()
        })
        .await;
        publish_rows(&fixture, vec![row(1, &[1], 200)]).await;

        let meta = &fixture.catalog.visible_blocks(&tenant())[0];
        let path = block_file::block_object(&tenant(), &meta.id, block_file::DATA_OBJECT);
        fixture
            .store
            .object_store()
            .put(&path, bytes::Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        let err = fixture
            .querier
            .trace_by_id(&tenant(), &TraceId::new([1; 16]), ShardSelector::ALL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BlockRead { .. }));
    }

    #[tokio::test]
    async fn shards_partition_the_block_set() {
        let fixture = fixture(QuerierConfig::default()).await;
        // publish several single-trace blocks
        for n in 1..=6u8 {
            publish_rows(&fixture, vec![row(n, &[1], 200)]).await;
        }

        let total = 3u32;
        let mut seen = 0usize;
        for index in 0..total {
            let result = fixture
                .querier
                .search(
                    &tenant(),
                    &SpanPredicate::True,
                    TimeRange::new(i64::MIN, i64::MAX),
                    ShardSelector { index, total },
                    100,
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            seen += result.traces.len();
        }
        assert_eq!(seen, 6, "every block is covered by exactly one shard");
    }
}
