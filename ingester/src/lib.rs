//! The ingester: in-memory live trace assembly backed by a write-ahead log,
//! with cut, block build, and flush to object storage.
//!
//! Write path: WAL append (fsynced) → live-trace buffer → ack. A background
//! loop cuts idle, aged, or oversized traces into a per-tenant cutting set,
//! builds columnar blocks out of it, uploads them, retires the WAL, and
//! keeps the block readable locally for a linger period.
//!
//! Per-trace state machine: `LIVE → CUT → LOCAL_COMPLETE → FLUSHED → GC'd`.
//! A trace is queryable from this process in any state before GC.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use block_file::{BlockConfig, BlockStore};
use data_types::{SequenceNumber, SpanBatch, TenantId, TraceId, TraceRow};
use largo_time::{Time, TimeProvider};
use metric::{Metric, U64Counter, U64Gauge};
use observability_deps::tracing::{debug, info};
use parking_lot::{Mutex, RwLock};
use snafu::{ResultExt, Snafu};
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use wal::{Wal, WalConfig};

mod flush;
mod lifecycle;
mod query;

pub use flush::{LocalBlock, LocalBlockReadGuard};
pub use lifecycle::run_ingester_loop;
pub use query::QueryError;

/// Number of live-trace stripes per tenant; each has its own mutex.
const STRIPES: usize = 64;

/// Errors surfaced on the write path.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum WriteError {
    #[snafu(display("wal append failed: {source}"))]
    WalAppend { source: wal::Error },

    #[snafu(display("ingester is over its memory limit, ingest paused"))]
    Paused,
}

/// Errors surfaced by flush and replay.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("wal error: {source}"))]
    Wal { source: wal::Error },

    #[snafu(display("block build failed: {source}"))]
    Build { source: block_file::WriteError },

    #[snafu(display("block upload failed after retries: {source}"))]
    Upload {
        source: backoff::RetriesExhausted<block_file::StoreError>,
    },

    #[snafu(display("local block io failed at {}: {source}", path.display()))]
    LocalIo {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Ingester tuning knobs.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Cut a live trace once its buffered bytes exceed this.
    pub max_trace_bytes: usize,
    /// Cut a live trace that has not seen a span for this long.
    pub max_trace_idle: Duration,
    /// Cut a live trace this long after its first span regardless of
    /// activity.
    pub max_trace_age: Duration,
    /// Force-cut the largest traces once process-wide buffered bytes exceed
    /// this.
    pub cut_memory_bytes: usize,
    /// Reject writes once process-wide buffered bytes exceed this. Must be
    /// larger than `cut_memory_bytes` so cutting can catch up.
    pub pause_bytes: usize,
    /// Build a block once a tenant's cutting set reaches this size.
    pub flush_threshold_bytes: usize,
    /// Build a block once a tenant's cutting set has been open this long.
    pub flush_threshold_age: Duration,
    /// Keep flushed blocks readable locally for this long.
    pub linger_period: Duration,
    /// Hard bound on the linger: drop the local copy even if readers still
    /// hold it open.
    pub linger_hard_ttl: Duration,
    /// Upload retries before a flush attempt is abandoned (and retried on
    /// the next loop pass).
    pub max_flush_retries: usize,
    /// Block layout knobs.
    pub block: BlockConfig,
    /// WAL knobs.
    pub wal: WalConfig,
}

impl IngesterConfig {
    /// Reasonable defaults on top of a WAL root directory.
    pub fn new(wal_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            max_trace_bytes: 10 * 1024 * 1024,
            max_trace_idle: Duration::from_secs(10),
            max_trace_age: Duration::from_secs(30),
            cut_memory_bytes: 512 * 1024 * 1024,
            pause_bytes: 768 * 1024 * 1024,
            flush_threshold_bytes: 128 * 1024 * 1024,
            flush_threshold_age: Duration::from_secs(30),
            linger_period: Duration::from_secs(60),
            linger_hard_ttl: Duration::from_secs(300),
            max_flush_retries: 5,
            block: BlockConfig::default(),
            wal: WalConfig::new(wal_root),
        }
    }
}

/// One trace being assembled in memory.
#[derive(Debug)]
struct LiveTrace {
    row: TraceRow,
    first_seen: Time,
    last_update: Time,
    size_bytes: usize,
    /// Lowest WAL sequence that contributed a span to this trace; drives the
    /// WAL retirement watermark.
    first_sequence: SequenceNumber,
}

/// The traces cut out of the live store, awaiting block build.
#[derive(Debug, Default)]
struct CuttingSet {
    traces: HashMap<TraceId, TraceRow>,
    bytes: usize,
    opened_at: Option<Time>,
    first_sequence: Option<SequenceNumber>,
}

/// Per-tenant ingest state.
#[derive(Debug)]
pub(crate) struct TenantData {
    pub(crate) tenant: TenantId,
    pub(crate) wal: Arc<wal::TenantWal>,
    pub(crate) stripes: Vec<Mutex<HashMap<TraceId, LiveTrace>>>,
    pub(crate) cutting: Mutex<CuttingSet>,
    /// LOCAL_COMPLETE and FLUSHED blocks still readable from this process.
    pub(crate) local_blocks: Mutex<Vec<Arc<LocalBlock>>>,
}

impl TenantData {
    fn stripe(&self, trace_id: &TraceId) -> &Mutex<HashMap<TraceId, LiveTrace>> {
        let index = (trace_id.high_bits() as usize) % STRIPES;
        &self.stripes[index]
    }

    /// The WAL sequence below which every span is either flushed or gone.
    pub(crate) fn retire_watermark(&self) -> SequenceNumber {
        // snapshot the max BEFORE scanning: an append racing with the scan
        // either shows up in a stripe below or has a sequence above this
        let max_assigned = self.wal.max_sequence();
        let mut min_unflushed: Option<SequenceNumber> = None;
        let mut observe = |seq: SequenceNumber| {
            min_unflushed = Some(match min_unflushed {
                Some(current) => current.min(seq),
                None => seq,
            });
        };
        for stripe in &self.stripes {
            for trace in stripe.lock().values() {
                observe(trace.first_sequence);
            }
        }
        if let Some(seq) = self.cutting.lock().first_sequence {
            observe(seq);
        }
        match min_unflushed {
            Some(seq) => SequenceNumber::new(seq.get() - 1),
            None => max_assigned,
        }
    }
}

/// The ingester of one process.
#[derive(Debug)]
pub struct Ingester {
    pub(crate) config: IngesterConfig,
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    pub(crate) block_store: BlockStore,
    wal: Wal,
    tenants: RwLock<HashMap<TenantId, Arc<TenantData>>>,
    /// Bytes buffered across all tenants, live plus cutting; released once
    /// a block upload succeeds.
    pub(crate) buffered_bytes: AtomicUsize,

    pub(crate) cut_count: Metric<U64Counter>,
    pub(crate) flush_count: Metric<U64Counter>,
    pub(crate) dropped_span_count: Metric<U64Counter>,
    pub(crate) buffered_bytes_gauge: Metric<U64Gauge>,
}

impl Ingester {
    /// Create an ingester. Call [`replay`](Self::replay) before serving
    /// writes.
    pub fn new(
        config: IngesterConfig,
        block_store: BlockStore,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Self {
        assert!(
            config.pause_bytes > config.cut_memory_bytes,
            "pause_bytes must exceed cut_memory_bytes so cutting can free memory"
        );
        let wal = Wal::new(config.wal.clone());
        Self {
            config,
            time_provider,
            block_store,
            wal,
            tenants: Default::default(),
            buffered_bytes: AtomicUsize::new(0),
            cut_count: metric_registry.register_metric(
                "ingester_cut_count",
                "traces moved from the live store to the cutting set, by trigger",
            ),
            flush_count: metric_registry.register_metric(
                "ingester_flush_count",
                "block build and upload outcomes",
            ),
            dropped_span_count: metric_registry.register_metric(
                "ingester_dropped_spans",
                "spans dropped because a live trace hit its byte cap",
            ),
            buffered_bytes_gauge: metric_registry.register_metric(
                "ingester_buffered_bytes",
                "bytes buffered in live and cutting traces",
            ),
        }
    }

    pub(crate) fn tenant(&self, tenant: &TenantId) -> Result<Arc<TenantData>, wal::Error> {
        if let Some(data) = self.tenants.read().get(tenant) {
            return Ok(Arc::clone(data));
        }
        let tenant_wal = self.wal.tenant(tenant)?;
        let mut tenants = self.tenants.write();
        let data = tenants.entry(tenant.clone()).or_insert_with(|| {
            Arc::new(TenantData {
                tenant: tenant.clone(),
                wal: tenant_wal,
                stripes: (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
                cutting: Default::default(),
                local_blocks: Default::default(),
            })
        });
        Ok(Arc::clone(data))
    }

    pub(crate) fn tenant_snapshot(&self) -> Vec<Arc<TenantData>> {
        self.tenants.read().values().map(Arc::clone).collect()
    }

    /// Accept one batch: WAL first, then the live store.
    ///
    /// Returns [`WriteError::Paused`] under memory pressure; the caller
    /// surfaces that as a capacity error and may retry.
    pub fn write(&self, tenant: &TenantId, batch: SpanBatch) -> Result<(), WriteError> {
        if self.buffered_bytes.load(Ordering::Relaxed) > self.config.pause_bytes {
            return Err(WriteError::Paused);
        }

        let data = self.tenant(tenant).context(WalAppendSnafu)?;
        let sequence = data.wal.append(&batch).context(WalAppendSnafu)?;
        self.buffer_batch(&data, batch, sequence);
        Ok(())
    }

    /// Insert a batch into the live store. Shared by the write path and WAL
    /// replay.
    fn buffer_batch(&self, data: &TenantData, batch: SpanBatch, sequence: SequenceNumber) {
        let now = self.time_provider.now();
        let resource = batch.resource;
        let mut by_trace: HashMap<TraceId, Vec<data_types::Span>> = HashMap::new();
        for span in batch.spans {
            by_trace.entry(span.trace_id).or_default().push(span);
        }

        let mut added_bytes = 0usize;
        let mut dropped = 0u64;
        for (trace_id, spans) in by_trace {
            let mut stripe = data.stripe(&trace_id).lock();
            let live = match stripe.entry(trace_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(LiveTrace {
                    row: TraceRow::new(trace_id),
                    first_seen: now,
                    last_update: now,
                    size_bytes: 0,
                    first_sequence: sequence,
                }),
            };

            // the cap has headroom over the cut trigger; drops only start
            // once cutting has fallen this far behind. A trace under the
            // cap always accepts the span that crosses it.
            let hard_cap = self.config.max_trace_bytes.saturating_mul(2);
            let mut kept = Vec::with_capacity(spans.len());
            for span in spans {
                let span_bytes = span.size_bytes();
                if live.size_bytes >= hard_cap {
                    dropped += 1;
                    continue;
                }
                live.size_bytes += span_bytes;
                added_bytes += span_bytes;
                kept.push(span);
            }
            if !kept.is_empty() {
                live.row.push_spans(&resource, kept);
                live.last_update = now;
                live.first_sequence = live.first_sequence.min(sequence);
            }
        }

        if dropped > 0 {
            debug!(tenant=%data.tenant, dropped, "dropped spans over per-trace byte cap");
            self.dropped_span_count
                .recorder([("tenant", data.tenant.to_string())])
                .inc(dropped);
        }
        let total = self
            .buffered_bytes
            .fetch_add(added_bytes, Ordering::Relaxed)
            + added_bytes;
        self.buffered_bytes_gauge
            .recorder(metric::Attributes::default())
            .set(total as u64);
    }

    /// Rebuild the live store from the WAL after a restart.
    ///
    /// Replayed spans that were already flushed before the crash produce a
    /// duplicate block later; compaction removes the duplicates.
    pub fn replay(&self) -> Result<()> {
        let tenants = self.wal.tenants_on_disk().context(WalSnafu)?;
        for tenant in tenants {
            let records = self.wal.replay_tenant(&tenant).context(WalSnafu)?;
            let data = self.tenant(&tenant).context(WalSnafu)?;
            let count = records.len();
            for record in records {
                self.buffer_batch(&data, record.batch, record.sequence);
            }
            info!(tenant=%tenant, records=count, "rebuilt live store from wal");
        }
        Ok(())
    }

    /// Current process-wide buffered bytes.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    /// True if writes are currently rejected for memory pressure.
    pub fn is_paused(&self) -> bool {
        self.buffered_bytes() > self.config.pause_bytes
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn write_buffers_and_survives_replay() {
        let fixture = test_ingester(|_| {});
        let ingester = &fixture.ingester;

        ingester.write(&tenant(), batch_for(1, 1)).unwrap();
        ingester.write(&tenant(), batch_for(1, 2)).unwrap();
        ingester.write(&tenant(), batch_for(2, 1)).unwrap();
        assert!(ingester.buffered_bytes() > 0);

        // simulate crash: new ingester over the same wal dir
        let store = fixture.store.clone();
        let registry = metric::Registry::new();
        let replayed = Ingester::new(
            ingester.config.clone(),
            store,
            Arc::clone(&fixture.time_provider) as _,
            &registry,
        );
        replayed.replay().unwrap();

        let data = replayed.tenant(&tenant()).unwrap();
        let stripe = data.stripe(&TraceId::new([1; 16])).lock();
        let live = stripe.get(&TraceId::new([1; 16])).expect("trace replayed");
        assert_eq!(live.row.span_count(), 2);
        assert_eq!(live.first_sequence, SequenceNumber::new(1));
    }

    #[test]
    fn oversized_trace_drops_spans_at_hard_cap() {
        let fixture = test_ingester(|c| {
            c.max_trace_bytes = 1; // hard cap 2 bytes: everything after the
                                   // first span is dropped
        });
        let ingester = &fixture.ingester;

        ingester.write(&tenant(), batch_for(1, 1)).unwrap();
        ingester.write(&tenant(), batch_for(1, 2)).unwrap();

        let data = ingester.tenant(&tenant()).unwrap();
        let stripe = data.stripe(&TraceId::new([1; 16])).lock();
        assert_eq!(stripe.get(&TraceId::new([1; 16])).unwrap().row.span_count(), 1);
        drop(stripe);

        let dropped = ingester
            .dropped_span_count
            .get_observer(&metric::Attributes::from([(
                "tenant",
                tenant().to_string(),
            )]))
            .unwrap()
            .fetch();
        assert_eq!(dropped, 1);
    }

    #[test]
    fn pause_rejects_writes() {
        let fixture = test_ingester(|c| {
            c.cut_memory_bytes = 1;
            c.pause_bytes = 2;
        });
        let ingester = &fixture.ingester;

        ingester.write(&tenant(), batch_for(1, 1)).unwrap();
        assert!(ingester.is_paused());
        assert!(matches!(
            ingester.write(&tenant(), batch_for(2, 1)),
            Err(WriteError::Paused)
        ));
    }

    #[test]
    fn watermark_tracks_oldest_unflushed_trace() {
        let fixture = test_ingester(|_| {});
        let ingester = &fixture.ingester;

        ingester.write(&tenant(), batch_for(1, 1)).unwrap(); // seq 1
        ingester.write(&tenant(), batch_for(2, 1)).unwrap(); // seq 2
        let data = ingester.tenant(&tenant()).unwrap();

        // nothing flushed: cannot retire anything
        assert_eq!(data.retire_watermark(), SequenceNumber::new(0));

        // drop trace 1 from the live store as if it had been flushed
        data.stripe(&TraceId::new([1; 16]))
            .lock()
            .remove(&TraceId::new([1; 16]));
        assert_eq!(data.retire_watermark(), SequenceNumber::new(1));

        // all flushed: watermark is the highest assigned sequence
        data.stripe(&TraceId::new([2; 16]))
            .lock()
            .remove(&TraceId::new([2; 16]));
        assert_eq!(data.retire_watermark(), SequenceNumber::new(2));
    }
}
