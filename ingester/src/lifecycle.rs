//! The cut policy: moves traces out of the live store and drives the flush
//! and GC passes.
//!
//! Byte counts here are estimates; the policy only needs to keep memory use
//! roughly under the configured bounds and individual blocks near their
//! target size. A trace is cut when it has gone idle, exceeded its age
//! bound, or outgrown its byte cap, and the largest traces are force-cut
//! when the process as a whole is over its memory threshold.

use crate::{Ingester, TenantData};
use data_types::{SequenceNumber, TraceId};
use largo_time::Time;
use observability_deps::tracing::{error, info};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// How often the cut/flush/GC pass runs.
const CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CutTrigger {
    Idle,
    Age,
    Size,
    Memory,
    Shutdown,
}

impl CutTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Age => "age",
            Self::Size => "size",
            Self::Memory => "memory",
            Self::Shutdown => "shutdown",
        }
    }
}

impl Ingester {
    /// Move one trace into the tenant's cutting set.
    fn cut_trace(
        &self,
        data: &TenantData,
        trace_id: TraceId,
        trigger: CutTrigger,
    ) -> Option<()> {
        let live = data.stripe(&trace_id).lock().remove(&trace_id)?;
        let now = self.time_provider.now();

        let mut cutting = data.cutting.lock();
        cutting.bytes += live.size_bytes;
        cutting.opened_at.get_or_insert(now);
        cutting.first_sequence = Some(match cutting.first_sequence {
            Some(seq) => seq.min(live.first_sequence),
            None => live.first_sequence,
        });
        match cutting.traces.entry(trace_id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                // the id was cut before and received new spans afterwards
                entry.get_mut().merge(live.row);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(live.row);
            }
        }
        drop(cutting);

        self.cut_count
            .recorder(&[("trigger", trigger.as_str())])
            .inc(1);
        Some(())
    }

    /// One pass of the cut policy over every tenant.
    pub fn maybe_cut(&self) {
        let now = self.time_provider.now();
        let older_than = |t: Time, bound: Duration| {
            now.checked_duration_since(t)
                .map(|age| age > bound)
                .unwrap_or(false)
        };

        // per-trace triggers
        for data in self.tenant_snapshot() {
            let mut to_cut: Vec<(TraceId, CutTrigger)> = vec![];
            for stripe in &data.stripes {
                for (trace_id, live) in stripe.lock().iter() {
                    let trigger = if live.size_bytes > self.config.max_trace_bytes {
                        CutTrigger::Size
                    } else if older_than(live.first_seen, self.config.max_trace_age) {
                        CutTrigger::Age
                    } else if older_than(live.last_update, self.config.max_trace_idle) {
                        CutTrigger::Idle
                    } else {
                        continue;
                    };
                    to_cut.push((*trace_id, trigger));
                }
            }
            for (trace_id, trigger) in to_cut {
                self.cut_trace(&data, trace_id, trigger);
            }
        }

        // memory pressure: cut the largest remaining live traces until the
        // process is back under the threshold. It's ok if the estimate is
        // stale, the next pass catches up.
        let mut total = self.buffered_bytes();
        if total > self.config.cut_memory_bytes {
            let mut candidates: Vec<(usize, Arc<TenantData>, TraceId)> = vec![];
            for data in self.tenant_snapshot() {
                for stripe in &data.stripes {
                    for (trace_id, live) in stripe.lock().iter() {
                        candidates.push((live.size_bytes, Arc::clone(&data), *trace_id));
                    }
                }
            }
            candidates.sort_by(|a, b| b.0.cmp(&a.0));

            for (size, data, trace_id) in candidates {
                if total <= self.config.cut_memory_bytes {
                    break;
                }
                if self.cut_trace(&data, trace_id, CutTrigger::Memory).is_some() {
                    // cut traces stay buffered until flushed, but they are now
                    // eligible for the flush pass which is what frees memory
                    total = total.saturating_sub(size);
                }
            }
        }
    }

    /// Cut everything immediately, e.g. on shutdown.
    pub fn cut_all(&self) {
        for data in self.tenant_snapshot() {
            let ids: Vec<TraceId> = data
                .stripes
                .iter()
                .flat_map(|s| s.lock().keys().copied().collect::<Vec<_>>())
                .collect();
            for trace_id in ids {
                self.cut_trace(&data, trace_id, CutTrigger::Shutdown);
            }
        }
    }

    /// Take the cutting set for block build if it crossed a threshold (or
    /// unconditionally with `force`).
    pub(crate) fn take_cutting_set(&self, data: &TenantData, force: bool) -> Option<PendingFlush> {
        let now = self.time_provider.now();
        let mut cutting = data.cutting.lock();
        if cutting.traces.is_empty() {
            return None;
        }

        let aged = cutting
            .opened_at
            .and_then(|t| now.checked_duration_since(t))
            .map(|age| age > self.config.flush_threshold_age)
            .unwrap_or(false);
        if !force && !aged && cutting.bytes < self.config.flush_threshold_bytes {
            return None;
        }

        let bytes = cutting.bytes;
        let first_sequence = cutting.first_sequence;
        let mut traces: Vec<data_types::TraceRow> =
            cutting.traces.drain().map(|(_, row)| row).collect();
        cutting.bytes = 0;
        cutting.opened_at = None;
        cutting.first_sequence = None;
        drop(cutting);

        traces.sort_by_key(|t| t.trace_id);
        // safe to compute after the drain: the drained traces are exactly
        // the ones this flush will persist
        let watermark = data.retire_watermark();
        Some(PendingFlush {
            traces,
            bytes,
            first_sequence,
            watermark,
        })
    }

    /// Put an unflushable cutting set back so no acknowledged span is lost;
    /// the next pass retries.
    pub(crate) fn restore_cutting_set(&self, data: &TenantData, pending: PendingFlush) {
        let now = self.time_provider.now();
        let mut cutting = data.cutting.lock();
        cutting.bytes += pending.bytes;
        cutting.opened_at.get_or_insert(now);
        cutting.first_sequence = match (cutting.first_sequence, pending.first_sequence) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        for row in pending.traces {
            match cutting.traces.entry(row.trace_id) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().merge(row)
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(row);
                }
            }
        }
    }
}

/// A cutting set drained for block build.
#[derive(Debug)]
pub(crate) struct PendingFlush {
    /// Sorted by trace id.
    pub traces: Vec<data_types::TraceRow>,
    pub bytes: usize,
    pub first_sequence: Option<SequenceNumber>,
    /// WAL sequence safe to retire once this set is durable.
    pub watermark: SequenceNumber,
}

/// Runs the cut, flush, and GC passes until shutdown, then performs a final
/// cut-and-flush so a clean shutdown leaves no data behind in the WAL.
pub async fn run_ingester_loop(ingester: Arc<Ingester>, shutdown: CancellationToken) {
    loop {
        ingester.maybe_cut();
        if let Err(e) = ingester.flush_ready(false).await {
            error!(error=%e, "flush pass failed, will retry");
        }
        ingester.gc_local_blocks();

        tokio::select! {
            _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            _ = shutdown.cancelled() => {
                info!("ingester loop shutting down, flushing remaining data");
                ingester.cut_all();
                if let Err(e) = ingester.flush_ready(true).await {
                    error!(error=%e, "final flush on shutdown failed, wal will replay");
                }
                return;
            }
        }
    }
}
