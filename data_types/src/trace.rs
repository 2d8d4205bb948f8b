//! Trace assembly: grouping spans by resource, merging span sets, and the
//! summaries returned by search.

use crate::{Resource, Span, SpanBatch, SpanId, TimeRange, TraceId};
use std::{collections::HashSet, sync::Arc};

/// All spans currently known for one trace id, grouped by resource.
///
/// This is both a query result (the union of whatever ingesters and blocks
/// returned) and the row type fed to the block encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRow {
    /// The trace id.
    pub trace_id: TraceId,
    /// Spans grouped by the resource they arrived with.
    pub batches: Vec<SpanBatch>,
}

impl TraceRow {
    /// An empty row for `trace_id`.
    pub fn new(trace_id: TraceId) -> Self {
        Self {
            trace_id,
            batches: vec![],
        }
    }

    /// Total number of spans across all resource groups.
    pub fn span_count(&self) -> usize {
        self.batches.iter().map(|b| b.spans.len()).sum()
    }

    /// True if no spans are present.
    pub fn is_empty(&self) -> bool {
        self.span_count() == 0
    }

    /// Append `spans` under `resource`, reusing an existing group with an
    /// identical resource.
    pub fn push_spans(&mut self, resource: &Resource, spans: impl IntoIterator<Item = Span>) {
        match self.batches.iter_mut().find(|b| &b.resource == resource) {
            Some(batch) => batch.spans.extend(spans),
            None => self.batches.push(SpanBatch {
                resource: resource.clone(),
                spans: spans.into_iter().collect(),
            }),
        }
    }

    /// Merge another span set for the same trace, then dedup.
    ///
    /// # Panics
    ///
    /// If the trace ids differ.
    pub fn merge(&mut self, other: Self) {
        assert_eq!(self.trace_id, other.trace_id, "merging different traces");
        for batch in other.batches {
            self.push_spans(&batch.resource.clone(), batch.spans);
        }
        self.dedup();
    }

    /// Drop duplicate spans, keeping the first copy of each
    /// `(span_id, attributes_hash)` pair across all resource groups.
    pub fn dedup(&mut self) {
        let mut seen: HashSet<(SpanId, u64)> = HashSet::with_capacity(self.span_count());
        for batch in &mut self.batches {
            batch.spans.retain(|span| seen.insert(span.dedup_key()));
        }
        self.batches.retain(|b| !b.spans.is_empty());
    }

    /// The time range covered by the trace's spans.
    pub fn time_range(&self) -> TimeRange {
        let mut range = TimeRange::EMPTY;
        for batch in &self.batches {
            for span in &batch.spans {
                range.observe(span.start_unix_nanos);
                range.observe(span.end_unix_nanos);
            }
        }
        range
    }

    /// Build the search-result summary for this trace.
    pub fn summary(&self) -> TraceSummary {
        // the root is the span without a parent; fall back to the earliest
        let root = self
            .batches
            .iter()
            .flat_map(|b| &b.spans)
            .find(|s| s.parent_span_id.is_none())
            .or_else(|| {
                self.batches
                    .iter()
                    .flat_map(|b| &b.spans)
                    .min_by_key(|s| s.start_unix_nanos)
            });

        let mut services: Vec<Arc<str>> = self
            .batches
            .iter()
            .map(|b| Arc::clone(&b.resource.service_name))
            .collect();
        services.sort();
        services.dedup();

        let range = self.time_range();
        TraceSummary {
            trace_id: self.trace_id,
            root_name: root.map(|s| Arc::clone(&s.name)).unwrap_or_else(|| "".into()),
            start_unix_nanos: if range.is_empty() { 0 } else { range.min },
            duration_nanos: if range.is_empty() {
                0
            } else {
                range.max - range.min
            },
            span_count: self.span_count() as u64,
            services,
        }
    }
}

/// The per-trace line streamed back by search.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TraceSummary {
    /// The trace id.
    pub trace_id: TraceId,
    /// Root operation name (or the earliest span's name if no root arrived).
    pub root_name: Arc<str>,
    /// Earliest span start.
    pub start_unix_nanos: i64,
    /// Span of wall-clock time covered.
    pub duration_nanos: i64,
    /// Number of spans known at query time.
    pub span_count: u64,
    /// Distinct service names present.
    pub services: Vec<Arc<str>>,
}
