//! Handle all requests from queriers: spans still resident in this process.
//!
//! A trace is served from whatever states it currently occupies: the live
//! store, the cutting set, and any local blocks that have not been GC'd.
//! Results from the three sources are merged and deduplicated before they
//! leave the process.

use crate::Ingester;
use data_types::{TenantId, TimeRange, TraceId, TraceRow};
use observability_deps::tracing::debug;
use predicate::{FullSpanLens, SpanPredicate};
use snafu::Snafu;

/// Errors raised while answering a querier.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum QueryError {
    #[snafu(display("local block read failed: {source}"))]
    LocalBlock { source: block_file::ReadError },
}

impl Ingester {
    /// All spans this process knows for `trace_id`, deduplicated. `None` if
    /// the trace is unknown here.
    pub async fn trace_spans(
        &self,
        tenant: &TenantId,
        trace_id: &TraceId,
    ) -> Result<Option<TraceRow>, QueryError> {
        let mut result: Option<TraceRow> = None;
        let mut add = |row: TraceRow| match &mut result {
            Some(existing) => existing.merge(row),
            None => result = Some(row),
        };

        if let Ok(data) = self.tenant(tenant) {
            if let Some(live) = data.stripe(trace_id).lock().get(trace_id) {
                add(live.row.clone());
            }
            if let Some(cut) = data.cutting.lock().traces.get(trace_id) {
                add(cut.clone());
            }
        }

        for block in self.local_blocks(tenant) {
            if !block.might_contain(trace_id) {
                continue;
            }
            let guard = block.acquire();
            let reader = guard.reader().await.map_err(|source| {
                QueryError::LocalBlock { source }
            })?;
            if let Some(row) = reader
                .find_trace(trace_id)
                .await
                .map_err(|source| QueryError::LocalBlock { source })?
            {
                add(row);
            }
        }

        debug!(
            tenant=%tenant,
            %trace_id,
            spans=result.as_ref().map(|r| r.span_count()).unwrap_or(0),
            "ingester trace-by-id probe"
        );
        Ok(result)
    }

    /// Traces with at least one in-memory or lingering span matching the
    /// filter within the time window.
    pub async fn search_spans(
        &self,
        tenant: &TenantId,
        predicate: &SpanPredicate,
        time_range: TimeRange,
    ) -> Result<Vec<TraceRow>, QueryError> {
        let matches_row = |row: &TraceRow| {
            row.time_range().overlaps(&time_range)
                && row.batches.iter().any(|batch| {
                    batch.spans.iter().any(|span| {
                        predicate.evaluate(&FullSpanLens {
                            span,
                            resource: &batch.resource,
                        })
                    })
                })
        };

        let mut results: Vec<TraceRow> = vec![];
        let mut add = |row: TraceRow| {
            match results.iter_mut().find(|r| r.trace_id == row.trace_id) {
                Some(existing) => existing.merge(row),
                None => results.push(row),
            }
        };

        if let Ok(data) = self.tenant(tenant) {
            for stripe in &data.stripes {
                for live in stripe.lock().values() {
                    if matches_row(&live.row) {
                        add(live.row.clone());
                    }
                }
            }
            for row in data.cutting.lock().traces.values() {
                if matches_row(row) {
                    add(row.clone());
                }
            }
        }

        let cancel = tokio_util::sync::CancellationToken::new();
        for block in self.local_blocks(tenant) {
            if !block.meta().time_range.overlaps(&time_range) {
                continue;
            }
            let guard = block.acquire();
            let reader = guard
                .reader()
                .await
                .map_err(|source| QueryError::LocalBlock { source })?;
            let found = reader
                .search(predicate, time_range, &cancel)
                .await
                .map_err(|source| QueryError::LocalBlock { source })?;
            for row in found.traces {
                add(row);
            }
        }

        results.sort_by_key(|r| r.trace_id);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use predicate::{CompareOp, Field, Scalar};

    fn all_time() -> TimeRange {
        TimeRange::new(i64::MIN, i64::MAX)
    }

    #[tokio::test]
    async fn serves_traces_across_states() {
        let fixture = test_ingester(|_| {});
        let ingester = &fixture.ingester;

        // trace 1 will be flushed into a local block, trace 2 cut, trace 3
        // stays live
        ingester.write(&tenant(), batch_for(1, 1)).unwrap();
        ingester.cut_all();
        ingester.flush_ready(true).await.unwrap();

        ingester.write(&tenant(), batch_for(2, 1)).unwrap();
        ingester.cut_all();

        ingester.write(&tenant(), batch_for(3, 1)).unwrap();

        for n in 1..=3u8 {
            let row = ingester
                .trace_spans(&tenant(), &TraceId::new([n; 16]))
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("trace {n} should be queryable"));
            assert_eq!(row.span_count(), 1, "trace {n}");
        }

        assert!(ingester
            .trace_spans(&tenant(), &TraceId::new([9; 16]))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn merges_and_dedups_across_states() {
        let fixture = test_ingester(|_| {});
        let ingester = &fixture.ingester;

        // same span lands in a local block AND is replayed live (the
        // crash-recovery overlap case)
        ingester.write(&tenant(), batch_for(1, 1)).unwrap();
        ingester.cut_all();
        ingester.flush_ready(true).await.unwrap();
        ingester.write(&tenant(), batch_for(1, 1)).unwrap();
        ingester.write(&tenant(), batch_for(1, 2)).unwrap();

        let row = ingester
            .trace_spans(&tenant(), &TraceId::new([1; 16]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.span_count(), 2, "duplicate span appears exactly once");
    }

    #[tokio::test]
    async fn search_covers_live_and_local() {
        let fixture = test_ingester(|_| {});
        let ingester = &fixture.ingester;

        ingester.write(&tenant(), batch_for(1, 1)).unwrap();
        ingester.cut_all();
        ingester.flush_ready(true).await.unwrap();
        ingester.write(&tenant(), batch_for(2, 1)).unwrap();

        let predicate = SpanPredicate::Compare {
            field: Field::Attribute("http.status_code".into()),
            op: CompareOp::Eq,
            value: Scalar::Int(200),
        };
        let results = ingester
            .search_spans(&tenant(), &predicate, all_time())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        // time window excludes trace 2 (starts at 2000ns)
        let results = ingester
            .search_spans(&tenant(), &predicate, TimeRange::new(0, 1_500))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].trace_id, TraceId::new([1; 16]));

        // non-matching filter
        let predicate = SpanPredicate::Compare {
            field: Field::Attribute("http.status_code".into()),
            op: CompareOp::Eq,
            value: Scalar::Int(500),
        };
        assert!(ingester
            .search_spans(&tenant(), &predicate, all_time())
            .await
            .unwrap()
            .is_empty());
    }
}
