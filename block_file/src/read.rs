//! Reading blocks: point lookup, predicate scan, and whole-group streaming.

use crate::{
    column::{decode_column, Column},
    footer::{decode_footer, decode_trailer, Footer, RowGroupMeta, TRAILER_BYTES},
    row_group::{self, decode_traces, CheapView, TraceVerdict, CHEAP_COLUMNS},
};
use async_trait::async_trait;
use bytes::Bytes;
use data_types::{DedicatedColumnKind, TimeRange, TraceId, TraceRow};
use observability_deps::tracing::{debug, trace};
use predicate::{CompareOp, Field, Scalar, SpanPredicate};
use snafu::{OptionExt, ResultExt, Snafu};
use std::{collections::BTreeMap, fmt::Debug, ops::Range, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Errors raised while reading a block.
///
/// Everything except `Fetch` indicates corruption; callers quarantine the
/// block in that case.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("error fetching block bytes: {source}"))]
    Fetch {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("block footer error: {source}"))]
    BadFooter { source: crate::footer::Error },

    #[snafu(display("column {name} missing from footer"))]
    UnknownColumn { name: String },

    #[snafu(display("column {name} failed to decode: {source}"))]
    BadColumn {
        name: String,
        source: crate::column::Error,
    },

    #[snafu(display("row group is inconsistent: {source}"))]
    BadRowGroup { source: row_group::Error },
}

impl Error {
    /// True if the failure indicates corrupt block content rather than a
    /// transient I/O problem.
    pub fn is_corruption(&self) -> bool {
        !matches!(self, Self::Fetch { .. })
    }
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Random-access byte source for one block data object.
///
/// Implementations exist for in-memory bytes (tests, freshly built blocks),
/// local files (ingester linger reads), and object storage.
#[async_trait]
pub trait BlockFetch: Send + Sync + Debug {
    /// Total object size.
    async fn size(&self) -> Result<u64>;

    /// Fetch one byte range.
    async fn fetch(&self, range: Range<u64>) -> Result<Bytes>;
}

/// [`BlockFetch`] over bytes already in memory.
#[derive(Debug, Clone)]
pub struct MemoryBlock(pub Bytes);

#[async_trait]
impl BlockFetch for MemoryBlock {
    async fn size(&self) -> Result<u64> {
        Ok(self.0.len() as u64)
    }

    async fn fetch(&self, range: Range<u64>) -> Result<Bytes> {
        let len = self.0.len() as u64;
        if range.end > len || range.start > range.end {
            return Err(Error::Fetch {
                source: format!("range {range:?} out of bounds (object size {len})").into(),
            });
        }
        Ok(self.0.slice(range.start as usize..range.end as usize))
    }
}

/// [`BlockFetch`] over an object in the object store.
#[derive(Debug)]
pub struct ObjectStoreBlock {
    store: Arc<object_store::DynObjectStore>,
    path: object_store::path::Path,
}

impl ObjectStoreBlock {
    /// Fetch ranges of `path` from `store`.
    pub fn new(store: Arc<object_store::DynObjectStore>, path: object_store::path::Path) -> Self {
        Self { store, path }
    }
}

#[async_trait]
impl BlockFetch for ObjectStoreBlock {
    async fn size(&self) -> Result<u64> {
        let meta = self
            .store
            .head(&self.path)
            .await
            .map_err(|e| Error::Fetch { source: e.into() })?;
        Ok(meta.size as u64)
    }

    async fn fetch(&self, range: Range<u64>) -> Result<Bytes> {
        self.store
            .get_range(&self.path, range.start as usize..range.end as usize)
            .await
            .map_err(|e| Error::Fetch { source: e.into() })
    }
}

/// Outcome of a [`BlockReader::search`].
#[derive(Debug, Default)]
pub struct SearchResult {
    /// Matching traces, fully decoded.
    pub traces: Vec<TraceRow>,
    /// True if the scan stopped early at a row-group boundary because the
    /// caller cancelled.
    pub cancelled: bool,
}

/// Reader over one block data object.
#[derive(Debug)]
pub struct BlockReader<F: BlockFetch> {
    fetch: F,
    footer: Footer,
}

impl<F: BlockFetch> BlockReader<F> {
    /// Open the block: fetch and verify trailer and footer.
    pub async fn open(fetch: F) -> Result<Self> {
        let size = fetch.size().await?;
        if size < TRAILER_BYTES as u64 {
            return Err(Error::BadFooter {
                source: crate::footer::Error::TooSmall,
            });
        }
        let trailer = fetch.fetch(size - TRAILER_BYTES as u64..size).await?;
        let (footer_len, footer_checksum) =
            decode_trailer(&trailer, size).context(BadFooterSnafu)?;

        let footer_start = size - TRAILER_BYTES as u64 - footer_len;
        let footer_bytes = fetch.fetch(footer_start..footer_start + footer_len).await?;
        let footer = decode_footer(&footer_bytes, footer_checksum).context(BadFooterSnafu)?;

        Ok(Self { fetch, footer })
    }

    /// The parsed footer.
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// Number of row groups.
    pub fn row_group_count(&self) -> usize {
        self.footer.row_groups.len()
    }

    async fn fetch_columns(
        &self,
        group: &RowGroupMeta,
        names: impl Iterator<Item = &str>,
    ) -> Result<BTreeMap<String, Column>> {
        let mut columns = BTreeMap::new();
        for name in names {
            if columns.contains_key(name) {
                continue;
            }
            let chunk = group
                .columns
                .get(name)
                .context(UnknownColumnSnafu { name })?;
            let bytes = self
                .fetch
                .fetch(chunk.offset..chunk.offset + chunk.len)
                .await?;
            let column = decode_column(&bytes).context(BadColumnSnafu { name })?;
            columns.insert(name.to_string(), column);
        }
        Ok(columns)
    }

    fn all_column_names(group: &RowGroupMeta) -> impl Iterator<Item = &str> {
        group.columns.keys().map(|s| s.as_str())
    }

    fn cheap_column_names<'g>(&'g self, group: &'g RowGroupMeta) -> impl Iterator<Item = &'g str> {
        CHEAP_COLUMNS.iter().copied().chain(
            group
                .columns
                .keys()
                .filter(|name| name.starts_with("ded_"))
                .map(|s| s.as_str()),
        )
    }

    /// Decode every trace of one row group, in trace-id order. The unit of
    /// streaming for compaction.
    pub async fn read_row_group(&self, index: usize) -> Result<Vec<TraceRow>> {
        let group = &self.footer.row_groups[index];
        let columns = self
            .fetch_columns(group, Self::all_column_names(group))
            .await?;
        decode_traces(&columns).context(BadRowGroupSnafu)
    }

    /// Point lookup. Reads at most the one row group whose id range
    /// brackets the target.
    pub async fn find_trace(&self, trace_id: &TraceId) -> Result<Option<TraceRow>> {
        // row groups do not overlap in trace-id range, so binary search works
        let index = self
            .footer
            .row_groups
            .partition_point(|g| g.max_trace_id < *trace_id);
        let Some(group) = self.footer.row_groups.get(index) else {
            return Ok(None);
        };
        if !group.covers_trace_id(trace_id) {
            return Ok(None);
        }

        trace!(%trace_id, row_group=index, "trace-by-id row group probe");
        let traces = self.read_row_group(index).await?;
        Ok(traces.into_iter().find(|t| &t.trace_id == trace_id))
    }

    /// Predicate scan.
    ///
    /// Row groups are pruned by time range and dedicated-int statistics,
    /// then evaluated on hoisted and dedicated columns only; the generic
    /// attribute columns are fetched just for groups the cheap phase could
    /// not decide. Cancellation is observed at row-group boundaries.
    pub async fn search(
        &self,
        predicate: &SpanPredicate,
        time_range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<SearchResult> {
        let mut result = SearchResult::default();

        for (index, group) in self.footer.row_groups.iter().enumerate() {
            if cancel.is_cancelled() {
                result.cancelled = true;
                return Ok(result);
            }
            if !group.time_range.overlaps(&time_range) {
                continue;
            }
            if prune_by_int_stats(predicate, group, &self.footer) {
                debug!(row_group = index, "row group pruned by dedicated stats");
                continue;
            }

            let cheap = self
                .fetch_columns(group, self.cheap_column_names(group))
                .await?;
            let view = CheapView::new(&cheap).context(BadRowGroupSnafu)?;
            let verdicts = view.evaluate(predicate);
            if verdicts.iter().all(|v| *v == TraceVerdict::No) {
                continue;
            }

            // the cheap phase leaves survivors: materialize the group
            let traces = self.read_row_group(index).await?;
            for (trace, verdict) in traces.into_iter().zip(verdicts) {
                let matched = match verdict {
                    TraceVerdict::No => false,
                    TraceVerdict::Match => true,
                    TraceVerdict::Maybe => trace.batches.iter().any(|batch| {
                        batch.spans.iter().any(|span| {
                            predicate.evaluate(&predicate::FullSpanLens {
                                span,
                                resource: &batch.resource,
                            })
                        })
                    }),
                };
                if matched && trace.time_range().overlaps(&time_range) {
                    result.traces.push(trace);
                }
            }
        }

        Ok(result)
    }
}

/// Collect the top-level conjuncts of a predicate.
fn conjuncts(predicate: &SpanPredicate) -> Vec<&SpanPredicate> {
    match predicate {
        SpanPredicate::And(children) => children.iter().flat_map(conjuncts).collect(),
        other => vec![other],
    }
}

/// True if the dedicated-int statistics prove no span in the group can
/// satisfy the predicate.
fn prune_by_int_stats(
    predicate: &SpanPredicate,
    group: &RowGroupMeta,
    footer: &Footer,
) -> bool {
    for conjunct in conjuncts(predicate) {
        let SpanPredicate::Compare {
            field: Field::Attribute(key),
            op,
            value: Scalar::Int(v),
        } = conjunct
        else {
            continue;
        };
        let is_dedicated_int = footer
            .dedicated
            .iter()
            .any(|d| d.key == key.as_ref() && d.kind == DedicatedColumnKind::Int);
        if !is_dedicated_int {
            continue;
        }

        let satisfiable = match group.dedicated_int_stats.get(key.as_ref()) {
            // the attribute is absent from every span in this group; an
            // absent attribute never satisfies a comparison
            None => false,
            Some((min, max)) => match op {
                CompareOp::Eq => v >= min && v <= max,
                CompareOp::NotEq => !(min == v && max == v),
                CompareOp::Lt => min < v,
                CompareOp::LtEq => min <= v,
                CompareOp::Gt => max > v,
                CompareOp::GtEq => max >= v,
            },
        };
        if !satisfiable {
            return true;
        }
    }
    false
}
