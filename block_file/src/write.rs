//! Building a complete block from sorted trace rows.

use crate::{
    bloom::BloomFilter,
    column::encode_column,
    footer::{encode_footer, ColumnChunk, Footer, RowGroupMeta},
    row_group::build_columns,
};
use bytes::Bytes;
use data_types::{
    BlockId, BlockMeta, CompactionLevel, DedicatedColumnSpec, TenantId, TimeRange, TraceId,
    TraceRow, FORMAT_VERSION,
};
use observability_deps::tracing::debug;
use snafu::{ensure, ResultExt, Snafu};

/// Block build knobs.
#[derive(Debug, Clone)]
pub struct BlockConfig {
    /// A row group is cut once its (estimated, uncompressed) span bytes
    /// exceed this.
    pub row_group_target_bytes: usize,
    /// Dedicated columns to materialize.
    pub dedicated_columns: Vec<DedicatedColumnSpec>,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            row_group_target_bytes: 100 * 1024 * 1024,
            dedicated_columns: vec![],
        }
    }
}

/// Errors raised while building a block.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("cannot build a block out of zero spans"))]
    NoSpans,

    #[snafu(display("column encoding error: {source}"))]
    Column { source: crate::column::Error },

    #[snafu(display("footer encoding error: {source}"))]
    Footer { source: crate::footer::Error },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A fully built block, ready to publish.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    /// Descriptor, also the `meta.json` payload.
    pub meta: BlockMeta,
    /// The columnar `data` object.
    pub data: Bytes,
    /// The serialized `bloom_0` object.
    pub bloom: Bytes,
}

/// Incremental block builder.
///
/// Rows must arrive sorted by trace id; consecutive rows with the same id
/// are merged and their spans deduplicated, so replica duplicates collapse
/// here. Memory holds one pending row group plus the output bytes, which is
/// what lets compaction stream arbitrarily large inputs.
#[derive(Debug)]
pub struct BlockWriter {
    tenant: TenantId,
    id: BlockId,
    compaction_level: CompactionLevel,
    config: BlockConfig,

    data: Vec<u8>,
    row_groups: Vec<RowGroupMeta>,
    pending: Vec<TraceRow>,
    pending_bytes: usize,

    trace_ids: Vec<TraceId>,
    time_range: TimeRange,
    trace_count: u64,
    span_count: u64,
}

impl BlockWriter {
    /// Start a block.
    pub fn new(
        tenant: TenantId,
        id: BlockId,
        compaction_level: CompactionLevel,
        config: BlockConfig,
    ) -> Self {
        Self {
            tenant,
            id,
            compaction_level,
            config,
            data: Vec::new(),
            row_groups: Vec::new(),
            pending: Vec::new(),
            pending_bytes: 0,
            trace_ids: Vec::new(),
            time_range: TimeRange::EMPTY,
            trace_count: 0,
            span_count: 0,
        }
    }

    /// Append the next trace row (sorted order).
    ///
    /// # Panics
    ///
    /// If `row.trace_id` is below the previously pushed id.
    pub fn push_row(&mut self, mut row: TraceRow) -> Result<()> {
        row.dedup();
        if let Some(last) = self.pending.last_mut() {
            if last.trace_id == row.trace_id {
                last.merge(row);
                return Ok(());
            }
            assert!(
                last.trace_id < row.trace_id,
                "block input must be sorted by trace id"
            );
        } else if let Some(last_flushed) = self.trace_ids.last() {
            assert!(
                *last_flushed < row.trace_id,
                "block input must be sorted by trace id"
            );
        }
        if row.is_empty() {
            return Ok(());
        }
        // a group is only cut at a trace-id boundary, so late copies of the
        // current id can always still be merged
        if self.pending_bytes >= self.config.row_group_target_bytes {
            self.flush_group()?;
        }
        self.pending_bytes += row.batches.iter().map(|b| b.size_bytes()).sum::<usize>();
        self.pending.push(row);
        Ok(())
    }

    fn flush_group(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let (columns, stats) = build_columns(&self.pending, &self.config.dedicated_columns);
        let mut chunk_index = std::collections::BTreeMap::new();
        for (name, column) in &columns {
            let encoded = encode_column(column).context(ColumnSnafu)?;
            chunk_index.insert(
                name.clone(),
                ColumnChunk {
                    offset: self.data.len() as u64,
                    len: encoded.len() as u64,
                },
            );
            self.data.extend_from_slice(&encoded);
        }
        self.row_groups.push(RowGroupMeta {
            min_trace_id: stats.min_trace_id,
            max_trace_id: stats.max_trace_id,
            time_range: stats.time_range,
            trace_count: stats.trace_count,
            span_count: stats.span_count,
            columns: chunk_index,
            dedicated_int_stats: stats.dedicated_int_stats,
        });

        self.trace_ids.extend(self.pending.iter().map(|t| t.trace_id));
        self.time_range = self.time_range.union(&stats.time_range);
        self.trace_count += stats.trace_count;
        self.span_count += stats.span_count;
        self.pending.clear();
        self.pending_bytes = 0;
        Ok(())
    }

    /// Bytes written so far (excluding the pending row group and footer).
    pub fn approx_size(&self) -> usize {
        self.data.len() + self.pending_bytes
    }

    /// Traces pushed so far.
    pub fn trace_count(&self) -> u64 {
        self.trace_count + self.pending.len() as u64
    }

    /// Seal the block.
    pub fn finish(mut self) -> Result<EncodedBlock> {
        self.flush_group()?;
        ensure!(!self.row_groups.is_empty(), NoSpansSnafu);

        let mut bloom = BloomFilter::with_capacity(self.trace_ids.len());
        for trace_id in &self.trace_ids {
            bloom.insert(trace_id);
        }

        let footer = Footer {
            row_groups: self.row_groups,
            dedicated: self.config.dedicated_columns.clone(),
        };
        let footer_bytes = encode_footer(&footer).context(FooterSnafu)?;
        self.data.extend_from_slice(&footer_bytes);

        let meta = BlockMeta {
            tenant: self.tenant,
            id: self.id,
            format_version: FORMAT_VERSION,
            min_trace_id: footer.row_groups.first().expect("non-empty").min_trace_id,
            max_trace_id: footer.row_groups.last().expect("non-empty").max_trace_id,
            time_range: self.time_range,
            trace_count: self.trace_count,
            span_count: self.span_count,
            size_bytes: self.data.len() as u64,
            compaction_level: self.compaction_level,
            dedicated_columns: self.config.dedicated_columns,
        };

        debug!(
            tenant=%meta.tenant,
            block_id=%meta.id,
            traces=meta.trace_count,
            spans=meta.span_count,
            row_groups=footer.row_groups.len(),
            bytes=self.data.len(),
            "encoded block"
        );

        Ok(EncodedBlock {
            meta,
            data: self.data.into(),
            bloom: bloom.to_bytes().into(),
        })
    }
}

/// Build a block from an already collected, sorted row set.
pub fn encode_block(
    tenant: TenantId,
    id: BlockId,
    compaction_level: CompactionLevel,
    rows: Vec<TraceRow>,
    config: &BlockConfig,
) -> Result<EncodedBlock> {
    let mut writer = BlockWriter::new(tenant, id, compaction_level, config.clone());
    for row in rows {
        writer.push_row(row)?;
    }
    writer.finish()
}
