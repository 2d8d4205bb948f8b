//! Merge execution, retention, and garbage collection.

use crate::{plan::CompactionJob, Compactor};
use block_file::{BlockReader, BlockWriter, ObjectStoreBlock};
use data_types::{BlockId, BlockMeta, BlockTombstone, TenantId, TraceRow};
use observability_deps::tracing::{debug, info, warn};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

/// Errors raised by merge execution and GC passes.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("input block {block_id} read failed: {source}"))]
    ReadInput {
        block_id: BlockId,
        source: block_file::ReadError,
    },

    #[snafu(display("output block build failed: {source}"))]
    BuildOutput { source: block_file::WriteError },

    #[snafu(display("block store error: {source}"))]
    Store { source: block_file::StoreError },

    #[snafu(display("catalog error: {source}"))]
    Catalog { source: largo_catalog::Error },

    #[snafu(display("compaction job cancelled"))]
    Cancelled,
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Streams one input block's traces, pulling a row group at a time so a
/// K-way merge holds O(K × row-group) memory.
struct BlockCursor {
    block_id: BlockId,
    reader: BlockReader<ObjectStoreBlock>,
    next_group: usize,
    rows: std::collections::VecDeque<TraceRow>,
}

impl BlockCursor {
    async fn open(compactor: &Compactor, tenant: &TenantId, meta: &BlockMeta) -> Result<Self> {
        let reader = compactor
            .catalog
            .block_store()
            .reader(tenant, &meta.id)
            .await
            .context(ReadInputSnafu { block_id: meta.id })?;
        Ok(Self {
            block_id: meta.id,
            reader,
            next_group: 0,
            rows: Default::default(),
        })
    }

    /// The next row's trace id without consuming it.
    async fn peek_id(&mut self) -> Result<Option<data_types::TraceId>> {
        self.fill().await?;
        Ok(self.rows.front().map(|r| r.trace_id))
    }

    async fn next_row(&mut self) -> Result<Option<TraceRow>> {
        self.fill().await?;
        Ok(self.rows.pop_front())
    }

    async fn fill(&mut self) -> Result<()> {
        while self.rows.is_empty() && self.next_group < self.reader.row_group_count() {
            let rows = self
                .reader
                .read_row_group(self.next_group)
                .await
                .context(ReadInputSnafu {
                    block_id: self.block_id,
                })?;
            self.next_group += 1;
            self.rows.extend(rows);
        }
        Ok(())
    }
}

impl Compactor {
    /// Merge one job's inputs into a single output block of the next
    /// compaction level, publish it, and tombstone the inputs.
    ///
    /// Cancellation is observed between merge iterations; an interrupted
    /// job leaves at most orphaned partial uploads behind, which the orphan
    /// sweeper collects.
    pub async fn execute(
        &self,
        job: &CompactionJob,
        cancel: &CancellationToken,
    ) -> Result<BlockMeta> {
        let tenant = &job.tenant;
        let output_level = job
            .inputs
            .iter()
            .map(|m| m.compaction_level)
            .max()
            .expect("job has inputs")
            .next();

        let mut cursors = Vec::with_capacity(job.inputs.len());
        for meta in &job.inputs {
            cursors.push(BlockCursor::open(self, tenant, meta).await?);
        }

        let mut writer = BlockWriter::new(
            tenant.clone(),
            BlockId::new(),
            output_level,
            self.config.block.clone(),
        );

        // k-way sort-merge on trace id; all rows of one id are merged and
        // deduplicated before they reach the writer
        loop {
            if cancel.is_cancelled() {
                return CancelledSnafu.fail();
            }

            let mut min_id = None;
            for cursor in &mut cursors {
                if let Some(id) = cursor.peek_id().await? {
                    min_id = Some(match min_id {
                        Some(current) if current <= id => current,
                        _ => id,
                    });
                }
            }
            let Some(min_id) = min_id else { break };

            let mut merged: Option<TraceRow> = None;
            for cursor in &mut cursors {
                while cursor.peek_id().await? == Some(min_id) {
                    let row = cursor.next_row().await?.expect("peeked row exists");
                    match &mut merged {
                        Some(existing) => existing.merge(row),
                        None => merged = Some(row),
                    }
                }
            }
            writer
                .push_row(merged.expect("min id came from a cursor"))
                .context(BuildOutputSnafu)?;
        }

        let output = writer.finish().context(BuildOutputSnafu)?;
        let output_meta = output.meta.clone();
        self.catalog
            .block_store()
            .publish(&output)
            .await
            .context(StoreSnafu)?;

        // inputs are superseded only after the output is fully published
        let deleted_at = self.time_provider.now().timestamp_nanos();
        for meta in &job.inputs {
            self.catalog
                .block_store()
                .write_tombstone(
                    tenant,
                    &BlockTombstone {
                        block_id: meta.id,
                        deleted_at_unix_nanos: deleted_at,
                    },
                )
                .await
                .context(StoreSnafu)?;
        }
        self.catalog
            .refresh_tenant(tenant)
            .await
            .context(CatalogSnafu)?;

        self.job_count.recorder(&[("outcome", "ok")]).inc(1);
        info!(
            tenant=%tenant,
            output=%output_meta.id,
            inputs=job.inputs.len(),
            level=output_meta.compaction_level.get(),
            spans=output_meta.span_count,
            "compacted blocks"
        );
        Ok(output_meta)
    }

    /// Tombstone blocks older than the tenant's retention.
    pub async fn apply_retention(&self) -> Result<()> {
        let now = self.time_provider.now().timestamp_nanos();
        for tenant in self.catalog.tenants() {
            let Some(retention) = self.retention_for(&tenant) else {
                continue;
            };
            let horizon = now - retention.as_nanos() as i64;

            for entry in self.catalog.all_entries(&tenant) {
                if entry.tombstone.is_some() || entry.meta.time_range.max >= horizon {
                    continue;
                }
                info!(
                    tenant=%tenant,
                    block_id=%entry.meta.id,
                    max_end=entry.meta.time_range.max,
                    "block beyond retention, tombstoning"
                );
                self.catalog
                    .block_store()
                    .write_tombstone(
                        &tenant,
                        &BlockTombstone {
                            block_id: entry.meta.id,
                            deleted_at_unix_nanos: now,
                        },
                    )
                    .await
                    .context(StoreSnafu)?;
                self.retention_count
                    .recorder([("tenant", tenant.to_string())])
                    .inc(1);
            }
            self.catalog
                .refresh_tenant(&tenant)
                .await
                .context(CatalogSnafu)?;
        }
        Ok(())
    }

    /// Physically delete tombstoned blocks whose grace period has passed.
    pub async fn delete_expired(&self) -> Result<()> {
        let now = self.time_provider.now().timestamp_nanos();
        let grace = self.config.grace_period.as_nanos() as i64;

        for tenant in self.catalog.tenants() {
            for entry in self.catalog.all_entries(&tenant) {
                let Some(tombstone) = entry.tombstone else {
                    continue;
                };
                if now - tombstone.deleted_at_unix_nanos < grace {
                    continue;
                }
                self.catalog
                    .block_store()
                    .delete(&tenant, &entry.meta.id)
                    .await
                    .context(StoreSnafu)?;
                self.catalog.forget(&tenant, &entry.meta.id);
            }
        }
        Ok(())
    }

    /// Delete objects in unpublished block directories older than the
    /// orphan age: leftovers of crashed or cancelled uploads.
    pub async fn sweep_orphans(&self) -> Result<()> {
        let store = self.catalog.block_store();
        let horizon = self
            .time_provider
            .now()
            .checked_sub(self.config.orphan_age);
        let Some(horizon) = horizon else {
            return Ok(());
        };

        for tenant in store.list_tenants().await.context(StoreSnafu)? {
            for block_id in store.list_block_ids(&tenant).await.context(StoreSnafu)? {
                match store.fetch_meta(&tenant, &block_id).await {
                    Ok(_) => continue, // published
                    Err(e) if e.is_not_found() => {}
                    Err(source) => return Err(Error::Store { source }),
                }

                let objects = store
                    .list_block_objects(&tenant, &block_id)
                    .await
                    .context(StoreSnafu)?;
                let all_old = !objects.is_empty()
                    && objects.iter().all(|o| {
                        o.last_modified.timestamp_nanos() < horizon.timestamp_nanos()
                    });
                if !all_old {
                    debug!(tenant=%tenant, %block_id, "unpublished block too fresh to sweep");
                    continue;
                }

                warn!(tenant=%tenant, %block_id, objects=objects.len(), "sweeping orphaned block objects");
                store.delete(&tenant, &block_id).await.context(StoreSnafu)?;
                self.orphan_count
                    .recorder([("tenant", tenant.to_string())])
                    .inc(1);
            }
        }
        Ok(())
    }
}
