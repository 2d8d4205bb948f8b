//! Block build and flush: `CUT → LOCAL_COMPLETE → FLUSHED → GC'd`.
//!
//! A cutting set becomes a columnar block written to local disk first, then
//! uploaded. Only after a confirmed upload is the WAL retired, so a crash
//! anywhere in between replays into a duplicate block that compaction later
//! collapses. The local copy lingers for a while so queriers that resolved
//! this ingester keep getting fast reads; its removal is refcounted with a
//! hard TTL backstop.

use crate::{BuildSnafu, Ingester, LocalIoSnafu, Result, TenantData, UploadSnafu, WalSnafu};
use backoff::{Backoff, BackoffConfig};
use block_file::{BlockReader, BloomFilter, EncodedBlock, MemoryBlock};
use data_types::{BlockId, BlockMeta, TenantId, TraceId};
use largo_time::Time;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use snafu::ResultExt;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// A block produced by this process, readable locally until GC.
#[derive(Debug)]
pub struct LocalBlock {
    encoded: EncodedBlock,
    bloom: BloomFilter,
    dir: PathBuf,
    created_at: Time,
    flushed_at: Mutex<Option<Time>>,
    readers: AtomicUsize,
}

impl LocalBlock {
    /// The block's descriptor.
    pub fn meta(&self) -> &BlockMeta {
        &self.encoded.meta
    }

    /// Bloom-filter gate for point lookups.
    pub fn might_contain(&self, trace_id: &TraceId) -> bool {
        self.bloom.contains(trace_id)
    }

    /// True once the upload was confirmed.
    pub fn is_flushed(&self) -> bool {
        self.flushed_at.lock().is_some()
    }

    /// Take a read guard; GC will not remove the block while guards exist
    /// (unless the hard TTL fires).
    pub fn acquire(self: &Arc<Self>) -> LocalBlockReadGuard {
        self.readers.fetch_add(1, Ordering::SeqCst);
        LocalBlockReadGuard {
            block: Arc::clone(self),
        }
    }
}

/// RAII read guard over a [`LocalBlock`].
#[derive(Debug)]
pub struct LocalBlockReadGuard {
    block: Arc<LocalBlock>,
}

impl LocalBlockReadGuard {
    /// The block's descriptor.
    pub fn meta(&self) -> &BlockMeta {
        self.block.meta()
    }

    /// Open a columnar reader over the in-memory copy.
    pub async fn reader(&self) -> Result<BlockReader<MemoryBlock>, block_file::ReadError> {
        BlockReader::open(MemoryBlock(self.block.encoded.data.clone())).await
    }
}

impl Drop for LocalBlockReadGuard {
    fn drop(&mut self) {
        self.block.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Ingester {
    fn local_block_dir(&self, tenant: &TenantId, block_id: &BlockId) -> PathBuf {
        self.config
            .wal
            .root
            .join(tenant.as_str())
            .join("blocks")
            .join(block_id.to_string())
    }

    fn write_local(&self, encoded: &EncodedBlock) -> Result<PathBuf> {
        let dir = self.local_block_dir(&encoded.meta.tenant, &encoded.meta.id);
        std::fs::create_dir_all(&dir).context(LocalIoSnafu { path: dir.clone() })?;

        let write = |name: &str, bytes: &[u8]| -> Result<()> {
            let path = dir.join(name);
            std::fs::write(&path, bytes).context(LocalIoSnafu { path })
        };
        write(block_file::DATA_OBJECT, &encoded.data)?;
        write(block_file::BLOOM_OBJECT, &encoded.bloom)?;
        write(
            block_file::META_OBJECT,
            &serde_json::to_vec_pretty(&encoded.meta).expect("meta serializes"),
        )?;
        Ok(dir)
    }

    /// Build and upload blocks for every tenant whose cutting set crossed a
    /// flush threshold (all of them with `force`).
    pub async fn flush_ready(&self, force: bool) -> Result<()> {
        let mut first_error = None;
        for data in self.tenant_snapshot() {
            while let Some(pending) = self.take_cutting_set(&data, force) {
                if let Err(e) = self.flush_one(&data, pending).await {
                    self.flush_count.recorder(&[("outcome", "error")]).inc(1);
                    first_error.get_or_insert(e);
                    break; // retry this tenant on the next pass
                }
                self.flush_count.recorder(&[("outcome", "ok")]).inc(1);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush_one(&self, data: &TenantData, pending: crate::lifecycle::PendingFlush) -> Result<()> {
        let block_id = BlockId::new();
        let encoded = match block_file::encode_block(
            data.tenant.clone(),
            block_id,
            data_types::CompactionLevel::INITIAL,
            pending.traces.clone(),
            &self.config.block,
        )
        .context(BuildSnafu)
        {
            Ok(encoded) => encoded,
            Err(e) => {
                self.restore_cutting_set(data, pending);
                return Err(e);
            }
        };

        // LOCAL_COMPLETE: on disk and registered for queries
        let dir = match self.write_local(&encoded) {
            Ok(dir) => dir,
            Err(e) => {
                self.restore_cutting_set(data, pending);
                return Err(e);
            }
        };
        let bloom = BloomFilter::from_bytes(&encoded.bloom).expect("own bloom parses");
        let local = Arc::new(LocalBlock {
            encoded,
            bloom,
            dir,
            created_at: self.time_provider.now(),
            flushed_at: Mutex::new(None),
            readers: AtomicUsize::new(0),
        });
        data.local_blocks.lock().push(Arc::clone(&local));
        debug!(
            tenant=%data.tenant,
            %block_id,
            traces=local.meta().trace_count,
            "block complete on local disk"
        );

        // FLUSHED: upload with bounded retries
        let mut backoff = Backoff::new(&BackoffConfig::default());
        let upload = backoff
            .retry_with_limit("block upload", self.config.max_flush_retries, || {
                let store = self.block_store.clone();
                let block = Arc::clone(&local);
                async move { store.publish(&block.encoded).await }
            })
            .await
            .context(UploadSnafu);
        if let Err(e) = upload {
            // undo LOCAL_COMPLETE and put the spans back; nothing has been
            // retired so the WAL still covers them
            data.local_blocks.lock().retain(|b| b.meta().id != block_id);
            if let Err(io) = std::fs::remove_dir_all(&local.dir) {
                warn!(path=%local.dir.display(), error=%io, "failed to remove abandoned local block");
            }
            self.restore_cutting_set(data, pending);
            return Err(e);
        }
        *local.flushed_at.lock() = Some(self.time_provider.now());

        // upload is confirmed, the WAL records below the watermark are done
        data.wal.roll();
        data.wal.retire(pending.watermark).context(WalSnafu)?;

        self.buffered_bytes
            .fetch_sub(pending.bytes.min(self.buffered_bytes()), Ordering::Relaxed);
        info!(
            tenant=%data.tenant,
            %block_id,
            watermark=pending.watermark.get(),
            bytes=pending.bytes,
            "flushed block and retired wal"
        );
        Ok(())
    }

    /// Remove flushed local blocks past their linger period. Blocks with
    /// active readers are kept until the hard TTL.
    pub fn gc_local_blocks(&self) {
        let now = self.time_provider.now();
        for data in self.tenant_snapshot() {
            let mut removed = vec![];
            data.local_blocks.lock().retain(|block| {
                let Some(flushed_at) = *block.flushed_at.lock() else {
                    return true; // still uploading
                };
                let lingered = now
                    .checked_duration_since(flushed_at)
                    .map(|age| age > self.config.linger_period)
                    .unwrap_or(false);
                let expired = now
                    .checked_duration_since(block.created_at)
                    .map(|age| age > self.config.linger_hard_ttl)
                    .unwrap_or(false);
                let busy = block.readers.load(Ordering::SeqCst) > 0;

                if (lingered && !busy) || expired {
                    removed.push(Arc::clone(block));
                    false
                } else {
                    true
                }
            });

            for block in removed {
                debug!(tenant=%data.tenant, block_id=%block.meta().id, "gc of local block");
                if let Err(e) = std::fs::remove_dir_all(&block.dir) {
                    warn!(
                        path=%block.dir.display(),
                        error=%e,
                        "failed to remove local block dir"
                    );
                }
            }
        }
    }

    /// Snapshot the tenant's local blocks for the query path.
    pub(crate) fn local_blocks(&self, tenant: &TenantId) -> Vec<Arc<LocalBlock>> {
        self.tenants_local(tenant)
    }

    fn tenants_local(&self, tenant: &TenantId) -> Vec<Arc<LocalBlock>> {
        match self.tenant(tenant) {
            Ok(data) => data.local_blocks.lock().iter().map(Arc::clone).collect(),
            Err(_) => vec![],
        }
    }
}
