//! Block layout on the object store and the publish/delete protocol.
//!
//! Object keys follow `{tenant}/{block_id}/` with sub-objects `data`
//! (columns + footer), `bloom_0`, `meta.json`, and an optional
//! `tombstone.json`. `meta.json` is written last: its presence is what makes
//! a block visible, so a crashed upload leaves only unreferenced bytes for
//! the orphan sweeper. Deletion removes `meta.json` first for the same
//! reason.

use crate::{
    bloom::BloomFilter,
    read::{BlockReader, ObjectStoreBlock},
    write::EncodedBlock,
};
use data_types::{BlockId, BlockMeta, BlockTombstone, TenantId};
use object_store::{path::Path, DynObjectStore};
use observability_deps::tracing::info;
use snafu::{OptionExt, ResultExt, Snafu};
use std::sync::Arc;

/// Name of the column-data object within a block directory.
pub const DATA_OBJECT: &str = "data";
/// Name of the trace-id bloom filter object.
pub const BLOOM_OBJECT: &str = "bloom_0";
/// Name of the metadata object; written last, acts as the publish marker.
pub const META_OBJECT: &str = "meta.json";
/// Name of the tombstone object marking a superseded block.
pub const TOMBSTONE_OBJECT: &str = "tombstone.json";

/// Errors raised by block store operations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("object store error for {path}: {source}"))]
    ObjectStore {
        path: String,
        source: object_store::Error,
    },

    #[snafu(display("{path} is not valid JSON: {source}"))]
    BadJson {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("bloom filter for block {block_id} is corrupt"))]
    BadBloom { block_id: BlockId },
}

impl Error {
    /// True if the underlying object simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ObjectStore {
                source: object_store::Error::NotFound { .. },
                ..
            }
        )
    }
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The directory of one block.
pub fn block_dir(tenant: &TenantId, block_id: &BlockId) -> Path {
    Path::from(format!("{tenant}/{block_id}"))
}

/// Path of one of the block's sub-objects.
pub fn block_object(tenant: &TenantId, block_id: &BlockId, name: &str) -> Path {
    Path::from(format!("{tenant}/{block_id}/{name}"))
}

/// Tenant-scoped block IO on top of the shared object store.
#[derive(Debug, Clone)]
pub struct BlockStore {
    store: Arc<DynObjectStore>,
}

impl BlockStore {
    /// Wrap an object store.
    pub fn new(store: Arc<DynObjectStore>) -> Self {
        Self { store }
    }

    /// The underlying object store.
    pub fn object_store(&self) -> Arc<DynObjectStore> {
        Arc::clone(&self.store)
    }

    /// Upload a block: data, bloom, then `meta.json` as the publish point.
    pub async fn publish(&self, block: &EncodedBlock) -> Result<()> {
        let tenant = &block.meta.tenant;
        let id = &block.meta.id;

        let data_path = block_object(tenant, id, DATA_OBJECT);
        self.store
            .put(&data_path, block.data.clone())
            .await
            .context(ObjectStoreSnafu {
                path: data_path.to_string(),
            })?;

        let bloom_path = block_object(tenant, id, BLOOM_OBJECT);
        self.store
            .put(&bloom_path, block.bloom.clone())
            .await
            .context(ObjectStoreSnafu {
                path: bloom_path.to_string(),
            })?;

        let meta_path = block_object(tenant, id, META_OBJECT);
        let meta_json = serde_json::to_vec_pretty(&block.meta).expect("meta serializes");
        self.store
            .put(&meta_path, meta_json.into())
            .await
            .context(ObjectStoreSnafu {
                path: meta_path.to_string(),
            })?;

        info!(
            tenant=%tenant,
            block_id=%id,
            size_bytes=block.meta.size_bytes,
            compaction_level=block.meta.compaction_level.get(),
            "published block"
        );
        Ok(())
    }

    /// Fetch and parse `meta.json`.
    pub async fn fetch_meta(&self, tenant: &TenantId, block_id: &BlockId) -> Result<BlockMeta> {
        let path = block_object(tenant, block_id, META_OBJECT);
        let bytes = self
            .store
            .get(&path)
            .await
            .context(ObjectStoreSnafu {
                path: path.to_string(),
            })?
            .bytes()
            .await
            .context(ObjectStoreSnafu {
                path: path.to_string(),
            })?;
        serde_json::from_slice(&bytes).context(BadJsonSnafu {
            path: path.to_string(),
        })
    }

    /// Fetch and parse the trace-id bloom filter.
    pub async fn fetch_bloom(
        &self,
        tenant: &TenantId,
        block_id: &BlockId,
    ) -> Result<BloomFilter> {
        let path = block_object(tenant, block_id, BLOOM_OBJECT);
        let bytes = self
            .store
            .get(&path)
            .await
            .context(ObjectStoreSnafu {
                path: path.to_string(),
            })?
            .bytes()
            .await
            .context(ObjectStoreSnafu {
                path: path.to_string(),
            })?;
        BloomFilter::from_bytes(&bytes).context(BadBloomSnafu {
            block_id: *block_id,
        })
    }

    /// Open a reader over the block's data object.
    pub async fn reader(
        &self,
        tenant: &TenantId,
        block_id: &BlockId,
    ) -> std::result::Result<BlockReader<ObjectStoreBlock>, crate::read::Error> {
        let path = block_object(tenant, block_id, DATA_OBJECT);
        BlockReader::open(ObjectStoreBlock::new(Arc::clone(&self.store), path)).await
    }

    /// Write the tombstone marking this block superseded.
    pub async fn write_tombstone(
        &self,
        tenant: &TenantId,
        tombstone: &BlockTombstone,
    ) -> Result<()> {
        let path = block_object(tenant, &tombstone.block_id, TOMBSTONE_OBJECT);
        let json = serde_json::to_vec(tombstone).expect("tombstone serializes");
        self.store
            .put(&path, json.into())
            .await
            .context(ObjectStoreSnafu {
                path: path.to_string(),
            })
    }

    /// Fetch the block's tombstone, if present.
    pub async fn fetch_tombstone(
        &self,
        tenant: &TenantId,
        block_id: &BlockId,
    ) -> Result<Option<BlockTombstone>> {
        let path = block_object(tenant, block_id, TOMBSTONE_OBJECT);
        let result = self.store.get(&path).await;
        let bytes = match result {
            Ok(get) => get.bytes().await.context(ObjectStoreSnafu {
                path: path.to_string(),
            })?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(source) => {
                return Err(Error::ObjectStore {
                    path: path.to_string(),
                    source,
                })
            }
        };
        Ok(Some(serde_json::from_slice(&bytes).context(
            BadJsonSnafu {
                path: path.to_string(),
            },
        )?))
    }

    /// Physically delete a block. `meta.json` goes first so the block
    /// disappears from listings before its bytes do.
    pub async fn delete(&self, tenant: &TenantId, block_id: &BlockId) -> Result<()> {
        for name in [META_OBJECT, TOMBSTONE_OBJECT, BLOOM_OBJECT, DATA_OBJECT] {
            let path = block_object(tenant, block_id, name);
            match self.store.delete(&path).await {
                Ok(()) => {}
                // tolerate partially deleted blocks from earlier attempts
                Err(object_store::Error::NotFound { .. }) => {}
                Err(source) => {
                    return Err(Error::ObjectStore {
                        path: path.to_string(),
                        source,
                    })
                }
            }
        }
        info!(tenant=%tenant, block_id=%block_id, "deleted block objects");
        Ok(())
    }

    /// Block directories under a tenant, published or not.
    pub async fn list_block_ids(&self, tenant: &TenantId) -> Result<Vec<BlockId>> {
        let prefix = Path::from(tenant.as_str());
        let listing = self
            .store
            .list_with_delimiter(Some(&prefix))
            .await
            .context(ObjectStoreSnafu {
                path: prefix.to_string(),
            })?;

        let mut ids = vec![];
        for common_prefix in listing.common_prefixes {
            let Some(last) = common_prefix.parts().last() else {
                continue;
            };
            if let Ok(id) = last.as_ref().parse::<BlockId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Tenants that have at least one block directory.
    pub async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        let listing = self
            .store
            .list_with_delimiter(None)
            .await
            .context(ObjectStoreSnafu {
                path: String::new(),
            })?;

        let mut tenants = vec![];
        for common_prefix in listing.common_prefixes {
            let Some(last) = common_prefix.parts().last() else {
                continue;
            };
            if let Ok(tenant) = TenantId::new(last.as_ref().to_string()) {
                tenants.push(tenant);
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    /// All objects under one block directory, with their store metadata.
    /// Used by the orphan sweeper.
    pub async fn list_block_objects(
        &self,
        tenant: &TenantId,
        block_id: &BlockId,
    ) -> Result<Vec<object_store::ObjectMeta>> {
        use futures::TryStreamExt;

        let prefix = block_dir(tenant, block_id);
        let stream = self
            .store
            .list(Some(&prefix))
            .await
            .context(ObjectStoreSnafu {
                path: prefix.to_string(),
            })?;
        stream.try_collect().await.context(ObjectStoreSnafu {
            path: prefix.to_string(),
        })
    }
}
