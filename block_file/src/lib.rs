//! The immutable columnar block format.
//!
//! A block is a tenant-scoped, trace-id-sorted set of complete traces on a
//! single `data` object, organized as row groups of dictionary-encoded,
//! individually compressed columns, with a footer index, a bloom filter over
//! trace ids, and a `meta.json` descriptor. The `footer`, `row_group`, and
//! `store` module docs describe the layout details.
//!
//! Supported reads:
//!
//! * O(1) bloom test for "does this block contain trace X"
//! * point lookup decoding only the bracketing row group
//! * predicate scans that evaluate hoisted and dedicated columns before
//!   touching the generic attribute columns
//! * whole-row-group streaming for compaction merges
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod bloom;
mod column;
mod footer;
mod read;
mod row_group;
mod store;
mod write;

pub use bloom::BloomFilter;
pub use footer::{ColumnChunk, Footer, RowGroupMeta};
pub use read::{
    BlockFetch, BlockReader, Error as ReadError, MemoryBlock, ObjectStoreBlock, SearchResult,
};
pub use store::{
    block_dir, block_object, BlockStore, Error as StoreError, BLOOM_OBJECT, DATA_OBJECT,
    META_OBJECT, TOMBSTONE_OBJECT,
};
pub use write::{encode_block, BlockConfig, BlockWriter, EncodedBlock, Error as WriteError};
