//! The footer index at the tail of a block's `data` object.
//!
//! Layout of the data object:
//!
//! ```text
//! [column blocks, row group by row group]
//! [zstd-compressed JSON footer]
//! [u32 footer_len][u64 footer_checksum][u32 format_version][8-byte magic]
//! ```
//!
//! Readers fetch the fixed-size trailer first, then the footer, then only
//! the column byte ranges a query needs.

use data_types::{DedicatedColumnSpec, TimeRange, TraceId};
use siphasher::sip::SipHasher24;
use snafu::{ensure, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::hash::Hasher;

/// Magic trailer bytes identifying a block data object.
pub const MAGIC: [u8; 8] = *b"LRGOBLK1";

/// Size of the fixed trailer.
pub const TRAILER_BYTES: usize = 4 + 8 + 4 + 8;

/// Byte range of one encoded column within the data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ColumnChunk {
    /// Offset from the start of the data object.
    pub offset: u64,
    /// Encoded length.
    pub len: u64,
}

/// Footer entry for one row group.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RowGroupMeta {
    /// Smallest trace id in the group.
    pub min_trace_id: TraceId,
    /// Largest trace id in the group.
    pub max_trace_id: TraceId,
    /// Span time coverage.
    pub time_range: TimeRange,
    /// Number of traces.
    pub trace_count: u64,
    /// Number of spans.
    pub span_count: u64,
    /// Byte range per column name.
    pub columns: BTreeMap<String, ColumnChunk>,
    /// `(min, max)` per dedicated int column, over rows where the attribute
    /// is present. Absent key with the column configured means no row in
    /// this group carries the attribute.
    pub dedicated_int_stats: BTreeMap<String, (i64, i64)>,
}

impl RowGroupMeta {
    /// True if `trace_id` falls in this group's range.
    pub fn covers_trace_id(&self, trace_id: &TraceId) -> bool {
        (self.min_trace_id..=self.max_trace_id).contains(trace_id)
    }
}

/// The deserialized footer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Footer {
    /// Row groups in trace-id order; their ranges do not overlap.
    pub row_groups: Vec<RowGroupMeta>,
    /// Dedicated columns materialized in every row group.
    pub dedicated: Vec<DedicatedColumnSpec>,
}

/// Footer (de)serialization failures. All of them quarantine the block.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("data object too small for trailer"))]
    TooSmall,

    #[snafu(display("bad magic bytes in block trailer"))]
    BadMagic,

    #[snafu(display("unsupported block format version {version}"))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("footer checksum mismatch"))]
    ChecksumMismatch,

    #[snafu(display("footer length {len} exceeds object size {object_size}"))]
    BadFooterLength { len: u64, object_size: u64 },

    #[snafu(display("footer compression failed: {source}"))]
    Compress { source: std::io::Error },

    #[snafu(display("footer decompression failed: {source}"))]
    Decompress { source: std::io::Error },

    #[snafu(display("footer JSON error: {source}"))]
    Json { source: serde_json::Error },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(0x666f_6f74, 0x6572_6b73);
    hasher.write(bytes);
    hasher.finish()
}

/// Serialize the footer and trailer, to be appended after the column blocks.
pub fn encode_footer(footer: &Footer) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(footer).context(JsonSnafu)?;
    let compressed = zstd::bulk::compress(&json, 3).context(CompressSnafu)?;

    let mut out = compressed;
    let footer_len = out.len() as u32;
    let footer_checksum = checksum(&out[..]);
    out.extend_from_slice(&footer_len.to_le_bytes());
    out.extend_from_slice(&footer_checksum.to_le_bytes());
    out.extend_from_slice(&data_types::FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&MAGIC);
    Ok(out)
}

/// Parse the fixed trailer; returns `(footer_len, footer_checksum)`.
pub fn decode_trailer(trailer: &[u8], object_size: u64) -> Result<(u64, u64)> {
    ensure!(trailer.len() == TRAILER_BYTES, TooSmallSnafu);
    let footer_len = u32::from_le_bytes(trailer[0..4].try_into().expect("4 bytes")) as u64;
    let footer_checksum = u64::from_le_bytes(trailer[4..12].try_into().expect("8 bytes"));
    let version = u32::from_le_bytes(trailer[12..16].try_into().expect("4 bytes"));
    let magic: [u8; 8] = trailer[16..24].try_into().expect("8 bytes");

    ensure!(magic == MAGIC, BadMagicSnafu);
    ensure!(
        version == data_types::FORMAT_VERSION,
        UnsupportedVersionSnafu { version }
    );
    ensure!(
        footer_len + TRAILER_BYTES as u64 <= object_size,
        BadFooterLengthSnafu {
            len: footer_len,
            object_size
        }
    );
    Ok((footer_len, footer_checksum))
}

/// Verify and parse the compressed footer bytes.
pub fn decode_footer(compressed: &[u8], expected_checksum: u64) -> Result<Footer> {
    ensure!(checksum(compressed) == expected_checksum, ChecksumMismatchSnafu);
    let json = zstd::stream::decode_all(compressed).context(DecompressSnafu)?;
    serde_json::from_slice(&json).context(JsonSnafu)
}
