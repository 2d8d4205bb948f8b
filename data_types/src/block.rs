//! Block identity and metadata as carried by `meta.json` and the per-tenant
//! block list.

use crate::{TenantId, TimeRange, TraceId};
use uuid::Uuid;

/// Current block format version. Bumped on incompatible layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// Identifies an immutable block within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BlockId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The merge generation of a block. Zero means freshly flushed by an
/// ingester; each compaction produces `max(inputs) + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CompactionLevel(u32);

#[allow(missing_docs)]
impl CompactionLevel {
    pub const INITIAL: Self = Self(0);

    pub fn new(level: u32) -> Self {
        Self(level)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// A dedicated column's value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedicatedColumnKind {
    /// UTF-8 string values.
    Str,
    /// 64-bit signed integers.
    Int,
}

/// A pre-allocated typed column for one attribute key, chosen at block build
/// time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DedicatedColumnSpec {
    /// Attribute key the column holds, e.g. `http.status_code`.
    pub key: String,
    /// Value type of the column.
    pub kind: DedicatedColumnKind,
}

impl DedicatedColumnSpec {
    /// A string column for `key`.
    pub fn str(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: DedicatedColumnKind::Str,
        }
    }

    /// An integer column for `key`.
    pub fn int(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: DedicatedColumnKind::Int,
        }
    }
}

/// Metadata describing one immutable block; the contents of `meta.json`.
///
/// Once published the block's bytes never change; supersession happens by
/// compaction writing a new block and tombstoning the inputs.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockMeta {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Block identity.
    pub id: BlockId,
    /// Format version the data object was written with.
    pub format_version: u32,
    /// Smallest trace id in the block.
    pub min_trace_id: TraceId,
    /// Largest trace id in the block.
    pub max_trace_id: TraceId,
    /// Covered span start/end times.
    pub time_range: TimeRange,
    /// Number of traces (rows).
    pub trace_count: u64,
    /// Number of spans across all traces.
    pub span_count: u64,
    /// Size of the `data` object in bytes.
    pub size_bytes: u64,
    /// Merge generation.
    pub compaction_level: CompactionLevel,
    /// Dedicated columns materialized in this block.
    pub dedicated_columns: Vec<DedicatedColumnSpec>,
}

impl BlockMeta {
    /// True if `trace_id` falls within this block's id range.
    pub fn covers_trace_id(&self, trace_id: &TraceId) -> bool {
        (self.min_trace_id..=self.max_trace_id).contains(trace_id)
    }
}

/// Marks a superseded block. Written by the compaction leader; the block is
/// excluded from new queries immediately but its bytes are deleted only
/// after a grace period, protecting queriers that already hold it open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockTombstone {
    /// The superseded block.
    pub block_id: BlockId,
    /// When the tombstone was written, unix nanoseconds.
    pub deleted_at_unix_nanos: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> BlockMeta {
        BlockMeta {
            tenant: TenantId::new("t1").unwrap(),
            id: BlockId::new(),
            format_version: FORMAT_VERSION,
            min_trace_id: TraceId::new([0x10; 16]),
            max_trace_id: TraceId::new([0x20; 16]),
            time_range: TimeRange::new(1_000, 2_000),
            trace_count: 3,
            span_count: 9,
            size_bytes: 4096,
            compaction_level: CompactionLevel::INITIAL,
            dedicated_columns: vec![DedicatedColumnSpec::int("http.status_code")],
        }
    }

    #[test]
    fn meta_json_round_trip() {
        let meta = meta();
        let json = serde_json::to_string(&meta).unwrap();
        let back: BlockMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn covers_trace_id_is_inclusive() {
        let meta = meta();
        assert!(meta.covers_trace_id(&TraceId::new([0x10; 16])));
        assert!(meta.covers_trace_id(&TraceId::new([0x20; 16])));
        assert!(meta.covers_trace_id(&TraceId::new([0x15; 16])));
        assert!(!meta.covers_trace_id(&TraceId::new([0x21; 16])));
    }

    #[test]
    fn compaction_level_next() {
        assert_eq!(CompactionLevel::INITIAL.next(), CompactionLevel::new(1));
    }
}
