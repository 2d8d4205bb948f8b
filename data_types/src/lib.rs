//! Shared data types for the largo tracing backend: identifiers, spans,
//! batches, and block metadata.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;
use std::{fmt::Write as _, str::FromStr, sync::Arc};

mod block;
mod span;
mod trace;

pub use block::*;
pub use span::*;
pub use trace::*;

/// Errors raised when parsing or validating identifiers.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum IdError {
    #[snafu(display("invalid id length {got}, expected {expected} hex chars"))]
    InvalidLength { got: usize, expected: usize },

    #[snafu(display("invalid hex digit {c:?} in id"))]
    InvalidDigit { c: char },

    #[snafu(display("the all-zero id is not a valid identifier"))]
    Zero,

    #[snafu(display("tenant ids must be non-empty and [A-Za-z0-9_-], got {name:?}"))]
    InvalidTenant { name: String },
}

fn decode_hex(s: &str, out: &mut [u8]) -> Result<(), IdError> {
    if s.len() != out.len() * 2 {
        return Err(IdError::InvalidLength {
            got: s.len(),
            expected: out.len() * 2,
        });
    }
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char)
            .to_digit(16)
            .ok_or(IdError::InvalidDigit {
                c: chunk[0] as char,
            })?;
        let lo = (chunk[1] as char)
            .to_digit(16)
            .ok_or(IdError::InvalidDigit {
                c: chunk[1] as char,
            })?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Ok(())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(&mut s, "{:02x}", b).expect("writing to string cannot fail");
    }
    s
}

macro_rules! hex_id {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Construct from raw bytes.
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// The raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// True unless every byte is zero.
            pub fn is_valid(&self) -> bool {
                self.0.iter().any(|b| *b != 0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&encode_hex(&self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; $len];
                decode_hex(s, &mut bytes)?;
                let id = Self(bytes);
                if !id.is_valid() {
                    return Err(IdError::Zero);
                }
                Ok(id)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(TraceId, 16, "A 16-byte trace identifier, displayed as 32 lowercase hex chars.");
hex_id!(SpanId, 8, "An 8-byte span identifier, displayed as 16 lowercase hex chars.");

impl TraceId {
    /// The most significant 8 bytes, used for hash-space sharding.
    pub fn high_bits(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().expect("slice has length 8"))
    }
}

/// Names the tenant owning a piece of data. Non-empty, restricted to
/// characters that are safe inside object store keys and file paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct TenantId(Arc<str>);

impl TenantId {
    /// Validate and construct a tenant id.
    pub fn new(name: impl Into<Arc<str>>) -> Result<Self, IdError> {
        let name = name.into();
        let ok = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !ok {
            return Err(IdError::InvalidTenant {
                name: name.to_string(),
            });
        }
        Ok(Self(name))
    }

    /// The tenant name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for TenantId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// A monotonic per-tenant sequence number assigned at WAL append time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(i64);

#[allow(missing_docs)]
impl SequenceNumber {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// Stable machine-readable failure classes surfaced to callers.
///
/// These map onto the HTTP status classes at the edge; internally they drive
/// retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed input, over-limit tenant, unknown tenant. Not retriable.
    Validation,
    /// Fewer than quorum replicas acknowledged. Retriable by the caller.
    Quorum,
    /// Transient I/O failure after exhausting internal retries.
    Transient,
    /// Checksum mismatch or truncated record; affected data quarantined.
    Integrity,
    /// Memory or disk pressure; caller should back off.
    Capacity,
}

impl ErrorCode {
    /// Stable string form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Quorum => "quorum",
            Self::Transient => "transient",
            Self::Integrity => "integrity",
            Self::Capacity => "capacity",
        }
    }
}

/// A closed nanosecond time range. `min > max` denotes the empty range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TimeRange {
    /// Inclusive lower bound, unix nanoseconds.
    pub min: i64,
    /// Inclusive upper bound, unix nanoseconds.
    pub max: i64,
}

impl TimeRange {
    /// The empty range; absorbs any union.
    pub const EMPTY: Self = Self {
        min: i64::MAX,
        max: i64::MIN,
    };

    /// Construct a range.
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    /// True if no instant lies within the range.
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// True if the ranges share at least one instant.
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.min <= other.max && other.min <= self.max
    }

    /// Extend to cover `instant`.
    pub fn observe(&mut self, instant: i64) {
        self.min = self.min.min(instant);
        self.max = self.max.max(instant);
    }

    /// The union of both ranges.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_hex_round_trip() {
        let id: TraceId = "0123456789abcdef0123456789abcdef".parse().unwrap();
        assert_eq!(id.to_string(), "0123456789abcdef0123456789abcdef");
        assert_eq!(id.as_bytes()[0], 0x01);
        assert_eq!(id.as_bytes()[15], 0xef);
    }

    #[test]
    fn trace_id_rejects_garbage() {
        assert_eq!(
            "00".parse::<TraceId>(),
            Err(IdError::InvalidLength {
                got: 2,
                expected: 32
            })
        );
        assert!(matches!(
            "zz23456789abcdef0123456789abcdef".parse::<TraceId>(),
            Err(IdError::InvalidDigit { .. })
        ));
        assert_eq!(
            "00000000000000000000000000000000".parse::<TraceId>(),
            Err(IdError::Zero)
        );
    }

    #[test]
    fn span_id_parses() {
        let id: SpanId = "00000000000000a1".parse().unwrap();
        assert_eq!(id.to_string(), "00000000000000a1");
    }

    #[test]
    fn tenant_id_validation() {
        assert!(TenantId::new("team-a_1").is_ok());
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("a/b").is_err());
        assert!(TenantId::new("a b").is_err());
    }

    #[test]
    fn trace_id_ordering_matches_byte_order() {
        let a: TraceId = "00000000000000000000000000000001".parse().unwrap();
        let b: TraceId = "00000000000000000000000000000002".parse().unwrap();
        let c: TraceId = "10000000000000000000000000000000".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn time_range_overlap() {
        let a = TimeRange::new(0, 10);
        let b = TimeRange::new(10, 20);
        let c = TimeRange::new(11, 20);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!TimeRange::EMPTY.overlaps(&a));

        let mut r = TimeRange::EMPTY;
        r.observe(5);
        r.observe(2);
        assert_eq!(r, TimeRange::new(2, 5));
    }
}
