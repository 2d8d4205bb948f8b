//! Spans, attributes, and batches as received from instrumented applications.

use crate::{SpanId, TraceId};
use bytes::Bytes;
use siphasher::sip::SipHasher24;
use std::{hash::Hasher, sync::Arc};

/// The role a span plays in a request tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    /// Wire tag of the kind.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Internal => 0,
            Self::Server => 1,
            Self::Client => 2,
            Self::Producer => 3,
            Self::Consumer => 4,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8); unknown tags fall back to internal.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Server,
            2 => Self::Client,
            3 => Self::Producer,
            4 => Self::Consumer,
            _ => Self::Internal,
        }
    }
}

/// Span outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    /// Wire tag of the code.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Unset => 0,
            Self::Ok => 1,
            Self::Error => 2,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8); unknown tags fall back to unset.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ok,
            2 => Self::Error,
            _ => Self::Unset,
        }
    }
}

/// Span status: a code plus an optional human message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpanStatus {
    /// Outcome code.
    pub code: StatusCode,
    /// Optional message, typically only set for errors.
    pub message: Arc<str>,
}

/// A typed attribute value.
///
/// Values the wire protocol cannot represent natively arrive as the
/// [`Json`](Self::Json) fallback, carrying their JSON encoding.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum AttributeValue {
    Str(Arc<str>),
    Int(i64),
    Double(f64),
    Bool(bool),
    Bytes(Bytes),
    Json(Arc<str>),
}

impl AttributeValue {
    /// Tag identifying the variant; stable, used in block columns and
    /// hashing.
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Str(_) => 0,
            Self::Int(_) => 1,
            Self::Double(_) => 2,
            Self::Bool(_) => 3,
            Self::Bytes(_) => 4,
            Self::Json(_) => 5,
        }
    }

    /// Approximate heap footprint of the value.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Str(s) | Self::Json(s) => s.len(),
            Self::Bytes(b) => b.len(),
            Self::Int(_) | Self::Double(_) | Self::Bool(_) => 8,
        }
    }

    fn hash_into(&self, hasher: &mut SipHasher24) {
        hasher.write_u8(self.type_tag());
        match self {
            Self::Str(s) | Self::Json(s) => hasher.write(s.as_bytes()),
            Self::Int(v) => hasher.write_i64(*v),
            Self::Double(v) => hasher.write_u64(v.to_bits()),
            Self::Bool(v) => hasher.write_u8(*v as u8),
            Self::Bytes(b) => hasher.write(b),
        }
    }
}

/// A `(key, value)` attribute pair.
pub type Attribute = (Arc<str>, AttributeValue);

/// A timestamped event attached to a span. Never interpreted by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    /// Event time, unix nanoseconds.
    pub time_unix_nanos: i64,
    /// Event name.
    pub name: Arc<str>,
    /// Event attributes.
    pub attributes: Vec<Attribute>,
}

/// A link to another span, possibly in another trace. Stored as data, never
/// traversed (reference cycles are tolerated).
#[derive(Debug, Clone, PartialEq)]
pub struct SpanLink {
    /// Linked trace.
    pub trace_id: TraceId,
    /// Linked span.
    pub span_id: SpanId,
    /// Link attributes.
    pub attributes: Vec<Attribute>,
}

/// One unit of work within a trace. Immutable once ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    /// Owning trace.
    pub trace_id: TraceId,
    /// This span's identifier.
    pub span_id: SpanId,
    /// Parent span, if not a root.
    pub parent_span_id: Option<SpanId>,
    /// Operation name.
    pub name: Arc<str>,
    /// Role of the span.
    pub kind: SpanKind,
    /// Start time, unix nanoseconds.
    pub start_unix_nanos: i64,
    /// End time, unix nanoseconds.
    pub end_unix_nanos: i64,
    /// Outcome.
    pub status: SpanStatus,
    /// Typed key-value attributes.
    pub attributes: Vec<Attribute>,
    /// Ordered events.
    pub events: Vec<SpanEvent>,
    /// Ordered links.
    pub links: Vec<SpanLink>,
}

impl Span {
    /// Span duration in nanoseconds; zero if the end precedes the start.
    pub fn duration_nanos(&self) -> i64 {
        (self.end_unix_nanos - self.start_unix_nanos).max(0)
    }

    /// Approximate in-memory footprint, used for per-trace byte caps.
    pub fn size_bytes(&self) -> usize {
        let attrs = |attrs: &[Attribute]| -> usize {
            attrs
                .iter()
                .map(|(k, v)| k.len() + v.size_bytes())
                .sum::<usize>()
        };
        std::mem::size_of::<Self>()
            + self.name.len()
            + self.status.message.len()
            + attrs(&self.attributes)
            + self
                .events
                .iter()
                .map(|e| e.name.len() + attrs(&e.attributes))
                .sum::<usize>()
            + self.links.iter().map(|l| attrs(&l.attributes)).sum::<usize>()
    }

    /// Content hash of everything but the identifiers.
    ///
    /// `(trace_id, span_id, attributes_hash)` is the dedup key used by
    /// compaction and query merging: two received copies of the same span
    /// hash identically, while a re-used span id with different content does
    /// not collapse.
    pub fn attributes_hash(&self) -> u64 {
        let mut hasher = SipHasher24::new_with_keys(0x6c61_7267, 0x6f5f_7370);
        hasher.write(self.name.as_bytes());
        hasher.write_u8(self.kind.as_u8());
        hasher.write_i64(self.start_unix_nanos);
        hasher.write_i64(self.end_unix_nanos);
        hasher.write_u8(self.status.code.as_u8());
        hasher.write(self.status.message.as_bytes());

        let mut attrs: Vec<_> = self.attributes.iter().collect();
        attrs.sort_by(|a, b| a.0.cmp(&b.0));
        for (k, v) in attrs {
            hasher.write(k.as_bytes());
            v.hash_into(&mut hasher);
        }

        hasher.write_usize(self.events.len());
        hasher.write_usize(self.links.len());
        hasher.finish()
    }

    /// The `(span_id, attributes_hash)` pair, the per-trace dedup key.
    pub fn dedup_key(&self) -> (SpanId, u64) {
        (self.span_id, self.attributes_hash())
    }
}

/// Attributes describing the source of a batch of spans.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resource {
    /// The well-known service name, hoisted into its own block column.
    pub service_name: Arc<str>,
    /// Remaining resource attributes.
    pub attributes: Vec<Attribute>,
}

impl Resource {
    /// Approximate in-memory footprint.
    pub fn size_bytes(&self) -> usize {
        self.service_name.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.size_bytes())
                .sum::<usize>()
    }
}

/// A batch of spans sharing one resource, as handed over by the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanBatch {
    /// The common resource.
    pub resource: Resource,
    /// The spans.
    pub spans: Vec<Span>,
}

impl SpanBatch {
    /// Approximate in-memory footprint.
    pub fn size_bytes(&self) -> usize {
        self.resource.size_bytes() + self.spans.iter().map(|s| s.size_bytes()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(attrs: Vec<Attribute>) -> Span {
        Span {
            trace_id: TraceId::new([1; 16]),
            span_id: SpanId::new([2; 8]),
            parent_span_id: None,
            name: "GET /users".into(),
            kind: SpanKind::Server,
            start_unix_nanos: 100,
            end_unix_nanos: 250,
            status: SpanStatus::default(),
            attributes: attrs,
            events: vec![],
            links: vec![],
        }
    }

    #[test]
    fn attributes_hash_ignores_order() {
        let a = span(vec![
            ("http.method".into(), AttributeValue::Str("GET".into())),
            ("http.status_code".into(), AttributeValue::Int(200)),
        ]);
        let b = span(vec![
            ("http.status_code".into(), AttributeValue::Int(200)),
            ("http.method".into(), AttributeValue::Str("GET".into())),
        ]);
        assert_eq!(a.attributes_hash(), b.attributes_hash());
    }

    #[test]
    fn attributes_hash_distinguishes_content() {
        let a = span(vec![(
            "http.status_code".into(),
            AttributeValue::Int(200),
        )]);
        let b = span(vec![(
            "http.status_code".into(),
            AttributeValue::Int(500),
        )]);
        assert_ne!(a.attributes_hash(), b.attributes_hash());

        let mut c = span(vec![]);
        c.end_unix_nanos += 1;
        assert_ne!(span(vec![]).attributes_hash(), c.attributes_hash());
    }

    #[test]
    fn attributes_hash_distinguishes_value_types() {
        let a = span(vec![("k".into(), AttributeValue::Str("1".into()))]);
        let b = span(vec![("k".into(), AttributeValue::Int(1))]);
        assert_ne!(a.attributes_hash(), b.attributes_hash());
    }

    #[test]
    fn duration_clamps_to_zero() {
        let mut s = span(vec![]);
        assert_eq!(s.duration_nanos(), 150);
        s.end_unix_nanos = 0;
        assert_eq!(s.duration_nanos(), 0);
    }

    #[test]
    fn size_accounts_for_attributes() {
        let small = span(vec![]);
        let big = span(vec![(
            "key".into(),
            AttributeValue::Str("a longer value than nothing".into()),
        )]);
        assert!(big.size_bytes() > small.size_bytes());
    }
}
