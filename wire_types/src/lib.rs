//! Protobuf messages for serialized span payloads.
//!
//! These mirror the wire schema used by WAL records and by the opaque
//! event/link columns inside blocks. The receiver's OTLP codec is an
//! external collaborator; by the time data reaches this crate it has already
//! been mapped onto [`data_types`] values.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{
    AttributeValue, Resource, Span, SpanBatch, SpanEvent, SpanId, SpanKind, SpanLink, SpanStatus,
    StatusCode, TraceId,
};
use snafu::{OptionExt, Snafu};
use std::sync::Arc;

/// Decoding failures; encoding is infallible.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid {what} length {got}"))]
    InvalidIdLength { what: &'static str, got: usize },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One WAL record: a sequenced batch.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalRecord {
    /// Per-tenant monotonic sequence number assigned at append time.
    #[prost(int64, tag = "1")]
    pub sequence: i64,
    /// The batch payload.
    #[prost(message, optional, tag = "2")]
    pub batch: Option<EncodedBatch>,
}

/// A batch of spans sharing one resource.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncodedBatch {
    #[prost(message, optional, tag = "1")]
    pub resource: Option<EncodedResource>,
    #[prost(message, repeated, tag = "2")]
    pub spans: Vec<EncodedSpan>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncodedResource {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(message, repeated, tag = "2")]
    pub attributes: Vec<EncodedAttribute>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncodedAttribute {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "encoded_attribute::Value", tags = "2, 3, 4, 5, 6, 7")]
    pub value: Option<encoded_attribute::Value>,
}

pub mod encoded_attribute {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(string, tag = "2")]
        StrValue(String),
        #[prost(int64, tag = "3")]
        IntValue(i64),
        #[prost(double, tag = "4")]
        DoubleValue(f64),
        #[prost(bool, tag = "5")]
        BoolValue(bool),
        #[prost(bytes, tag = "6")]
        BytesValue(Vec<u8>),
        /// JSON fallback for values the wire protocol cannot represent.
        #[prost(string, tag = "7")]
        JsonValue(String),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncodedSpan {
    #[prost(bytes, tag = "1")]
    pub trace_id: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub span_id: Vec<u8>,
    /// Empty when the span is a root.
    #[prost(bytes, tag = "3")]
    pub parent_span_id: Vec<u8>,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(uint32, tag = "5")]
    pub kind: u32,
    #[prost(int64, tag = "6")]
    pub start_unix_nanos: i64,
    #[prost(int64, tag = "7")]
    pub end_unix_nanos: i64,
    #[prost(uint32, tag = "8")]
    pub status_code: u32,
    #[prost(string, tag = "9")]
    pub status_message: String,
    #[prost(message, repeated, tag = "10")]
    pub attributes: Vec<EncodedAttribute>,
    #[prost(message, repeated, tag = "11")]
    pub events: Vec<EncodedEvent>,
    #[prost(message, repeated, tag = "12")]
    pub links: Vec<EncodedLink>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncodedEvent {
    #[prost(int64, tag = "1")]
    pub time_unix_nanos: i64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    pub attributes: Vec<EncodedAttribute>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncodedLink {
    #[prost(bytes, tag = "1")]
    pub trace_id: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub span_id: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub attributes: Vec<EncodedAttribute>,
}

/// A list of events, the payload of a block's opaque events column.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncodedEventList {
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<EncodedEvent>,
}

/// A list of links, the payload of a block's opaque links column.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncodedLinkList {
    #[prost(message, repeated, tag = "1")]
    pub links: Vec<EncodedLink>,
}

fn encode_attribute(key: &str, value: &AttributeValue) -> EncodedAttribute {
    use encoded_attribute::Value;
    EncodedAttribute {
        key: key.to_string(),
        value: Some(match value {
            AttributeValue::Str(s) => Value::StrValue(s.to_string()),
            AttributeValue::Int(v) => Value::IntValue(*v),
            AttributeValue::Double(v) => Value::DoubleValue(*v),
            AttributeValue::Bool(v) => Value::BoolValue(*v),
            AttributeValue::Bytes(b) => Value::BytesValue(b.to_vec()),
            AttributeValue::Json(s) => Value::JsonValue(s.to_string()),
        }),
    }
}

fn decode_attribute(attr: &EncodedAttribute) -> Option<(Arc<str>, AttributeValue)> {
    use encoded_attribute::Value;
    let value = match attr.value.as_ref()? {
        Value::StrValue(s) => AttributeValue::Str(s.as_str().into()),
        Value::IntValue(v) => AttributeValue::Int(*v),
        Value::DoubleValue(v) => AttributeValue::Double(*v),
        Value::BoolValue(v) => AttributeValue::Bool(*v),
        Value::BytesValue(b) => AttributeValue::Bytes(b.clone().into()),
        Value::JsonValue(s) => AttributeValue::Json(s.as_str().into()),
    };
    Some((attr.key.as_str().into(), value))
}

fn encode_attributes(attrs: &[(Arc<str>, AttributeValue)]) -> Vec<EncodedAttribute> {
    attrs.iter().map(|(k, v)| encode_attribute(k, v)).collect()
}

fn decode_attributes(attrs: &[EncodedAttribute]) -> Vec<(Arc<str>, AttributeValue)> {
    // attributes with no value are dropped rather than failing the record
    attrs.iter().filter_map(decode_attribute).collect()
}

fn decode_trace_id(bytes: &[u8]) -> Result<TraceId> {
    let raw: [u8; 16] = bytes.try_into().ok().context(InvalidIdLengthSnafu {
        what: "trace id",
        got: bytes.len(),
    })?;
    Ok(TraceId::new(raw))
}

fn decode_span_id(bytes: &[u8]) -> Result<SpanId> {
    let raw: [u8; 8] = bytes.try_into().ok().context(InvalidIdLengthSnafu {
        what: "span id",
        got: bytes.len(),
    })?;
    Ok(SpanId::new(raw))
}

/// Encode a span event list for the opaque events column.
pub fn encode_events(events: &[SpanEvent]) -> EncodedEventList {
    EncodedEventList {
        events: events
            .iter()
            .map(|e| EncodedEvent {
                time_unix_nanos: e.time_unix_nanos,
                name: e.name.to_string(),
                attributes: encode_attributes(&e.attributes),
            })
            .collect(),
    }
}

/// Inverse of [`encode_events`].
pub fn decode_events(list: &EncodedEventList) -> Vec<SpanEvent> {
    list.events
        .iter()
        .map(|e| SpanEvent {
            time_unix_nanos: e.time_unix_nanos,
            name: e.name.as_str().into(),
            attributes: decode_attributes(&e.attributes),
        })
        .collect()
}

/// Encode a span link list for the opaque links column.
pub fn encode_links(links: &[SpanLink]) -> EncodedLinkList {
    EncodedLinkList {
        links: links
            .iter()
            .map(|l| EncodedLink {
                trace_id: l.trace_id.as_bytes().to_vec(),
                span_id: l.span_id.as_bytes().to_vec(),
                attributes: encode_attributes(&l.attributes),
            })
            .collect(),
    }
}

/// Inverse of [`encode_links`].
pub fn decode_links(list: &EncodedLinkList) -> Result<Vec<SpanLink>> {
    list.links
        .iter()
        .map(|l| {
            Ok(SpanLink {
                trace_id: decode_trace_id(&l.trace_id)?,
                span_id: decode_span_id(&l.span_id)?,
                attributes: decode_attributes(&l.attributes),
            })
        })
        .collect()
}

/// Encode a span.
pub fn encode_span(span: &Span) -> EncodedSpan {
    EncodedSpan {
        trace_id: span.trace_id.as_bytes().to_vec(),
        span_id: span.span_id.as_bytes().to_vec(),
        parent_span_id: span
            .parent_span_id
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default(),
        name: span.name.to_string(),
        kind: span.kind.as_u8() as u32,
        start_unix_nanos: span.start_unix_nanos,
        end_unix_nanos: span.end_unix_nanos,
        status_code: span.status.code.as_u8() as u32,
        status_message: span.status.message.to_string(),
        attributes: encode_attributes(&span.attributes),
        events: encode_events(&span.events).events,
        links: encode_links(&span.links).links,
    }
}

/// Inverse of [`encode_span`].
pub fn decode_span(span: &EncodedSpan) -> Result<Span> {
    let parent_span_id = if span.parent_span_id.is_empty() {
        None
    } else {
        Some(decode_span_id(&span.parent_span_id)?)
    };
    Ok(Span {
        trace_id: decode_trace_id(&span.trace_id)?,
        span_id: decode_span_id(&span.span_id)?,
        parent_span_id,
        name: span.name.as_str().into(),
        kind: SpanKind::from_u8(span.kind as u8),
        start_unix_nanos: span.start_unix_nanos,
        end_unix_nanos: span.end_unix_nanos,
        status: SpanStatus {
            code: StatusCode::from_u8(span.status_code as u8),
            message: span.status_message.as_str().into(),
        },
        attributes: decode_attributes(&span.attributes),
        events: decode_events(&EncodedEventList {
            events: span.events.clone(),
        }),
        links: decode_links(&EncodedLinkList {
            links: span.links.clone(),
        })?,
    })
}

/// Encode a batch.
pub fn encode_batch(batch: &SpanBatch) -> EncodedBatch {
    EncodedBatch {
        resource: Some(EncodedResource {
            service_name: batch.resource.service_name.to_string(),
            attributes: encode_attributes(&batch.resource.attributes),
        }),
        spans: batch.spans.iter().map(encode_span).collect(),
    }
}

/// Inverse of [`encode_batch`].
pub fn decode_batch(batch: &EncodedBatch) -> Result<SpanBatch> {
    let resource = batch
        .resource
        .as_ref()
        .map(|r| Resource {
            service_name: r.service_name.as_str().into(),
            attributes: decode_attributes(&r.attributes),
        })
        .unwrap_or_default();
    Ok(SpanBatch {
        resource,
        spans: batch
            .spans
            .iter()
            .map(decode_span)
            .collect::<Result<Vec<_>>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn batch() -> SpanBatch {
        SpanBatch {
            resource: Resource {
                service_name: "checkout".into(),
                attributes: vec![("host".into(), AttributeValue::Str("node-1".into()))],
            },
            spans: vec![Span {
                trace_id: TraceId::new([7; 16]),
                span_id: SpanId::new([3; 8]),
                parent_span_id: Some(SpanId::new([9; 8])),
                name: "charge-card".into(),
                kind: SpanKind::Client,
                start_unix_nanos: 17,
                end_unix_nanos: 42,
                status: SpanStatus {
                    code: StatusCode::Ok,
                    message: "".into(),
                },
                attributes: vec![
                    ("retries".into(), AttributeValue::Int(2)),
                    ("weights".into(), AttributeValue::Json("[1,2]".into())),
                    (
                        "payload".into(),
                        AttributeValue::Bytes(vec![1, 2, 3].into()),
                    ),
                ],
                events: vec![SpanEvent {
                    time_unix_nanos: 20,
                    name: "retry".into(),
                    attributes: vec![("attempt".into(), AttributeValue::Int(1))],
                }],
                links: vec![SpanLink {
                    trace_id: TraceId::new([8; 16]),
                    span_id: SpanId::new([4; 8]),
                    attributes: vec![],
                }],
            }],
        }
    }

    #[test]
    fn batch_round_trips_through_protobuf() {
        let batch = batch();
        let encoded = encode_batch(&batch);

        let mut buf = Vec::new();
        encoded.encode(&mut buf).unwrap();
        let reparsed = EncodedBatch::decode(buf.as_slice()).unwrap();

        assert_eq!(decode_batch(&reparsed).unwrap(), batch);
    }

    #[test]
    fn root_span_has_no_parent() {
        let mut batch = batch();
        batch.spans[0].parent_span_id = None;
        let decoded = decode_batch(&encode_batch(&batch)).unwrap();
        assert_eq!(decoded.spans[0].parent_span_id, None);
    }

    #[test]
    fn bad_trace_id_length_is_rejected() {
        let mut encoded = encode_batch(&batch());
        encoded.spans[0].trace_id = vec![1, 2, 3];
        assert!(matches!(
            decode_batch(&encoded),
            Err(Error::InvalidIdLength { got: 3, .. })
        ));
    }

    #[test]
    fn events_and_links_round_trip_standalone() {
        let batch = batch();
        let span = &batch.spans[0];

        let events = encode_events(&span.events);
        let mut buf = Vec::new();
        events.encode(&mut buf).unwrap();
        let back = EncodedEventList::decode(buf.as_slice()).unwrap();
        assert_eq!(decode_events(&back), span.events);

        let links = encode_links(&span.links);
        let mut buf = Vec::new();
        links.encode(&mut buf).unwrap();
        let back = EncodedLinkList::decode(buf.as_slice()).unwrap();
        assert_eq!(decode_links(&back).unwrap(), span.links);
    }
}
