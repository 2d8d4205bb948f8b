//! Building row groups from trace rows and decoding them back.
//!
//! A row group holds a contiguous, trace-id-sorted run of traces. Trace
//! nesting is flattened: one `span_count` per trace plus span-level columns
//! in trace order. Resources are deduplicated into a per-row-group
//! dictionary referenced by a per-span index. Generic attributes are stored
//! entry-flattened with a per-span entry count, a type-tag column, and one
//! statically typed value column per variant.

use crate::column::{self, dict_str_column, Column};
use data_types::{
    AttributeValue, DedicatedColumnKind, DedicatedColumnSpec, Resource, Span, SpanEvent, SpanId,
    SpanKind, SpanLink, SpanStatus, StatusCode, TimeRange, TraceId, TraceRow,
};
use prost::Message;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::{collections::BTreeMap, sync::Arc};

/// Column names within a row group.
pub(crate) mod names {
    pub const TRACE_ID: &str = "trace_id";
    pub const SPAN_COUNT: &str = "span_count";
    pub const SPAN_ID: &str = "span_id";
    pub const PARENT_PRESENT: &str = "parent_present";
    pub const PARENT_ID: &str = "parent_id";
    pub const NAME: &str = "name";
    pub const KIND: &str = "kind";
    pub const START: &str = "start_unix_nanos";
    pub const END: &str = "end_unix_nanos";
    pub const STATUS_CODE: &str = "status_code";
    pub const STATUS_MESSAGE: &str = "status_message";
    pub const RESOURCE_IDX: &str = "resource_idx";
    pub const RESOURCE_SERVICE: &str = "resource_service";
    pub const RESOURCE_ATTRS: &str = "resource_attrs";
    pub const ATTR_COUNT: &str = "attr_count";
    pub const ATTR_KEY: &str = "attr_key";
    pub const ATTR_TYPE: &str = "attr_type";
    pub const ATTR_STR: &str = "attr_str";
    pub const ATTR_INT: &str = "attr_int";
    pub const ATTR_DOUBLE: &str = "attr_double";
    pub const ATTR_BOOL: &str = "attr_bool";
    pub const ATTR_BYTES: &str = "attr_bytes";
    pub const ATTR_JSON: &str = "attr_json";
    pub const EVENTS: &str = "events";
    pub const LINKS: &str = "links";

    pub fn dedicated_value(key: &str) -> String {
        format!("ded_value:{key}")
    }

    pub fn dedicated_present(key: &str) -> String {
        format!("ded_present:{key}")
    }
}

/// The columns the cheap search phase needs, beyond dedicated ones.
pub(crate) const CHEAP_COLUMNS: &[&str] = &[
    names::TRACE_ID,
    names::SPAN_COUNT,
    names::NAME,
    names::START,
    names::END,
    names::STATUS_CODE,
    names::RESOURCE_IDX,
    names::RESOURCE_SERVICE,
];

/// Errors raised when a row group's columns are inconsistent.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("row group is missing column {name}"))]
    MissingColumn { name: String },

    #[snafu(display("column {name} has unexpected encoding"))]
    WrongEncoding { name: String },

    #[snafu(display("column {name} has {got} rows, expected {expected}"))]
    LengthMismatch {
        name: String,
        got: usize,
        expected: usize,
    },

    #[snafu(display("column error: {source}"))]
    Column { source: column::Error },

    #[snafu(display("opaque payload decode error in column {name}: {source}"))]
    Opaque {
        name: String,
        source: prost::DecodeError,
    },

    #[snafu(display("invalid id bytes: {source}"))]
    BadIds { source: wire_types::Error },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Write-side statistics of a built row group, recorded in the footer.
#[derive(Debug, Clone, PartialEq)]
pub struct RowGroupStats {
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
    /// Per dedicated-int-column `(min, max)` over present rows.
    pub dedicated_int_stats: BTreeMap<String, (i64, i64)>,
}

fn extract_dedicated(
    span: &Span,
    specs: &[DedicatedColumnSpec],
) -> (Vec<(usize, AttributeValue)>, Vec<(Arc<str>, AttributeValue)>) {
    let mut dedicated = Vec::new();
    let mut generic = Vec::new();
    'attrs: for (key, value) in &span.attributes {
        for (i, spec) in specs.iter().enumerate() {
            if spec.key == key.as_ref() && dedicated.iter().all(|(j, _)| *j != i) {
                let matches = matches!(
                    (spec.kind, value),
                    (DedicatedColumnKind::Str, AttributeValue::Str(_))
                        | (DedicatedColumnKind::Int, AttributeValue::Int(_))
                );
                if matches {
                    dedicated.push((i, value.clone()));
                    continue 'attrs;
                }
            }
        }
        generic.push((Arc::clone(key), value.clone()));
    }
    (dedicated, generic)
}

/// Flatten sorted trace rows into columns.
///
/// # Panics
///
/// If `traces` is empty or not strictly sorted by trace id.
pub(crate) fn build_columns(
    traces: &[TraceRow],
    dedicated: &[DedicatedColumnSpec],
) -> (BTreeMap<String, Column>, RowGroupStats) {
    assert!(!traces.is_empty(), "row group needs at least one trace");
    assert!(
        traces.windows(2).all(|w| w[0].trace_id < w[1].trace_id),
        "row group traces must be strictly sorted by trace id"
    );

    let mut trace_ids = Vec::with_capacity(traces.len());
    let mut span_counts = Vec::with_capacity(traces.len());

    let mut span_ids = Vec::new();
    let mut parent_present = Vec::new();
    let mut parent_ids = Vec::new();
    let mut span_names: Vec<Arc<str>> = Vec::new();
    let mut kinds = Vec::new();
    let mut starts = Vec::new();
    let mut ends = Vec::new();
    let mut status_codes = Vec::new();
    let mut status_messages: Vec<Arc<str>> = Vec::new();
    let mut resource_idx = Vec::new();
    let mut events = Vec::new();
    let mut links = Vec::new();

    let mut attr_counts = Vec::new();
    let mut attr_keys: Vec<Arc<str>> = Vec::new();
    let mut attr_types = Vec::new();
    let mut attr_strs: Vec<Arc<str>> = Vec::new();
    let mut attr_ints = Vec::new();
    let mut attr_doubles = Vec::new();
    let mut attr_bools = Vec::new();
    let mut attr_bytes = Vec::new();
    let mut attr_jsons: Vec<Arc<str>> = Vec::new();

    // dedicated columns: presence byte + value per span
    let mut ded_present = vec![Vec::new(); dedicated.len()];
    let mut ded_str: Vec<Vec<Arc<str>>> = vec![Vec::new(); dedicated.len()];
    let mut ded_int = vec![Vec::new(); dedicated.len()];
    let mut dedicated_int_stats: BTreeMap<String, (i64, i64)> = BTreeMap::new();

    // per-row-group resource dictionary, keyed by encoded bytes
    let mut resources: Vec<Vec<u8>> = Vec::new();
    let mut resource_lookup: BTreeMap<Vec<u8>, u32> = BTreeMap::new();
    let mut resource_services: Vec<Arc<str>> = Vec::new();

    let mut time_range = TimeRange::EMPTY;
    let mut total_spans = 0u64;

    for trace in traces {
        trace_ids.push(*trace.trace_id.as_bytes());
        span_counts.push(trace.span_count() as u32);

        for batch in &trace.batches {
            let encoded_resource = wire_types::EncodedResource {
                service_name: batch.resource.service_name.to_string(),
                attributes: wire_types::encode_batch(&data_types::SpanBatch {
                    resource: batch.resource.clone(),
                    spans: vec![],
                })
                .resource
                .expect("resource is set")
                .attributes,
            };
            let mut resource_bytes = Vec::with_capacity(encoded_resource.encoded_len());
            encoded_resource
                .encode(&mut resource_bytes)
                .expect("vec write cannot fail");

            let res_idx = *resource_lookup.entry(resource_bytes.clone()).or_insert_with(|| {
                resources.push(resource_bytes);
                resource_services.push(Arc::clone(&batch.resource.service_name));
                (resources.len() - 1) as u32
            });

            for span in &batch.spans {
                total_spans += 1;
                time_range.observe(span.start_unix_nanos);
                time_range.observe(span.end_unix_nanos);

                span_ids.push(*span.span_id.as_bytes());
                parent_present.push(span.parent_span_id.is_some() as u8);
                parent_ids.push(
                    span.parent_span_id
                        .map(|id| *id.as_bytes())
                        .unwrap_or_default(),
                );
                span_names.push(Arc::clone(&span.name));
                kinds.push(span.kind.as_u8());
                starts.push(span.start_unix_nanos);
                ends.push(span.end_unix_nanos);
                status_codes.push(span.status.code.as_u8());
                status_messages.push(Arc::clone(&span.status.message));
                resource_idx.push(res_idx);

                let (ded, generic) = extract_dedicated(span, dedicated);
                for (i, spec) in dedicated.iter().enumerate() {
                    let value = ded.iter().find(|(j, _)| *j == i).map(|(_, v)| v);
                    ded_present[i].push(value.is_some() as u8);
                    match spec.kind {
                        DedicatedColumnKind::Str => {
                            ded_str[i].push(match value {
                                Some(AttributeValue::Str(s)) => Arc::clone(s),
                                _ => "".into(),
                            });
                        }
                        DedicatedColumnKind::Int => {
                            let v = match value {
                                Some(AttributeValue::Int(v)) => {
                                    let entry = dedicated_int_stats
                                        .entry(spec.key.clone())
                                        .or_insert((*v, *v));
                                    entry.0 = entry.0.min(*v);
                                    entry.1 = entry.1.max(*v);
                                    *v
                                }
                                _ => 0,
                            };
                            ded_int[i].push(v);
                        }
                    }
                }

                attr_counts.push(generic.len() as u32);
                for (key, value) in generic {
                    attr_keys.push(key);
                    attr_types.push(value.type_tag());
                    // one statically typed column per variant; rows of other
                    // variants hold the default
                    let (s, i, d, b, by, j) = match value {
                        AttributeValue::Str(v) => (v, 0, 0.0, 0, vec![], "".into()),
                        AttributeValue::Int(v) => ("".into(), v, 0.0, 0, vec![], "".into()),
                        AttributeValue::Double(v) => ("".into(), 0, v, 0, vec![], "".into()),
                        AttributeValue::Bool(v) => {
                            ("".into(), 0, 0.0, v as u8, vec![], "".into())
                        }
                        AttributeValue::Bytes(v) => {
                            ("".into(), 0, 0.0, 0, v.to_vec(), "".into())
                        }
                        AttributeValue::Json(v) => ("".into(), 0, 0.0, 0, vec![], v),
                    };
                    attr_strs.push(s);
                    attr_ints.push(i);
                    attr_doubles.push(d);
                    attr_bools.push(b);
                    attr_bytes.push(by);
                    attr_jsons.push(j);
                }

                events.push(if span.events.is_empty() {
                    vec![]
                } else {
                    let list = wire_types::encode_events(&span.events);
                    let mut buf = Vec::with_capacity(list.encoded_len());
                    list.encode(&mut buf).expect("vec write cannot fail");
                    buf
                });
                links.push(if span.links.is_empty() {
                    vec![]
                } else {
                    let list = wire_types::encode_links(&span.links);
                    let mut buf = Vec::with_capacity(list.encoded_len());
                    list.encode(&mut buf).expect("vec write cannot fail");
                    buf
                });
            }
        }
    }

    let mut columns = BTreeMap::new();
    columns.insert(names::TRACE_ID.into(), Column::Fixed16(trace_ids));
    columns.insert(names::SPAN_COUNT.into(), Column::U32(span_counts));
    columns.insert(names::SPAN_ID.into(), Column::Fixed8(span_ids));
    columns.insert(names::PARENT_PRESENT.into(), Column::U8(parent_present));
    columns.insert(names::PARENT_ID.into(), Column::Fixed8(parent_ids));
    columns.insert(
        names::NAME.into(),
        dict_str_column(span_names.iter().map(|s| s.as_ref())),
    );
    columns.insert(names::KIND.into(), Column::U8(kinds));
    columns.insert(names::START.into(), Column::I64(starts));
    columns.insert(names::END.into(), Column::I64(ends));
    columns.insert(names::STATUS_CODE.into(), Column::U8(status_codes));
    columns.insert(
        names::STATUS_MESSAGE.into(),
        dict_str_column(status_messages.iter().map(|s| s.as_ref())),
    );
    columns.insert(names::RESOURCE_IDX.into(), Column::U32(resource_idx));
    columns.insert(
        names::RESOURCE_SERVICE.into(),
        dict_str_column(resource_services.iter().map(|s| s.as_ref())),
    );
    columns.insert(names::RESOURCE_ATTRS.into(), Column::VarBytes(resources));
    columns.insert(names::ATTR_COUNT.into(), Column::U32(attr_counts));
    columns.insert(
        names::ATTR_KEY.into(),
        dict_str_column(attr_keys.iter().map(|s| s.as_ref())),
    );
    columns.insert(names::ATTR_TYPE.into(), Column::U8(attr_types));
    columns.insert(
        names::ATTR_STR.into(),
        dict_str_column(attr_strs.iter().map(|s| s.as_ref())),
    );
    columns.insert(names::ATTR_INT.into(), Column::I64(attr_ints));
    columns.insert(names::ATTR_DOUBLE.into(), Column::F64(attr_doubles));
    columns.insert(names::ATTR_BOOL.into(), Column::U8(attr_bools));
    columns.insert(names::ATTR_BYTES.into(), Column::VarBytes(attr_bytes));
    columns.insert(
        names::ATTR_JSON.into(),
        dict_str_column(attr_jsons.iter().map(|s| s.as_ref())),
    );
    columns.insert(names::EVENTS.into(), Column::VarBytes(events));
    columns.insert(names::LINKS.into(), Column::VarBytes(links));

    for (i, spec) in dedicated.iter().enumerate() {
        columns.insert(
            names::dedicated_present(&spec.key),
            Column::U8(std::mem::take(&mut ded_present[i])),
        );
        let value_column = match spec.kind {
            DedicatedColumnKind::Str => {
                dict_str_column(ded_str[i].iter().map(|s| s.as_ref()))
            }
            DedicatedColumnKind::Int => Column::I64(std::mem::take(&mut ded_int[i])),
        };
        columns.insert(names::dedicated_value(&spec.key), value_column);
    }

    let stats = RowGroupStats {
        min_trace_id: traces.first().expect("non-empty").trace_id,
        max_trace_id: traces.last().expect("non-empty").trace_id,
        time_range,
        trace_count: traces.len() as u64,
        span_count: total_spans,
        dedicated_int_stats,
    };
    (columns, stats)
}

fn get<'c>(columns: &'c BTreeMap<String, Column>, name: &str) -> Result<&'c Column> {
    columns.get(name).context(MissingColumnSnafu { name })
}

macro_rules! typed_column {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        fn $fn_name<'c>(columns: &'c BTreeMap<String, Column>, name: &str) -> Result<&'c $ty> {
            match get(columns, name)? {
                Column::$variant(v) => Ok(v),
                _ => WrongEncodingSnafu { name }.fail(),
            }
        }
    };
}

typed_column!(fixed16, Fixed16, Vec<[u8; 16]>);
typed_column!(fixed8, Fixed8, Vec<[u8; 8]>);
typed_column!(i64s, I64, Vec<i64>);
typed_column!(u32s, U32, Vec<u32>);
typed_column!(u8s, U8, Vec<u8>);
typed_column!(f64s, F64, Vec<f64>);
typed_column!(var_bytes, VarBytes, Vec<Vec<u8>>);

fn dict<'c>(columns: &'c BTreeMap<String, Column>, name: &str) -> Result<&'c Column> {
    let column = get(columns, name)?;
    ensure!(
        matches!(column, Column::DictStr { .. }),
        WrongEncodingSnafu { name }
    );
    Ok(column)
}

fn expect_len(name: &str, got: usize, expected: usize) -> Result<()> {
    ensure!(
        got == expected,
        LengthMismatchSnafu {
            name,
            got,
            expected
        }
    );
    Ok(())
}

/// Decode complete trace rows from a full column set.
///
/// Attributes are emitted sorted by key; span multiset content is preserved.
pub(crate) fn decode_traces(columns: &BTreeMap<String, Column>) -> Result<Vec<TraceRow>> {
    let trace_ids = fixed16(columns, names::TRACE_ID)?;
    let span_counts = u32s(columns, names::SPAN_COUNT)?;
    expect_len(names::SPAN_COUNT, span_counts.len(), trace_ids.len())?;
    let total_spans: usize = span_counts.iter().map(|c| *c as usize).sum();

    let span_ids = fixed8(columns, names::SPAN_ID)?;
    expect_len(names::SPAN_ID, span_ids.len(), total_spans)?;
    let parent_present = u8s(columns, names::PARENT_PRESENT)?;
    expect_len(names::PARENT_PRESENT, parent_present.len(), total_spans)?;
    let parent_ids = fixed8(columns, names::PARENT_ID)?;
    expect_len(names::PARENT_ID, parent_ids.len(), total_spans)?;
    let name_col = dict(columns, names::NAME)?;
    expect_len(names::NAME, name_col.len(), total_spans)?;
    let kinds = u8s(columns, names::KIND)?;
    expect_len(names::KIND, kinds.len(), total_spans)?;
    let starts = i64s(columns, names::START)?;
    let ends = i64s(columns, names::END)?;
    expect_len(names::START, starts.len(), total_spans)?;
    expect_len(names::END, ends.len(), total_spans)?;
    let status_codes = u8s(columns, names::STATUS_CODE)?;
    expect_len(names::STATUS_CODE, status_codes.len(), total_spans)?;
    let status_message_col = dict(columns, names::STATUS_MESSAGE)?;
    expect_len(names::STATUS_MESSAGE, status_message_col.len(), total_spans)?;
    let resource_idx = u32s(columns, names::RESOURCE_IDX)?;
    expect_len(names::RESOURCE_IDX, resource_idx.len(), total_spans)?;
    let resource_attrs = var_bytes(columns, names::RESOURCE_ATTRS)?;
    let attr_counts = u32s(columns, names::ATTR_COUNT)?;
    expect_len(names::ATTR_COUNT, attr_counts.len(), total_spans)?;
    let total_attrs: usize = attr_counts.iter().map(|c| *c as usize).sum();
    let attr_key_col = dict(columns, names::ATTR_KEY)?;
    expect_len(names::ATTR_KEY, attr_key_col.len(), total_attrs)?;
    let attr_types = u8s(columns, names::ATTR_TYPE)?;
    expect_len(names::ATTR_TYPE, attr_types.len(), total_attrs)?;
    let attr_str_col = dict(columns, names::ATTR_STR)?;
    expect_len(names::ATTR_STR, attr_str_col.len(), total_attrs)?;
    let attr_ints = i64s(columns, names::ATTR_INT)?;
    expect_len(names::ATTR_INT, attr_ints.len(), total_attrs)?;
    let attr_doubles = f64s(columns, names::ATTR_DOUBLE)?;
    expect_len(names::ATTR_DOUBLE, attr_doubles.len(), total_attrs)?;
    let attr_bools = u8s(columns, names::ATTR_BOOL)?;
    expect_len(names::ATTR_BOOL, attr_bools.len(), total_attrs)?;
    let attr_bytes = var_bytes(columns, names::ATTR_BYTES)?;
    expect_len(names::ATTR_BYTES, attr_bytes.len(), total_attrs)?;
    let attr_json_col = dict(columns, names::ATTR_JSON)?;
    expect_len(names::ATTR_JSON, attr_json_col.len(), total_attrs)?;
    let events = var_bytes(columns, names::EVENTS)?;
    let links = var_bytes(columns, names::LINKS)?;
    expect_len(names::EVENTS, events.len(), total_spans)?;
    expect_len(names::LINKS, links.len(), total_spans)?;

    // dedicated columns are discovered by name prefix
    struct Dedicated<'c> {
        key: Arc<str>,
        present: &'c Vec<u8>,
        values: DedicatedValues<'c>,
    }
    enum DedicatedValues<'c> {
        Str(&'c Column),
        Int(&'c Vec<i64>),
    }
    let mut dedicated = Vec::new();
    for name in columns.keys() {
        let Some(key) = name.strip_prefix("ded_present:") else {
            continue;
        };
        let present = u8s(columns, name)?;
        expect_len(name, present.len(), total_spans)?;
        let value_name = names::dedicated_value(key);
        let value_column = get(columns, &value_name)?;
        expect_len(&value_name, value_column.len(), total_spans)?;
        let values = match value_column {
            Column::DictStr { .. } => DedicatedValues::Str(dict(columns, &value_name)?),
            Column::I64(v) => DedicatedValues::Int(v),
            _ => return WrongEncodingSnafu { name: value_name }.fail(),
        };
        dedicated.push(Dedicated {
            key: Arc::from(key),
            present,
            values,
        });
    }

    // decode the resource dictionary once
    let mut decoded_resources = Vec::with_capacity(resource_attrs.len());
    for bytes in resource_attrs {
        let encoded = wire_types::EncodedResource::decode(bytes.as_slice()).context(
            OpaqueSnafu {
                name: names::RESOURCE_ATTRS,
            },
        )?;
        let batch = wire_types::decode_batch(&wire_types::EncodedBatch {
            resource: Some(encoded),
            spans: vec![],
        })
        .context(BadIdsSnafu)?;
        decoded_resources.push(batch.resource);
    }

    let mut traces = Vec::with_capacity(trace_ids.len());
    let mut span_cursor = 0usize;
    let mut attr_cursor = 0usize;

    for (trace_idx, raw_trace_id) in trace_ids.iter().enumerate() {
        let mut row = TraceRow::new(TraceId::new(*raw_trace_id));
        let count = span_counts[trace_idx] as usize;

        for s in span_cursor..span_cursor + count {
            let generic_count = attr_counts[s] as usize;
            let mut attributes: Vec<(Arc<str>, AttributeValue)> =
                Vec::with_capacity(generic_count + dedicated.len());
            for a in attr_cursor..attr_cursor + generic_count {
                let key = Arc::clone(attr_key_col.str_at(a).context(MissingColumnSnafu {
                    name: names::ATTR_KEY,
                })?);
                let value = match attr_types[a] {
                    0 => AttributeValue::Str(Arc::clone(attr_str_col.str_at(a).context(
                        MissingColumnSnafu {
                            name: names::ATTR_STR,
                        },
                    )?)),
                    1 => AttributeValue::Int(attr_ints[a]),
                    2 => AttributeValue::Double(attr_doubles[a]),
                    3 => AttributeValue::Bool(attr_bools[a] != 0),
                    4 => AttributeValue::Bytes(attr_bytes[a].clone().into()),
                    _ => AttributeValue::Json(Arc::clone(attr_json_col.str_at(a).context(
                        MissingColumnSnafu {
                            name: names::ATTR_JSON,
                        },
                    )?)),
                };
                attributes.push((key, value));
            }
            attr_cursor += generic_count;

            for ded in &dedicated {
                if ded.present[s] == 0 {
                    continue;
                }
                let value = match &ded.values {
                    DedicatedValues::Str(col) => AttributeValue::Str(Arc::clone(
                        col.str_at(s).context(MissingColumnSnafu {
                            name: names::dedicated_value(&ded.key),
                        })?,
                    )),
                    DedicatedValues::Int(v) => AttributeValue::Int(v[s]),
                };
                attributes.push((Arc::clone(&ded.key), value));
            }
            attributes.sort_by(|a, b| a.0.cmp(&b.0));

            let decoded_events: Vec<SpanEvent> = if events[s].is_empty() {
                vec![]
            } else {
                let list = wire_types::EncodedEventList::decode(events[s].as_slice())
                    .context(OpaqueSnafu {
                        name: names::EVENTS,
                    })?;
                wire_types::decode_events(&list)
            };
            let decoded_links: Vec<SpanLink> = if links[s].is_empty() {
                vec![]
            } else {
                let list = wire_types::EncodedLinkList::decode(links[s].as_slice())
                    .context(OpaqueSnafu { name: names::LINKS })?;
                wire_types::decode_links(&list).context(BadIdsSnafu)?
            };

            let span = Span {
                trace_id: TraceId::new(*raw_trace_id),
                span_id: SpanId::new(span_ids[s]),
                parent_span_id: (parent_present[s] != 0).then(|| SpanId::new(parent_ids[s])),
                name: Arc::clone(name_col.str_at(s).context(MissingColumnSnafu {
                    name: names::NAME,
                })?),
                kind: SpanKind::from_u8(kinds[s]),
                start_unix_nanos: starts[s],
                end_unix_nanos: ends[s],
                status: SpanStatus {
                    code: StatusCode::from_u8(status_codes[s]),
                    message: Arc::clone(status_message_col.str_at(s).context(
                        MissingColumnSnafu {
                            name: names::STATUS_MESSAGE,
                        },
                    )?),
                },
                attributes,
                events: decoded_events,
                links: decoded_links,
            };

            let resource: &Resource = decoded_resources
                .get(resource_idx[s] as usize)
                .context(MissingColumnSnafu {
                    name: names::RESOURCE_ATTRS,
                })?;
            row.push_spans(resource, [span]);
        }

        span_cursor += count;
        traces.push(row);
    }

    Ok(traces)
}

/// The verdict of the cheap evaluation phase for one trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TraceVerdict {
    /// Some span definitely matches.
    Match,
    /// Undecided: needs the generic attribute columns.
    Maybe,
    /// No span can match.
    No,
}

/// Cheap-phase view over the hoisted and dedicated columns only.
pub(crate) struct CheapView<'c> {
    pub trace_ids: &'c Vec<[u8; 16]>,
    span_counts: &'c Vec<u32>,
    name_col: &'c Column,
    starts: &'c Vec<i64>,
    ends: &'c Vec<i64>,
    status_codes: &'c Vec<u8>,
    resource_idx: &'c Vec<u32>,
    resource_service_col: &'c Column,
    dedicated: BTreeMap<Arc<str>, (&'c Vec<u8>, DedCheap<'c>)>,
}

enum DedCheap<'c> {
    Str(&'c Column),
    Int(&'c Vec<i64>),
}

struct CheapLens<'v, 'c> {
    view: &'v CheapView<'c>,
    span: usize,
}

impl predicate::SpanLens for CheapLens<'_, '_> {
    fn name(&self) -> &str {
        self.view
            .name_col
            .str_at(self.span)
            .map(|s| s.as_ref())
            .unwrap_or("")
    }

    fn duration_nanos(&self) -> i64 {
        (self.view.ends[self.span] - self.view.starts[self.span]).max(0)
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u8(self.view.status_codes[self.span])
    }

    fn service_name(&self) -> &str {
        self.view
            .resource_service_col
            .str_at(self.view.resource_idx[self.span] as usize)
            .map(|s| s.as_ref())
            .unwrap_or("")
    }

    fn attribute(
        &self,
        key: &str,
    ) -> std::result::Result<Option<AttributeValue>, predicate::Unavailable> {
        match self.view.dedicated.iter().find(|(k, _)| k.as_ref() == key) {
            None => Err(predicate::Unavailable),
            Some((_, (present, values))) => {
                if present[self.span] == 0 {
                    // a dedicated column is authoritative for its key
                    return Ok(None);
                }
                Ok(Some(match values {
                    DedCheap::Str(col) => AttributeValue::Str(
                        col.str_at(self.span)
                            .map(Arc::clone)
                            .unwrap_or_else(|| "".into()),
                    ),
                    DedCheap::Int(v) => AttributeValue::Int(v[self.span]),
                }))
            }
        }
    }
}

impl<'c> CheapView<'c> {
    pub(crate) fn new(columns: &'c BTreeMap<String, Column>) -> Result<Self> {
        let trace_ids = fixed16(columns, names::TRACE_ID)?;
        let span_counts = u32s(columns, names::SPAN_COUNT)?;
        expect_len(names::SPAN_COUNT, span_counts.len(), trace_ids.len())?;
        let total_spans: usize = span_counts.iter().map(|c| *c as usize).sum();

        let mut dedicated = BTreeMap::new();
        for name in columns.keys() {
            let Some(key) = name.strip_prefix("ded_present:") else {
                continue;
            };
            let present = u8s(columns, name)?;
            expect_len(name, present.len(), total_spans)?;
            let value_name = names::dedicated_value(key);
            let value_column = get(columns, &value_name)?;
            expect_len(&value_name, value_column.len(), total_spans)?;
            let values = match value_column {
                Column::DictStr { .. } => DedCheap::Str(dict(columns, &value_name)?),
                Column::I64(v) => DedCheap::Int(v),
                _ => return WrongEncodingSnafu { name: value_name }.fail(),
            };
            dedicated.insert(Arc::from(key), (present, values));
        }

        let view = Self {
            trace_ids,
            span_counts,
            name_col: dict(columns, names::NAME)?,
            starts: i64s(columns, names::START)?,
            ends: i64s(columns, names::END)?,
            status_codes: u8s(columns, names::STATUS_CODE)?,
            resource_idx: u32s(columns, names::RESOURCE_IDX)?,
            resource_service_col: dict(columns, names::RESOURCE_SERVICE)?,
            dedicated,
        };
        expect_len(names::NAME, view.name_col.len(), total_spans)?;
        expect_len(names::START, view.starts.len(), total_spans)?;
        expect_len(names::END, view.ends.len(), total_spans)?;
        expect_len(names::STATUS_CODE, view.status_codes.len(), total_spans)?;
        expect_len(names::RESOURCE_IDX, view.resource_idx.len(), total_spans)?;
        Ok(view)
    }

    /// Evaluate the predicate over every span, aggregating to a per-trace
    /// verdict.
    pub(crate) fn evaluate(&self, predicate: &predicate::SpanPredicate) -> Vec<TraceVerdict> {
        let mut verdicts = Vec::with_capacity(self.trace_ids.len());
        let mut span = 0usize;
        for count in self.span_counts {
            let mut verdict = TraceVerdict::No;
            for s in span..span + *count as usize {
                match predicate.evaluate_partial(&CheapLens { view: self, span: s }) {
                    Some(true) => {
                        verdict = TraceVerdict::Match;
                        break;
                    }
                    None => verdict = TraceVerdict::Maybe,
                    Some(false) => {}
                }
            }
            verdicts.push(verdict);
            span += *count as usize;
        }
        verdicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::SpanBatch;
    use predicate::{CompareOp, Field, Scalar, SpanPredicate};

    fn trace(n: u8, spans: Vec<Span>) -> TraceRow {
        let mut row = TraceRow::new(TraceId::new([n; 16]));
        row.push_spans(
            &Resource {
                service_name: "svc-a".into(),
                attributes: vec![("region".into(), AttributeValue::Str("eu".into()))],
            },
            spans,
        );
        row
    }

    fn span(trace: u8, id: u8, attrs: Vec<(Arc<str>, AttributeValue)>) -> Span {
        Span {
            trace_id: TraceId::new([trace; 16]),
            span_id: SpanId::new([id; 8]),
            parent_span_id: (id > 1).then(|| SpanId::new([1; 8])),
            name: format!("op-{id}").into(),
            kind: SpanKind::Server,
            start_unix_nanos: 1_000,
            end_unix_nanos: 3_000,
            status: SpanStatus::default(),
            attributes: attrs,
            events: vec![],
            links: vec![],
        }
    }

    fn specs() -> Vec<DedicatedColumnSpec> {
        vec![
            DedicatedColumnSpec::int("http.status_code"),
            DedicatedColumnSpec::str("http.method"),
        ]
    }

    fn sample_traces() -> Vec<TraceRow> {
        vec![
            trace(
                1,
                vec![span(
                    1,
                    1,
                    vec![
                        ("custom".into(), AttributeValue::Double(1.5)),
                        ("http.method".into(), AttributeValue::Str("GET".into())),
                        ("http.status_code".into(), AttributeValue::Int(200)),
                    ],
                )],
            ),
            trace(
                2,
                vec![
                    span(
                        2,
                        1,
                        vec![("http.status_code".into(), AttributeValue::Int(500))],
                    ),
                    span(2, 2, vec![("flag".into(), AttributeValue::Bool(true))]),
                ],
            ),
        ]
    }

    #[test]
    fn columns_round_trip_traces() {
        let traces = sample_traces();
        let (columns, stats) = build_columns(&traces, &specs());

        assert_eq!(stats.trace_count, 2);
        assert_eq!(stats.span_count, 3);
        assert_eq!(stats.min_trace_id, TraceId::new([1; 16]));
        assert_eq!(stats.max_trace_id, TraceId::new([2; 16]));
        assert_eq!(stats.time_range, TimeRange::new(1_000, 3_000));
        assert_eq!(
            stats.dedicated_int_stats.get("http.status_code"),
            Some(&(200, 500))
        );

        let decoded = decode_traces(&columns).unwrap();
        assert_eq!(decoded, traces);
    }

    #[test]
    fn dedicated_extraction_leaves_generic_list_small() {
        let traces = sample_traces();
        let (columns, _) = build_columns(&traces, &specs());

        // only "custom" and "flag" remain generic
        match columns.get(names::ATTR_KEY).unwrap() {
            Column::DictStr { values, .. } => assert_eq!(values.len(), 2),
            _ => unreachable!(),
        }
    }

    #[test]
    fn cheap_view_verdicts() {
        let traces = sample_traces();
        let (columns, _) = build_columns(&traces, &specs());
        let view = CheapView::new(&columns).unwrap();

        // decidable: dedicated int column
        let p = SpanPredicate::Compare {
            field: Field::Attribute("http.status_code".into()),
            op: CompareOp::Eq,
            value: Scalar::Int(500),
        };
        assert_eq!(view.evaluate(&p), vec![TraceVerdict::No, TraceVerdict::Match]);

        // undecidable: generic attribute
        let p = SpanPredicate::Compare {
            field: Field::Attribute("flag".into()),
            op: CompareOp::Eq,
            value: Scalar::Bool(true),
        };
        assert_eq!(
            view.evaluate(&p),
            vec![TraceVerdict::Maybe, TraceVerdict::Maybe]
        );

        // intrinsic-only predicates are decidable
        let p = SpanPredicate::Compare {
            field: Field::ServiceName,
            op: CompareOp::Eq,
            value: Scalar::Str("svc-a".into()),
        };
        assert_eq!(
            view.evaluate(&p),
            vec![TraceVerdict::Match, TraceVerdict::Match]
        );
    }

    #[test]
    fn missing_column_is_reported() {
        let traces = sample_traces();
        let (mut columns, _) = build_columns(&traces, &[]);
        columns.remove(names::SPAN_ID);
        assert!(matches!(
            decode_traces(&columns),
            Err(Error::MissingColumn { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "sorted")]
    fn unsorted_input_is_rejected() {
        let traces = vec![
            trace(2, vec![span(2, 1, vec![])]),
            trace(1, vec![span(1, 1, vec![])]),
        ];
        build_columns(&traces, &[]);
    }
}
