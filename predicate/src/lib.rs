//! The parsed span-filter tree consumed by search.
//!
//! The surface query language and its parser live outside the core; queries
//! arrive here already parsed into a [`SpanPredicate`]. Evaluation is
//! two-phase: a cheap pass over hoisted and dedicated columns
//! ([`SpanPredicate::evaluate_partial`]), then a full pass including generic
//! attributes ([`SpanPredicate::evaluate`]) only where the cheap pass could
//! not decide.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{AttributeValue, Resource, Span, StatusCode};
use std::{collections::BTreeSet, sync::Arc};

/// A literal a field is compared against.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Scalar {
    Str(Arc<str>),
    Int(i64),
    Double(f64),
    Bool(bool),
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// The field a comparison reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Span operation name (hoisted column).
    Name,
    /// Span duration in nanoseconds (derived from hoisted times).
    DurationNanos,
    /// Span status code (hoisted column).
    Status,
    /// Resource service name (hoisted column).
    ServiceName,
    /// An arbitrary span attribute; may or may not have a dedicated column.
    Attribute(Arc<str>),
}

/// A parsed filter over spans. A trace matches if any of its spans matches.
#[derive(Debug, Clone, PartialEq)]
pub enum SpanPredicate {
    /// Matches every span.
    True,
    /// A single comparison.
    Compare {
        /// Field read.
        field: Field,
        /// Operator.
        op: CompareOp,
        /// Literal compared against.
        value: Scalar,
    },
    /// All children must match.
    And(Vec<SpanPredicate>),
    /// At least one child must match.
    Or(Vec<SpanPredicate>),
    /// Child must not match.
    Not(Box<SpanPredicate>),
}

/// Answers field lookups during evaluation.
///
/// `attribute` returns `Ok(None)` for "attribute not set on this span" and
/// `Err(Unavailable)` for "not loaded in this phase"; the distinction drives
/// three-valued partial evaluation.
pub trait SpanLens {
    /// Operation name.
    fn name(&self) -> &str;
    /// Duration in nanoseconds.
    fn duration_nanos(&self) -> i64;
    /// Status code.
    fn status(&self) -> StatusCode;
    /// Resource service name.
    fn service_name(&self) -> &str;
    /// Look up an attribute value; `Err(Unavailable)` if this phase cannot
    /// answer.
    fn attribute(&self, key: &str) -> Result<Option<AttributeValue>, Unavailable>;
}

/// Marker error: the lens cannot answer in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unavailable;

/// A complete lens over an in-memory span plus its resource.
#[derive(Debug, Clone, Copy)]
pub struct FullSpanLens<'a> {
    /// The span under evaluation.
    pub span: &'a Span,
    /// Its resource.
    pub resource: &'a Resource,
}

impl SpanLens for FullSpanLens<'_> {
    fn name(&self) -> &str {
        &self.span.name
    }

    fn duration_nanos(&self) -> i64 {
        self.span.duration_nanos()
    }

    fn status(&self) -> StatusCode {
        self.span.status.code
    }

    fn service_name(&self) -> &str {
        &self.resource.service_name
    }

    fn attribute(&self, key: &str) -> Result<Option<AttributeValue>, Unavailable> {
        Ok(self
            .span
            .attributes
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.clone()))
    }
}

fn compare_i64(op: CompareOp, lhs: i64, rhs: i64) -> bool {
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::NotEq => lhs != rhs,
        CompareOp::Lt => lhs < rhs,
        CompareOp::LtEq => lhs <= rhs,
        CompareOp::Gt => lhs > rhs,
        CompareOp::GtEq => lhs >= rhs,
    }
}

fn compare_f64(op: CompareOp, lhs: f64, rhs: f64) -> bool {
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::NotEq => lhs != rhs,
        CompareOp::Lt => lhs < rhs,
        CompareOp::LtEq => lhs <= rhs,
        CompareOp::Gt => lhs > rhs,
        CompareOp::GtEq => lhs >= rhs,
    }
}

fn compare_str(op: CompareOp, lhs: &str, rhs: &str) -> bool {
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::NotEq => lhs != rhs,
        CompareOp::Lt => lhs < rhs,
        CompareOp::LtEq => lhs <= rhs,
        CompareOp::Gt => lhs > rhs,
        CompareOp::GtEq => lhs >= rhs,
    }
}

/// Compare an attribute value against a literal. Numeric types compare
/// across int/double; any other type mismatch never matches.
fn compare_value(op: CompareOp, value: &AttributeValue, scalar: &Scalar) -> bool {
    match (value, scalar) {
        (AttributeValue::Str(v), Scalar::Str(s)) => compare_str(op, v, s),
        (AttributeValue::Int(v), Scalar::Int(s)) => compare_i64(op, *v, *s),
        (AttributeValue::Int(v), Scalar::Double(s)) => compare_f64(op, *v as f64, *s),
        (AttributeValue::Double(v), Scalar::Double(s)) => compare_f64(op, *v, *s),
        (AttributeValue::Double(v), Scalar::Int(s)) => compare_f64(op, *v, *s as f64),
        (AttributeValue::Bool(v), Scalar::Bool(s)) => match op {
            CompareOp::Eq => v == s,
            CompareOp::NotEq => v != s,
            _ => false,
        },
        _ => false,
    }
}

impl SpanPredicate {
    /// Evaluate against a complete lens.
    pub fn evaluate<L: SpanLens>(&self, lens: &L) -> bool {
        self.evaluate_partial(lens).unwrap_or(false)
    }

    /// Three-valued evaluation: `None` means the lens could not answer and
    /// the span needs the expensive phase.
    pub fn evaluate_partial<L: SpanLens>(&self, lens: &L) -> Option<bool> {
        match self {
            Self::True => Some(true),
            Self::Compare { field, op, value } => match field {
                Field::Name => Some(match value {
                    Scalar::Str(s) => compare_str(*op, lens.name(), s),
                    _ => false,
                }),
                Field::DurationNanos => Some(match value {
                    Scalar::Int(s) => compare_i64(*op, lens.duration_nanos(), *s),
                    Scalar::Double(s) => compare_f64(*op, lens.duration_nanos() as f64, *s),
                    _ => false,
                }),
                Field::Status => Some(match value {
                    Scalar::Int(s) => compare_i64(*op, lens.status().as_u8() as i64, *s),
                    Scalar::Str(s) => {
                        let name = match lens.status() {
                            StatusCode::Unset => "unset",
                            StatusCode::Ok => "ok",
                            StatusCode::Error => "error",
                        };
                        compare_str(*op, name, s)
                    }
                    _ => false,
                }),
                Field::ServiceName => Some(match value {
                    Scalar::Str(s) => compare_str(*op, lens.service_name(), s),
                    _ => false,
                }),
                Field::Attribute(key) => match lens.attribute(key) {
                    Err(Unavailable) => None,
                    Ok(None) => Some(false),
                    Ok(Some(v)) => Some(compare_value(*op, &v, value)),
                },
            },
            Self::And(children) => {
                let mut result = Some(true);
                for child in children {
                    match child.evaluate_partial(lens) {
                        Some(false) => return Some(false),
                        Some(true) => {}
                        None => result = None,
                    }
                }
                result
            }
            Self::Or(children) => {
                let mut result = Some(false);
                for child in children {
                    match child.evaluate_partial(lens) {
                        Some(true) => return Some(true),
                        Some(false) => {}
                        None => result = None,
                    }
                }
                result
            }
            Self::Not(child) => child.evaluate_partial(lens).map(|b| !b),
        }
    }

    /// Attribute keys the predicate reads, used to decide which columns a
    /// scan must load.
    pub fn referenced_attributes(&self) -> BTreeSet<Arc<str>> {
        let mut keys = BTreeSet::new();
        self.collect_attributes(&mut keys);
        keys
    }

    fn collect_attributes(&self, keys: &mut BTreeSet<Arc<str>>) {
        match self {
            Self::True => {}
            Self::Compare { field, .. } => {
                if let Field::Attribute(key) = field {
                    keys.insert(Arc::clone(key));
                }
            }
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_attributes(keys);
                }
            }
            Self::Not(child) => child.collect_attributes(keys),
        }
    }

    /// True if every attribute the predicate reads is in `available`; such a
    /// predicate is fully decidable by the cheap phase.
    pub fn decidable_with(&self, available: &BTreeSet<Arc<str>>) -> bool {
        self.referenced_attributes()
            .iter()
            .all(|k| available.contains(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{SpanId, SpanKind, SpanStatus, TraceId};

    fn span() -> Span {
        Span {
            trace_id: TraceId::new([1; 16]),
            span_id: SpanId::new([2; 8]),
            parent_span_id: None,
            name: "GET /users".into(),
            kind: SpanKind::Server,
            start_unix_nanos: 0,
            end_unix_nanos: 1_500,
            status: SpanStatus {
                code: StatusCode::Error,
                message: "".into(),
            },
            attributes: vec![
                ("http.status_code".into(), AttributeValue::Int(500)),
                ("http.method".into(), AttributeValue::Str("GET".into())),
            ],
            events: vec![],
            links: vec![],
        }
    }

    fn resource() -> Resource {
        Resource {
            service_name: "checkout".into(),
            attributes: vec![],
        }
    }

    fn attr_eq(key: &str, value: Scalar) -> SpanPredicate {
        SpanPredicate::Compare {
            field: Field::Attribute(key.into()),
            op: CompareOp::Eq,
            value,
        }
    }

    #[test]
    fn evaluates_intrinsics() {
        let span = span();
        let resource = resource();
        let lens = FullSpanLens {
            span: &span,
            resource: &resource,
        };

        let p = SpanPredicate::And(vec![
            SpanPredicate::Compare {
                field: Field::Name,
                op: CompareOp::Eq,
                value: Scalar::Str("GET /users".into()),
            },
            SpanPredicate::Compare {
                field: Field::DurationNanos,
                op: CompareOp::Gt,
                value: Scalar::Int(1_000),
            },
            SpanPredicate::Compare {
                field: Field::Status,
                op: CompareOp::Eq,
                value: Scalar::Str("error".into()),
            },
            SpanPredicate::Compare {
                field: Field::ServiceName,
                op: CompareOp::Eq,
                value: Scalar::Str("checkout".into()),
            },
        ]);
        assert!(p.evaluate(&lens));
    }

    #[test]
    fn evaluates_attributes_with_coercion() {
        let span = span();
        let resource = resource();
        let lens = FullSpanLens {
            span: &span,
            resource: &resource,
        };

        assert!(attr_eq("http.status_code", Scalar::Int(500)).evaluate(&lens));
        assert!(attr_eq("http.status_code", Scalar::Double(500.0)).evaluate(&lens));
        assert!(!attr_eq("http.status_code", Scalar::Str("500".into())).evaluate(&lens));
        // missing attribute never matches, and Not inverts that
        assert!(!attr_eq("missing", Scalar::Int(1)).evaluate(&lens));
        assert!(
            SpanPredicate::Not(Box::new(attr_eq("missing", Scalar::Int(1)))).evaluate(&lens)
        );
    }

    /// Lens that can only answer attributes in an allow-list.
    struct CheapLens<'a> {
        inner: FullSpanLens<'a>,
        available: BTreeSet<Arc<str>>,
    }

    impl SpanLens for CheapLens<'_> {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn duration_nanos(&self) -> i64 {
            self.inner.duration_nanos()
        }
        fn status(&self) -> StatusCode {
            self.inner.status()
        }
        fn service_name(&self) -> &str {
            self.inner.service_name()
        }
        fn attribute(&self, key: &str) -> Result<Option<AttributeValue>, Unavailable> {
            if self.available.iter().any(|k| k.as_ref() == key) {
                self.inner.attribute(key)
            } else {
                Err(Unavailable)
            }
        }
    }

    #[test]
    fn partial_evaluation_short_circuits() {
        let span = span();
        let resource = resource();
        let lens = CheapLens {
            inner: FullSpanLens {
                span: &span,
                resource: &resource,
            },
            available: ["http.status_code"].iter().map(|s| Arc::from(*s)).collect(),
        };

        // decidable: only touches an available attribute
        assert_eq!(
            attr_eq("http.status_code", Scalar::Int(500)).evaluate_partial(&lens),
            Some(true)
        );

        // undecidable on its own
        let unavailable = attr_eq("http.method", Scalar::Str("GET".into()));
        assert_eq!(unavailable.evaluate_partial(&lens), None);

        // AND short-circuits on a definite false even when another child is
        // unavailable
        let p = SpanPredicate::And(vec![
            attr_eq("http.status_code", Scalar::Int(404)),
            unavailable.clone(),
        ]);
        assert_eq!(p.evaluate_partial(&lens), Some(false));

        // OR short-circuits on a definite true
        let p = SpanPredicate::Or(vec![
            attr_eq("http.status_code", Scalar::Int(500)),
            unavailable,
        ]);
        assert_eq!(p.evaluate_partial(&lens), Some(true));
    }

    #[test]
    fn referenced_attributes_collects_nested() {
        let p = SpanPredicate::Or(vec![
            SpanPredicate::Not(Box::new(attr_eq("a", Scalar::Int(1)))),
            SpanPredicate::And(vec![
                attr_eq("b", Scalar::Int(2)),
                SpanPredicate::Compare {
                    field: Field::Name,
                    op: CompareOp::Eq,
                    value: Scalar::Str("x".into()),
                },
            ]),
        ]);
        let keys = p.referenced_attributes();
        assert_eq!(
            keys.iter().map(|k| k.as_ref()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(p.decidable_with(&keys));
        assert!(!p.decidable_with(&BTreeSet::new()));
    }
}
