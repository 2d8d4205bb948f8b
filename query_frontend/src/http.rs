//! The HTTP query surface: `GET /traces/{id}` and `GET /search`.
//!
//! The surface query language itself is parsed by an external collaborator
//! plugged in as a [`TraceQlParser`]; everything here works on the parsed
//! tree. The tenant is conveyed by the `x-tenant-id` header.

use crate::{QueryFrontend, TraceByIdResponse};
use data_types::{
    AttributeValue, ErrorCode, SpanBatch, TenantId, TimeRange, TraceId, TraceRow,
};
use hyper::{Body, Method, Request, Response, StatusCode};
use observability_deps::tracing::debug;
use predicate::SpanPredicate;
use std::{collections::HashMap, fmt::Debug, sync::Arc};

/// Header carrying the tenant name.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Parses the surface filter language into the core's predicate tree.
pub trait TraceQlParser: Debug + Send + Sync {
    /// Parse `q`. An empty string must yield the match-all predicate.
    fn parse(&self, q: &str) -> Result<SpanPredicate, String>;
}

/// Parser stub accepting only the empty query (match everything). Real
/// deployments plug in the actual language parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchAllParser;

impl TraceQlParser for MatchAllParser {
    fn parse(&self, q: &str) -> Result<SpanPredicate, String> {
        if q.trim().is_empty() {
            Ok(SpanPredicate::True)
        } else {
            Err("this build has no query language parser".to_string())
        }
    }
}

/// Machine-readable error envelope.
#[derive(Debug, serde::Serialize)]
struct ErrorBody {
    code: ErrorCode,
    message: String,
}

fn error_response(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Response<Body> {
    let body = serde_json::to_vec(&ErrorBody {
        code,
        message: message.into(),
    })
    .expect("error body serializes");
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("response builds")
}

fn json_response(value: &impl serde::Serialize) -> Response<Body> {
    let body = serde_json::to_vec(value).expect("response serializes");
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("response builds")
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct AttributeDto {
    key: String,
    #[serde(flatten)]
    value: AttributeValueDto,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
enum AttributeValueDto {
    #[serde(rename = "stringValue")]
    Str(String),
    #[serde(rename = "intValue")]
    Int(i64),
    #[serde(rename = "doubleValue")]
    Double(f64),
    #[serde(rename = "boolValue")]
    Bool(bool),
    /// Hex-encoded.
    #[serde(rename = "bytesValue")]
    Bytes(String),
    #[serde(rename = "jsonValue")]
    Json(String),
}

fn attribute_dtos(attributes: &[(Arc<str>, AttributeValue)]) -> Vec<AttributeDto> {
    attributes
        .iter()
        .map(|(key, value)| AttributeDto {
            key: key.to_string(),
            value: match value {
                AttributeValue::Str(s) => AttributeValueDto::Str(s.to_string()),
                AttributeValue::Int(v) => AttributeValueDto::Int(*v),
                AttributeValue::Double(v) => AttributeValueDto::Double(*v),
                AttributeValue::Bool(v) => AttributeValueDto::Bool(*v),
                AttributeValue::Bytes(b) => {
                    AttributeValueDto::Bytes(b.iter().map(|x| format!("{x:02x}")).collect())
                }
                AttributeValue::Json(s) => AttributeValueDto::Json(s.to_string()),
            },
        })
        .collect()
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct SpanDto {
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: String,
    kind: u8,
    start_unix_nanos: i64,
    end_unix_nanos: i64,
    status_code: u8,
    #[serde(skip_serializing_if = "String::is_empty")]
    status_message: String,
    attributes: Vec<AttributeDto>,
    event_count: usize,
    link_count: usize,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpansDto {
    service_name: String,
    resource_attributes: Vec<AttributeDto>,
    spans: Vec<SpanDto>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceDto {
    trace_id: String,
    resource_spans: Vec<ResourceSpansDto>,
    partial: bool,
    failed_shards: Vec<u32>,
}

fn batch_dto(batch: &SpanBatch) -> ResourceSpansDto {
    ResourceSpansDto {
        service_name: batch.resource.service_name.to_string(),
        resource_attributes: attribute_dtos(&batch.resource.attributes),
        spans: batch
            .spans
            .iter()
            .map(|span| SpanDto {
                span_id: span.span_id.to_string(),
                parent_span_id: span.parent_span_id.map(|id| id.to_string()),
                name: span.name.to_string(),
                kind: span.kind.as_u8(),
                start_unix_nanos: span.start_unix_nanos,
                end_unix_nanos: span.end_unix_nanos,
                status_code: span.status.code.as_u8(),
                status_message: span.status.message.to_string(),
                attributes: attribute_dtos(&span.attributes),
                event_count: span.events.len(),
                link_count: span.links.len(),
            })
            .collect(),
    }
}

fn trace_dto(trace_id: TraceId, response: &TraceByIdResponse) -> TraceDto {
    let empty = TraceRow::new(trace_id);
    let row = response.trace.as_ref().unwrap_or(&empty);
    TraceDto {
        trace_id: trace_id.to_string(),
        resource_spans: row.batches.iter().map(batch_dto).collect(),
        partial: response.partial,
        failed_shards: response.failed_shards.clone(),
    }
}

fn tenant_from(req: &Request<Body>) -> Result<TenantId, Response<Body>> {
    let value = req
        .headers()
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    TenantId::new(value.to_string()).map_err(|e| {
        error_response(
            StatusCode::UNAUTHORIZED,
            ErrorCode::Validation,
            format!("missing or invalid tenant: {e}"),
        )
    })
}

fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| {
            serde_urlencoded::from_str::<Vec<(String, String)>>(q)
                .unwrap_or_default()
                .into_iter()
                .collect()
        })
        .unwrap_or_default()
}

/// The query API of one frontend process.
#[derive(Debug, Clone)]
pub struct QueryHttp {
    frontend: QueryFrontend,
    parser: Arc<dyn TraceQlParser>,
}

impl QueryHttp {
    /// Wire the HTTP surface to a frontend and a language parser.
    pub fn new(frontend: QueryFrontend, parser: Arc<dyn TraceQlParser>) -> Self {
        Self { frontend, parser }
    }

    /// Dispatch one request.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        match (req.method(), path.as_str()) {
            (&Method::GET, path) if path.starts_with("/traces/") => {
                self.handle_trace_by_id(req, path.trim_start_matches("/traces/"))
                    .await
            }
            (&Method::GET, "/search") => self.handle_search(req).await,
            _ => error_response(
                StatusCode::NOT_FOUND,
                ErrorCode::Validation,
                "unknown route",
            ),
        }
    }

    async fn handle_trace_by_id(&self, req: Request<Body>, raw_id: &str) -> Response<Body> {
        let tenant = match tenant_from(&req) {
            Ok(tenant) => tenant,
            Err(response) => return response,
        };
        // ids are 32 lowercase hex chars
        let trace_id: TraceId = match raw_id.parse() {
            Ok(id) => id,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::Validation,
                    format!("invalid trace id: {e}"),
                )
            }
        };

        debug!(tenant=%tenant, %trace_id, "http trace-by-id");
        match self.frontend.trace_by_id(&tenant, trace_id).await {
            Ok(response) if response.trace.is_none() && !response.partial => error_response(
                StatusCode::NOT_FOUND,
                ErrorCode::Validation,
                "trace not found",
            ),
            Ok(response) => json_response(&trace_dto(trace_id, &response)),
            Err(e) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Transient,
                e.to_string(),
            ),
        }
    }

    async fn handle_search(&self, req: Request<Body>) -> Response<Body> {
        let tenant = match tenant_from(&req) {
            Ok(tenant) => tenant,
            Err(response) => return response,
        };
        let params = query_params(&req);

        let predicate = match self.parser.parse(params.get("q").map(String::as_str).unwrap_or(""))
        {
            Ok(predicate) => predicate,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::Validation,
                    format!("query parse error: {e}"),
                )
            }
        };
        let parse_i64 = |key: &str, default: i64| {
            params
                .get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(default)
        };
        let start = parse_i64("start", i64::MIN);
        let end = parse_i64("end", i64::MAX);
        let limit = params
            .get("limit")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(20)
            .max(1);

        debug!(tenant=%tenant, limit, "http search");
        match self
            .frontend
            .search(
                &tenant,
                Arc::new(predicate),
                TimeRange::new(start, end),
                limit,
            )
            .await
        {
            Ok(response) => {
                #[derive(Debug, serde::Serialize)]
                #[serde(rename_all = "camelCase")]
                struct SearchDto<'a> {
                    traces: &'a [data_types::TraceSummary],
                    partial: bool,
                }
                json_response(&SearchDto {
                    traces: &response.summaries,
                    partial: response.partial,
                })
            }
            Err(e) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Transient,
                e.to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrontendConfig;

    fn http() -> QueryHttp {
        let registry = metric::Registry::new();
        let frontend = QueryFrontend::new(
            FrontendConfig {
                query_timeout: std::time::Duration::from_millis(200),
                ..FrontendConfig::default()
            },
            &registry,
        );
        QueryHttp::new(frontend, Arc::new(MatchAllParser))
    }

    fn request(path: &str, tenant: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn missing_tenant_is_unauthorized() {
        let response = http()
            .handle(request(
                "/traces/0123456789abcdef0123456789abcdef",
                None,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_trace_id_is_bad_request() {
        let response = http().handle(request("/traces/zzz", Some("t1"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "validation");
    }

    #[tokio::test]
    async fn unparseable_query_is_bad_request() {
        let response = http()
            .handle(request("/search?q=%7B+broken", Some("t1")))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = http().handle(request("/nope", Some("t1"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn attribute_dtos_cover_all_variants() {
        let attributes: Vec<(Arc<str>, AttributeValue)> = vec![
            ("s".into(), AttributeValue::Str("x".into())),
            ("i".into(), AttributeValue::Int(-1)),
            ("d".into(), AttributeValue::Double(2.5)),
            ("b".into(), AttributeValue::Bool(true)),
            ("y".into(), AttributeValue::Bytes(vec![0xde, 0xad].into())),
            ("j".into(), AttributeValue::Json("[1]".into())),
        ];
        let dtos = attribute_dtos(&attributes);
        let json = serde_json::to_value(&dtos).unwrap();
        assert_eq!(json[4]["bytesValue"], "dead");
        assert_eq!(json[1]["intValue"], -1);
    }
}
