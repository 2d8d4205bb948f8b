//! The monolithic binary's HTTP surface: ingest plus the query routes.

use crate::wiring::AllInOne;
use data_types::{ErrorCode, TenantId};
use hyper::{Body, Method, Request, Response, StatusCode};
use observability_deps::tracing::debug;
use prost::Message;
use query_frontend::http::{MatchAllParser, QueryHttp, TENANT_HEADER};
use std::sync::Arc;

/// Routes requests to ingest or query handling.
#[derive(Debug, Clone)]
pub struct Api {
    distributor: Arc<distributor::Distributor>,
    query: QueryHttp,
}

fn error_response(status: StatusCode, code: ErrorCode, message: String) -> Response<Body> {
    let body = serde_json::json!({ "code": code.as_str(), "message": message });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("response builds")
}

impl Api {
    /// Build the API over an assembled process.
    pub fn new(all: &AllInOne) -> Self {
        Self {
            distributor: Arc::clone(&all.distributor),
            query: QueryHttp::new(all.frontend.clone(), Arc::new(MatchAllParser)),
        }
    }

    /// Dispatch one request.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match (req.method(), req.uri().path()) {
            (&Method::POST, "/ingest") => self.handle_ingest(req).await,
            _ => self.query.handle(req).await,
        }
    }

    /// Accept one protobuf-encoded batch, replicate it, and acknowledge on
    /// quorum.
    async fn handle_ingest(&self, req: Request<Body>) -> Response<Body> {
        let tenant = req
            .headers()
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let tenant = match TenantId::new(tenant) {
            Ok(tenant) => tenant,
            Err(e) => {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    ErrorCode::Validation,
                    format!("missing or invalid tenant: {e}"),
                )
            }
        };

        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::Validation,
                    format!("cannot read request body: {e}"),
                )
            }
        };
        let batch = match wire_types::EncodedBatch::decode(body.as_ref())
            .map_err(|e| e.to_string())
            .and_then(|encoded| wire_types::decode_batch(&encoded).map_err(|e| e.to_string()))
        {
            Ok(batch) => batch,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::Validation,
                    format!("malformed batch: {e}"),
                )
            }
        };

        debug!(tenant=%tenant, spans=batch.spans.len(), "http ingest");
        match self.distributor.write(&tenant, batch).await {
            Ok(summary) => {
                let body = serde_json::json!({
                    "accepted": summary.spans_accepted,
                    "dropped": summary.spans_dropped,
                });
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("response builds")
            }
            Err(e) => {
                let status = match e.code() {
                    ErrorCode::Validation => StatusCode::BAD_REQUEST,
                    ErrorCode::Capacity => StatusCode::TOO_MANY_REQUESTS,
                    _ => StatusCode::SERVICE_UNAVAILABLE,
                };
                error_response(status, e.code(), e.to_string())
            }
        }
    }
}
