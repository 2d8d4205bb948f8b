//! The querier side of the frontend queue: a pull loop executing
//! sub-requests.

use crate::{QueryFrontend, SubQuery};
use observability_deps::tracing::{debug, info};
use querier::Querier;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pull sub-requests and execute them against `querier` until shutdown.
///
/// The pull model is the backpressure mechanism: this loop only takes a new
/// sub-request once the previous one finished.
pub async fn run_querier_worker(
    frontend: QueryFrontend,
    querier: Arc<Querier>,
    worker_id: String,
    shutdown: CancellationToken,
) {
    info!(worker=%worker_id, "querier worker attached to frontend");
    while let Some(request) = frontend.next_sub_request(&worker_id, &shutdown).await {
        // a cancelled request still gets a reply so the collector can
        // account for it; execution short-circuits on the token
        let reply = match &request.query {
            SubQuery::TraceById { trace_id, shard } => querier
                .trace_by_id(&request.tenant, trace_id, *shard)
                .await
                .map_err(|e| e.to_string()),
            SubQuery::Search {
                predicate,
                time_range,
                shard,
                limit,
            } => querier
                .search(
                    &request.tenant,
                    predicate,
                    *time_range,
                    *shard,
                    *limit,
                    &request.cancel,
                )
                .await
                .map_err(|e| e.to_string()),
        };
        debug!(worker=%worker_id, ok=reply.is_ok(), "sub-request executed");
        request.respond(&worker_id, reply);
    }
    info!(worker=%worker_id, "querier worker detached");
}
