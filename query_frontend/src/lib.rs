//! The query frontend: splits queries into sub-requests, queues them with
//! per-tenant fairness, streams them to pulling queriers, and merges the
//! replies.
//!
//! Queriers pull over a long-lived connection, so backpressure is natural:
//! a slow querier simply pulls less. A failed sub-request is retried on a
//! different querier up to `max_retries` times; exhausted shards make the
//! response partial (or fail it, per request policy).
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{TenantId, TimeRange, TraceId, TraceRow, TraceSummary};
use metric::{Metric, U64Counter, U64Gauge};
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use predicate::SpanPredicate;
use querier::{ShardSelector, SubQueryResult};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

pub mod http;
pub mod worker;

/// Frontend knobs.
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Sub-requests per trace-by-id query.
    pub trace_shards: u32,
    /// Block-space shards per search time window.
    pub search_shards: u32,
    /// Length of one search time window.
    pub search_window: Duration,
    /// Upper bound on windows per search (window length is stretched when
    /// the range is longer).
    pub max_search_windows: u32,
    /// Retries per sub-request, each on a different querier.
    pub max_retries: usize,
    /// Hard deadline for a whole query.
    pub query_timeout: Duration,
    /// If false, a query with failed shards returns an error instead of a
    /// partial result. Per-request overrides win.
    pub allow_partial: bool,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            trace_shards: 4,
            search_shards: 4,
            search_window: Duration::from_secs(3600),
            max_search_windows: 16,
            max_retries: 2,
            query_timeout: Duration::from_secs(30),
            allow_partial: true,
        }
    }
}

/// One sub-request as executed by a querier.
#[derive(Debug, Clone)]
pub enum SubQuery {
    /// Point lookup of one shard's candidate blocks (plus ingesters on
    /// shard 0).
    TraceById {
        /// The trace.
        trace_id: TraceId,
        /// The shard.
        shard: ShardSelector,
    },
    /// Filter scan of one time window and block shard.
    Search {
        /// The parsed filter.
        predicate: Arc<SpanPredicate>,
        /// The window.
        time_range: TimeRange,
        /// The shard.
        shard: ShardSelector,
        /// Per-sub-query trace cap.
        limit: usize,
    },
}

/// Reply of one sub-request attempt.
pub type SubReply = Result<SubQueryResult, String>;

/// A sub-request handed to a pulling querier.
#[derive(Debug)]
pub struct PulledRequest {
    /// The tenant being queried.
    pub tenant: TenantId,
    /// What to execute.
    pub query: SubQuery,
    /// Cooperative cancellation; set once the caller has enough results.
    pub cancel: CancellationToken,
    responder: oneshot::Sender<(String, SubReply)>,
}

impl PulledRequest {
    /// Send the attempt's outcome back to the frontend.
    pub fn respond(self, worker: &str, reply: SubReply) {
        // the collector may have given up (timeout); that's fine
        let _ = self.responder.send((worker.to_string(), reply));
    }
}

#[derive(Debug)]
struct QueuedRequest {
    tenant: TenantId,
    query: SubQuery,
    cancel: CancellationToken,
    excluded_workers: Vec<String>,
    responder: oneshot::Sender<(String, SubReply)>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Round-robin order over tenants with queued work.
    order: VecDeque<TenantId>,
    queues: HashMap<TenantId, VecDeque<QueuedRequest>>,
    depth: usize,
}

struct Inner {
    config: FrontendConfig,
    queue: Mutex<QueueState>,
    queue_notify: Notify,
    /// Workers that have pulled at least once; drives retry placement.
    known_workers: Mutex<std::collections::BTreeSet<String>>,
    queue_depth: Metric<U64Gauge>,
    retry_count: Metric<U64Counter>,
    query_count: Metric<U64Counter>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFrontend")
            .field("config", &self.config)
            .finish()
    }
}

/// The frontend of one process. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueryFrontend {
    inner: Arc<Inner>,
}

/// Result of a trace-by-id query.
#[derive(Debug)]
pub struct TraceByIdResponse {
    /// The deduplicated union of all spans found, grouped by resource.
    pub trace: Option<TraceRow>,
    /// True if some shard failed or timed out.
    pub partial: bool,
    /// Indexes of the shards that failed after retries.
    pub failed_shards: Vec<u32>,
}

/// Result of a search query.
#[derive(Debug)]
pub struct SearchResponse {
    /// Matching trace summaries, most recent first.
    pub summaries: Vec<TraceSummary>,
    /// True if some shard failed, timed out, or was cancelled early.
    pub partial: bool,
}

/// A query failed hard (partial results disallowed by policy).
#[derive(Debug, thiserror::Error)]
#[error("{failed} of {total} sub-queries failed and partial results are disallowed")]
pub struct QueryFailed {
    /// Failed sub-query count.
    pub failed: usize,
    /// Total sub-query count.
    pub total: usize,
}

impl QueryFrontend {
    /// Create a frontend.
    pub fn new(config: FrontendConfig, metric_registry: &metric::Registry) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queue: Mutex::new(QueueState::default()),
                queue_notify: Notify::new(),
                known_workers: Mutex::new(Default::default()),
                queue_depth: metric_registry
                    .register_metric("frontend_queue_depth", "queued sub-requests"),
                retry_count: metric_registry
                    .register_metric("frontend_sub_request_retries", "sub-request retries"),
                query_count: metric_registry
                    .register_metric("frontend_query_count", "queries by kind and outcome"),
            }),
        }
    }

    /// The configured knobs.
    pub fn config(&self) -> &FrontendConfig {
        &self.inner.config
    }

    fn enqueue(&self, request: QueuedRequest) {
        let mut state = self.inner.queue.lock();
        if !state.queues.contains_key(&request.tenant) {
            state.order.push_back(request.tenant.clone());
        }
        let tenant = request.tenant.clone();
        state.queues.entry(tenant).or_default().push_back(request);
        state.depth += 1;
        self.inner
            .queue_depth
            .recorder(metric::Attributes::default())
            .set(state.depth as u64);
        drop(state);
        self.inner.queue_notify.notify_waiters();
    }

    fn try_pull(&self, worker: &str) -> Option<PulledRequest> {
        let worker_count = self.inner.known_workers.lock().len();
        let mut state = self.inner.queue.lock();

        // Exclusion is soft: a retry avoids workers that already failed it,
        // unless every known worker failed it, in which case anyone may
        // take it (a lone querier must still be able to retry).
        let eligible_for = |request: &QueuedRequest| {
            !request.excluded_workers.iter().any(|w| w == worker)
                || request.excluded_workers.len() >= worker_count
        };

        // round-robin over tenants: take from the first tenant that has an
        // eligible request, then rotate that tenant to the back
        for _ in 0..state.order.len() {
            let tenant = state.order.pop_front()?;
            let queue = state.queues.get_mut(&tenant).expect("queued tenant");

            let eligible = queue.iter().position(eligible_for);
            if let Some(index) = eligible {
                let request = queue.remove(index).expect("index in bounds");
                if queue.is_empty() {
                    state.queues.remove(&tenant);
                } else {
                    state.order.push_back(tenant);
                }
                state.depth -= 1;
                self.inner
                    .queue_depth
                    .recorder(metric::Attributes::default())
                    .set(state.depth as u64);
                return Some(PulledRequest {
                    tenant: request.tenant,
                    query: request.query,
                    cancel: request.cancel,
                    responder: request.responder,
                });
            }
            // nothing eligible for this worker here; keep the tenant queued
            state.order.push_back(tenant);
        }
        None
    }

    /// Pull the next sub-request, waiting until one is available. `None`
    /// once `shutdown` fires.
    pub async fn next_sub_request(
        &self,
        worker: &str,
        shutdown: &CancellationToken,
    ) -> Option<PulledRequest> {
        self.inner
            .known_workers
            .lock()
            .insert(worker.to_string());
        loop {
            if let Some(request) = self.try_pull(worker) {
                return Some(request);
            }
            tokio::select! {
                _ = self.inner.queue_notify.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Run one sub-query to completion, retrying failed attempts on other
    /// workers. Returns the final reply.
    async fn drive_sub_query(
        &self,
        tenant: TenantId,
        query: SubQuery,
        cancel: CancellationToken,
    ) -> SubReply {
        let mut excluded_workers: Vec<String> = vec![];
        for attempt in 0..=self.inner.config.max_retries {
            let (responder, reply) = oneshot::channel();
            self.enqueue(QueuedRequest {
                tenant: tenant.clone(),
                query: query.clone(),
                cancel: cancel.clone(),
                excluded_workers: excluded_workers.clone(),
                responder,
            });

            match reply.await {
                Ok((_, Ok(result))) => return Ok(result),
                Ok((worker, Err(e))) => {
                    warn!(
                        tenant=%tenant,
                        %worker,
                        attempt,
                        error=%e,
                        "sub-request failed"
                    );
                    self.inner
                        .retry_count
                        .recorder(metric::Attributes::default())
                        .inc(1);
                    excluded_workers.push(worker);
                }
                // responder dropped without reply: treat as worker loss
                Err(_) => {
                    self.inner
                        .retry_count
                        .recorder(metric::Attributes::default())
                        .inc(1);
                }
            }
        }
        Err("retries exhausted".to_string())
    }

    /// Point lookup: fan out over the trace-id space, merge span sets,
    /// dedup.
    pub async fn trace_by_id(
        &self,
        tenant: &TenantId,
        trace_id: TraceId,
    ) -> Result<TraceByIdResponse, QueryFailed> {
        let total = self.inner.config.trace_shards.max(1);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(total as usize);

        for index in 0..total {
            let this = self.clone();
            let tenant = tenant.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let reply = this
                    .drive_sub_query(
                        tenant,
                        SubQuery::TraceById {
                            trace_id,
                            shard: ShardSelector { index, total },
                        },
                        cancel,
                    )
                    .await;
                let _ = tx.send((index, reply)).await;
            });
        }
        drop(tx);

        let mut merged: Option<TraceRow> = None;
        let mut partial = false;
        let mut failed_shards = vec![];
        let deadline = tokio::time::sleep(self.inner.config.query_timeout);
        tokio::pin!(deadline);
        let mut outstanding = total;
        while outstanding > 0 {
            tokio::select! {
                reply = rx.recv() => {
                    let Some((index, reply)) = reply else { break };
                    outstanding -= 1;
                    match reply {
                        Ok(result) => {
                            partial |= result.partial;
                            for row in result.traces {
                                match &mut merged {
                                    Some(existing) => existing.merge(row),
                                    None => merged = Some(row),
                                }
                            }
                        }
                        Err(_) => {
                            partial = true;
                            failed_shards.push(index);
                        }
                    }
                }
                _ = &mut deadline => {
                    partial = true;
                    cancel.cancel();
                    break;
                }
            }
        }
        cancel.cancel();

        let outcome = if partial { "partial" } else { "ok" };
        self.inner
            .query_count
            .recorder(&[("kind", "trace_by_id"), ("outcome", outcome)])
            .inc(1);

        if partial && !self.inner.config.allow_partial {
            return Err(QueryFailed {
                failed: failed_shards.len().max(1),
                total: total as usize,
            });
        }
        failed_shards.sort_unstable();
        Ok(TraceByIdResponse {
            trace: merged,
            partial,
            failed_shards,
        })
    }

    fn search_windows(&self, time_range: TimeRange) -> Vec<TimeRange> {
        let span = (time_range.max - time_range.min).max(0) as u128 + 1;
        let window_nanos =
            (self.inner.config.search_window.as_nanos()).max(1);
        let window_count = span.div_ceil(window_nanos);
        let window_nanos = if window_count > self.inner.config.max_search_windows as u128 {
            span.div_ceil(self.inner.config.max_search_windows as u128)
        } else {
            window_nanos
        } as i64;

        let mut windows = vec![];
        let mut start = time_range.min;
        while start <= time_range.max {
            let end = start.saturating_add(window_nanos - 1).min(time_range.max);
            windows.push(TimeRange::new(start, end));
            if end == time_range.max {
                break;
            }
            start = end + 1;
        }
        windows
    }

    /// Search: fan out over time windows and block shards, stream summaries
    /// into `results` as sub-queries finish, cancel the rest once `limit`
    /// distinct traces arrived.
    pub async fn search_streaming(
        &self,
        tenant: &TenantId,
        predicate: Arc<SpanPredicate>,
        time_range: TimeRange,
        limit: usize,
        results: mpsc::Sender<TraceSummary>,
    ) -> Result<bool, QueryFailed> {
        let shards = self.inner.config.search_shards.max(1);
        let windows = self.search_windows(time_range);
        let total = windows.len() * shards as usize;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(total.max(1));

        for window in &windows {
            for index in 0..shards {
                let this = self.clone();
                let tenant = tenant.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                let predicate = Arc::clone(&predicate);
                let window = *window;
                tokio::spawn(async move {
                    let reply = this
                        .drive_sub_query(
                            tenant,
                            SubQuery::Search {
                                predicate,
                                time_range: window,
                                shard: ShardSelector {
                                    index,
                                    total: shards,
                                },
                                limit,
                            },
                            cancel,
                        )
                        .await;
                    let _ = tx.send(reply).await;
                });
            }
        }
        drop(tx);

        let mut seen: HashMap<TraceId, TraceRow> = HashMap::new();
        let mut partial = false;
        let mut failed = 0usize;
        let deadline = tokio::time::sleep(self.inner.config.query_timeout);
        tokio::pin!(deadline);
        let mut outstanding = total;
        'collect: while outstanding > 0 {
            tokio::select! {
                reply = rx.recv() => {
                    let Some(reply) = reply else { break };
                    outstanding -= 1;
                    match reply {
                        Ok(result) => {
                            partial |= result.partial;
                            for row in result.traces {
                                match seen.get_mut(&row.trace_id) {
                                    Some(existing) => {
                                        existing.merge(row);
                                        continue;
                                    }
                                    None => {
                                        let summary = row.summary();
                                        seen.insert(row.trace_id, row);
                                        if results.send(summary).await.is_err() {
                                            // caller hung up; stop all work
                                            cancel.cancel();
                                            break 'collect;
                                        }
                                    }
                                }
                                if seen.len() >= limit {
                                    debug!(limit, "search limit reached, cancelling sub-queries");
                                    cancel.cancel();
                                    break 'collect;
                                }
                            }
                        }
                        Err(_) => {
                            partial = true;
                            failed += 1;
                        }
                    }
                }
                _ = &mut deadline => {
                    partial = true;
                    cancel.cancel();
                    break;
                }
            }
        }
        cancel.cancel();

        let outcome = if partial { "partial" } else { "ok" };
        self.inner
            .query_count
            .recorder(&[("kind", "search"), ("outcome", outcome)])
            .inc(1);

        if partial && !self.inner.config.allow_partial {
            return Err(QueryFailed { failed, total });
        }
        Ok(partial)
    }

    /// Collecting variant of [`search_streaming`](Self::search_streaming).
    pub async fn search(
        &self,
        tenant: &TenantId,
        predicate: Arc<SpanPredicate>,
        time_range: TimeRange,
        limit: usize,
    ) -> Result<SearchResponse, QueryFailed> {
        let (tx, mut rx) = mpsc::channel(limit.max(1));
        let collector = tokio::spawn(async move {
            let mut summaries = vec![];
            while let Some(summary) = rx.recv().await {
                summaries.push(summary);
            }
            summaries
        });

        let partial = self
            .search_streaming(tenant, predicate, time_range, limit, tx)
            .await?;
        let mut summaries = collector.await.expect("collector never panics");
        summaries.sort_by_key(|s| std::cmp::Reverse(s.start_unix_nanos));
        Ok(SearchResponse { summaries, partial })
    }
}
