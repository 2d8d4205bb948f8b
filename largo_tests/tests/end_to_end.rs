//! End-to-end scenarios over the in-process cluster.

use data_types::{SpanId, TimeRange, TraceRow};
use largo_tests::util::{batch_of, span, span_batch, tenant, trace_id};
use largo_tests::{TestCluster, TestClusterConfig};
use predicate::{CompareOp, Field, Scalar, SpanPredicate};
use std::{collections::BTreeSet, sync::Arc};

fn span_ids(row: &TraceRow) -> BTreeSet<SpanId> {
    row.batches
        .iter()
        .flat_map(|b| b.spans.iter().map(|s| s.span_id))
        .collect()
}

/// Ingest one span, query it back immediately and completely.
#[tokio::test]
async fn single_span_trace() {
    let cluster = TestCluster::new(TestClusterConfig::default());
    let id = trace_id(1);

    cluster
        .distributor
        .write(&tenant(), span_batch(id, 1, 200))
        .await
        .unwrap();

    let response = cluster.frontend.trace_by_id(&tenant(), id).await.unwrap();
    assert!(!response.partial);
    assert!(response.failed_shards.is_empty());
    let row = response.trace.expect("trace found");
    assert_eq!(row.span_count(), 1);
}

/// Kill one of three replicas mid-trace; the remaining replicas answer with
/// every span exactly once.
#[tokio::test]
async fn ingester_failure_mid_trace() {
    let cluster = TestCluster::new(TestClusterConfig {
        ingesters: 3,
        replication_factor: 3,
        ..TestClusterConfig::default()
    });
    let id = trace_id(7);

    cluster
        .distributor
        .write(&tenant(), span_batch(id, 1, 200))
        .await
        .unwrap();
    cluster
        .distributor
        .write(&tenant(), span_batch(id, 2, 200))
        .await
        .unwrap();

    cluster.kill_ingester(0);

    cluster
        .distributor
        .write(&tenant(), span_batch(id, 3, 200))
        .await
        .unwrap();
    cluster
        .distributor
        .write(&tenant(), span_batch(id, 4, 200))
        .await
        .unwrap();

    let response = cluster.frontend.trace_by_id(&tenant(), id).await.unwrap();
    let row = response.trace.expect("trace found");
    assert_eq!(
        span_ids(&row),
        (1..=4u64)
            .map(|n| SpanId::new(n.to_be_bytes()))
            .collect::<BTreeSet<SpanId>>(),
        "all four spans, exactly once each"
    );
    assert_eq!(row.span_count(), 4, "no span counted twice");
}

/// Spans survive a flush to object storage and an ingester restart.
#[tokio::test]
async fn query_across_flush_and_restart() {
    let cluster = TestCluster::new(TestClusterConfig {
        ingesters: 1,
        replication_factor: 1,
        ..TestClusterConfig::default()
    });
    let id = trace_id(3);

    for chunk in (1..=1_000u64).collect::<Vec<_>>().chunks(100) {
        let spans = chunk.iter().map(|n| span(id, *n, 200)).collect();
        cluster
            .distributor
            .write(&tenant(), batch_of(spans))
            .await
            .unwrap();
    }

    cluster.flush_all().await;
    assert_eq!(
        cluster.store.list_block_ids(&tenant()).await.unwrap().len(),
        1,
        "block arrived in the object store"
    );

    let response = cluster.frontend.trace_by_id(&tenant(), id).await.unwrap();
    assert_eq!(response.trace.expect("trace found").span_count(), 1_000);

    // restart: in-memory state is gone, the block answers
    cluster.restart_ingester(0);
    let response = cluster.frontend.trace_by_id(&tenant(), id).await.unwrap();
    assert_eq!(response.trace.expect("trace found").span_count(), 1_000);
}

/// Replica duplication across two blocks collapses under compaction.
#[tokio::test]
async fn compaction_dedups_replicated_blocks() {
    let cluster = TestCluster::new(TestClusterConfig {
        ingesters: 2,
        replication_factor: 2,
        ..TestClusterConfig::default()
    });
    let id = trace_id(11);

    // every span lands on both ingesters; each flushes its own block
    for chunk in (1..=500u64).collect::<Vec<_>>().chunks(100) {
        let spans = chunk.iter().map(|n| span(id, *n, 200)).collect();
        cluster
            .distributor
            .write(&tenant(), batch_of(spans))
            .await
            .unwrap();
    }
    cluster.flush_all().await;
    assert_eq!(cluster.store.list_block_ids(&tenant()).await.unwrap().len(), 2);

    cluster.compact().await;

    let visible = cluster.catalog.visible_blocks(&tenant());
    assert_eq!(visible.len(), 1, "one merged block remains visible");
    assert_eq!(visible[0].span_count, 500, "duplicates removed");

    let response = cluster.frontend.trace_by_id(&tenant(), id).await.unwrap();
    assert_eq!(response.trace.expect("trace found").span_count(), 500);
}

/// A dedicated-column predicate finds exactly the matching traces.
#[tokio::test]
async fn search_with_dedicated_column_pushdown() {
    let mut block = block_file::BlockConfig::default();
    block.dedicated_columns = vec![data_types::DedicatedColumnSpec::int("http.status_code")];
    // small row groups so pruning actually has groups to skip
    block.row_group_target_bytes = 64 * 1024;

    let cluster = TestCluster::new(TestClusterConfig {
        ingesters: 1,
        replication_factor: 1,
        block,
        ..TestClusterConfig::default()
    });

    let error_traces = [100u64, 5_000, 9_999];
    for chunk in (1..=10_000u64).collect::<Vec<_>>().chunks(500) {
        let spans = chunk
            .iter()
            .map(|n| {
                let status = if error_traces.contains(n) { 500 } else { 200 };
                span(trace_id(*n), 1, status)
            })
            .collect();
        cluster
            .distributor
            .write(&tenant(), batch_of(spans))
            .await
            .unwrap();
    }
    cluster.flush_all().await;
    // in-memory copies are gone so only the block answers
    cluster.restart_ingester(0);

    let predicate = SpanPredicate::Compare {
        field: Field::Attribute("http.status_code".into()),
        op: CompareOp::Eq,
        value: Scalar::Int(500),
    };
    let response = cluster
        .frontend
        .search(
            &tenant(),
            Arc::new(predicate),
            TimeRange::new(0, 10_000),
            100,
        )
        .await
        .unwrap();

    let mut found: Vec<_> = response
        .summaries
        .iter()
        .map(|s| s.trace_id)
        .collect();
    found.sort();
    assert_eq!(
        found,
        error_traces.iter().map(|n| trace_id(*n)).collect::<Vec<_>>(),
        "exactly the three error traces"
    );
}

/// A search with a limit stops early and cancels outstanding work.
#[tokio::test]
async fn search_limit_cancels_outstanding_work() {
    let cluster = TestCluster::new(TestClusterConfig {
        ingesters: 1,
        replication_factor: 1,
        ..TestClusterConfig::default()
    });

    let spans = (1..=50u64).map(|n| span(trace_id(n), 1, 200)).collect();
    cluster
        .distributor
        .write(&tenant(), batch_of(spans))
        .await
        .unwrap();
    cluster.flush_all().await;

    let response = cluster
        .frontend
        .search(
            &tenant(),
            Arc::new(SpanPredicate::True),
            TimeRange::new(0, 10_000),
            10,
        )
        .await
        .unwrap();
    assert_eq!(response.summaries.len(), 10, "limit caps the stream");
}

/// Monotonic completeness: a trace-by-id response never shrinks as more
/// spans arrive and flushes happen.
#[tokio::test]
async fn trace_reads_are_monotonically_complete() {
    let cluster = TestCluster::new(TestClusterConfig {
        ingesters: 1,
        replication_factor: 1,
        ..TestClusterConfig::default()
    });
    let id = trace_id(21);

    let mut last: BTreeSet<SpanId> = BTreeSet::new();
    for span_n in 1..=5u64 {
        cluster
            .distributor
            .write(&tenant(), span_batch(id, span_n, 200))
            .await
            .unwrap();
        if span_n == 3 {
            cluster.flush_all().await;
        }

        let response = cluster.frontend.trace_by_id(&tenant(), id).await.unwrap();
        let current = span_ids(&response.trace.expect("trace found"));
        assert!(
            current.is_superset(&last),
            "result must be a superset of every earlier result"
        );
        last = current;
    }
    assert_eq!(last.len(), 5);
}
