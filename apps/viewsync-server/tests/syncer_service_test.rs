use tokio::sync::mpsc::unbounded_channel;
use viewsync::VersionedBatch;
use viewsync_protocol::{Downstream, ErrorKind};

mod common;
use common::*;

fn batch(value: serde_json::Value) -> VersionedBatch {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn test_ingested_batch_reaches_connected_client() {
    let server = server();
    let state = &server.state;
    state.feed.ingest(batch(issue_batch(1, &[(1, "a", true), (2, "b", false)]))).await.unwrap();

    let handle = state.dispatcher.handle_for("g1").await.unwrap();
    let (sink, mut rx) = unbounded_channel();
    handle
        .connect(connect_request("g1", "c1", "ws1", vec![open_issues_query()]), sink)
        .await
        .unwrap();

    let hydrated = next_poke(&mut rx).await;
    assert!(matches!(hydrated[0], Downstream::Connected(_)));
    assert_eq!(row_puts(&hydrated), vec![("issue".to_string(), 1)]);

    state.feed.ingest(batch(issue_batch(2, &[(3, "c", true)]))).await.unwrap();
    let poke = next_poke(&mut rx).await;
    assert_eq!(row_puts(&poke), vec![("issue".to_string(), 3)]);

    let summary = state.dispatcher.summary("g1").await.unwrap();
    assert_eq!(summary.replica_version, Some(2));
}

#[tokio::test]
async fn test_batches_queued_before_connect_are_applied_first() {
    let server = server();
    let state = &server.state;
    state.feed.ingest(batch(issue_batch(1, &[(1, "a", true)]))).await.unwrap();

    let first = state.dispatcher.handle_for("g1").await.unwrap();
    let (sink, mut rx) = unbounded_channel();
    first
        .connect(connect_request("g1", "c1", "ws1", vec![open_issues_query()]), sink)
        .await
        .unwrap();
    next_poke(&mut rx).await;

    // Both batches may still be queued for the syncer when c2 connects.
    state.feed.ingest(batch(issue_batch(2, &[(2, "b", true)]))).await.unwrap();
    state.feed.ingest(batch(issue_batch(3, &[(3, "c", true)]))).await.unwrap();

    let (sink2, mut rx2) = unbounded_channel();
    let handle = state.dispatcher.handle_for("g1").await.unwrap();
    handle
        .connect(connect_request("g1", "c2", "ws2", vec![open_issues_query()]), sink2)
        .await
        .unwrap();
    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.extend(row_puts(&next_poke(&mut rx2).await));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![("issue".to_string(), 1), ("issue".to_string(), 2), ("issue".to_string(), 3)]
    );
    assert_eq!(state.dispatcher.summary("g1").await.unwrap().replica_version, Some(3));
}

#[tokio::test]
async fn test_rejected_connect_leaves_group_running() {
    let server = server();
    let state = &server.state;
    let handle = state.dispatcher.handle_for("g1").await.unwrap();

    let mut request = connect_request("g1", "c1", "ws1", vec![]);
    request.params.schema_version = 7;
    let (sink, _rx) = unbounded_channel();
    let err = handle.connect(request, sink).await.unwrap_err();
    assert_eq!(err.error_kind(), ErrorKind::SchemaVersionNotSupported);

    let (sink, mut rx) = unbounded_channel();
    handle
        .connect(connect_request("g1", "c1", "ws1", vec![]), sink)
        .await
        .unwrap();
    next_poke(&mut rx).await;
    assert_eq!(state.dispatcher.running().await, 1);
}

#[tokio::test]
async fn test_disconnect_with_stale_wsid_is_ignored() {
    let server = server();
    let state = &server.state;
    let handle = state.dispatcher.handle_for("g1").await.unwrap();
    let (sink, mut rx) = unbounded_channel();
    handle
        .connect(connect_request("g1", "c1", "ws1", vec![]), sink)
        .await
        .unwrap();
    next_poke(&mut rx).await;

    handle.disconnect("c1", "ws-old");
    assert_eq!(handle.summary().await.unwrap().connected, vec!["c1".to_string()]);

    handle.disconnect("c1", "ws1");
    assert!(handle.summary().await.unwrap().connected.is_empty());
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_drained_group_restarts_from_store() {
    let server = server();
    let state = &server.state;
    state.feed.ingest(batch(issue_batch(1, &[(1, "a", true)]))).await.unwrap();

    let handle = state.dispatcher.handle_for("g1").await.unwrap();
    let (sink, mut rx) = unbounded_channel();
    handle
        .connect(connect_request("g1", "c1", "ws1", vec![open_issues_query()]), sink)
        .await
        .unwrap();
    let messages = next_poke(&mut rx).await;
    let version_before = state.dispatcher.summary("g1").await.unwrap().version;

    assert_eq!(state.dispatcher.drain_all(std::time::Duration::from_millis(50)).await, 1);
    let mut last = None;
    while let Some(message) = rx.recv().await {
        last = Some(message);
    }
    assert!(matches!(last, Some(Downstream::Error(ref e)) if e.kind == ErrorKind::Rebalance));

    let restarted = state.dispatcher.handle_for("g1").await.unwrap();
    let summary = restarted.summary().await.unwrap();
    assert_eq!(summary.version, version_before);
    assert_eq!(summary.clients, vec!["c1".to_string()]);
    assert!(summary.connected.is_empty());
    assert!(!messages.is_empty());
}
