use axum::{
    body::Body,
    http::{Request, StatusCode, header::AUTHORIZATION},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::mpsc::unbounded_channel;
use tower::ServiceExt; // for `oneshot`
use viewsync_server::create_app;

mod common;
use common::*;

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn ingest(body: Value, secret: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json");
    if let Some(secret) = secret {
        builder = builder.header(AUTHORIZATION, format!("Bearer {secret}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = server();
    let app = create_app(server.state.clone());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["taskId"], "task-test");
    assert_eq!(body["rows"], 0);
    assert_eq!(body["groups"], 0);
}

#[tokio::test]
async fn test_version_endpoint() {
    let server = server();
    let app = create_app(server.state.clone());

    let response = app
        .oneshot(Request::builder().uri("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["protocolVersion"], viewsync_protocol::PROTOCOL_VERSION);
}

#[tokio::test]
async fn test_ingest_requires_secret() {
    let server = server();
    let app = create_app(server.state.clone());

    let missing = app
        .clone()
        .oneshot(ingest(issue_batch(1, &[(1, "a", true)]), None))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .clone()
        .oneshot(ingest(issue_batch(1, &[(1, "a", true)]), Some("nope")))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.state.feed.version().await, None);

    let ok = app
        .oneshot(ingest(issue_batch(1, &[(1, "a", true)]), Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let body = json_body(ok).await;
    assert_eq!(body["version"], 1);
    assert_eq!(body["applied"], 1);
    assert_eq!(server.state.feed.version().await, Some(1));
}

#[tokio::test]
async fn test_ingest_rejects_bad_and_stale_batches() {
    let server = server();
    let app = create_app(server.state.clone());

    let malformed = app
        .clone()
        .oneshot(ingest(serde_json::json!({"changes": "nope"}), Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    let first = app
        .clone()
        .oneshot(ingest(issue_batch(2, &[(1, "a", true)]), Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let stale = app
        .oneshot(ingest(issue_batch(2, &[(2, "b", true)]), Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(stale.status(), StatusCode::BAD_REQUEST);
    assert_eq!(server.state.feed.read().await.unwrap().row_count(), 1);
}

#[tokio::test]
async fn test_public_routes_skip_auth() {
    let server = server();
    let app = create_app(server.state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/debug/group/unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_debug_group_reports_running_syncer() {
    let server = server();
    let app = create_app(server.state.clone());

    let handle = server.state.dispatcher.handle_for("g1").await.unwrap();
    let (sink, mut rx) = unbounded_channel();
    handle
        .connect(connect_request("g1", "c1", "ws1", vec![open_issues_query()]), sink)
        .await
        .unwrap();
    next_poke(&mut rx).await;

    let response = app
        .oneshot(Request::builder().uri("/debug/group/g1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["groupId"], "g1");
    assert_eq!(body["state"], "streaming");
    assert_eq!(body["connected"], serde_json::json!(["c1"]));
    assert_eq!(body["queries"], 1);
}

#[tokio::test]
async fn test_drain_endpoint_stops_groups() {
    let server = server();
    let app = create_app(server.state.clone());

    let handle = server.state.dispatcher.handle_for("g1").await.unwrap();
    let (sink, mut rx) = unbounded_channel();
    handle
        .connect(connect_request("g1", "c1", "ws1", vec![]), sink)
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/drain")
                .header(AUTHORIZATION, format!("Bearer {SECRET}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["drained"], 1);
    assert_eq!(server.state.dispatcher.running().await, 0);

    let mut last = None;
    while let Some(message) = rx.recv().await {
        last = Some(message);
    }
    let Some(viewsync_protocol::Downstream::Error(err)) = last else {
        panic!("expected a closing error, got {last:?}");
    };
    assert_eq!(err.kind, viewsync_protocol::ErrorKind::Rebalance);
}
