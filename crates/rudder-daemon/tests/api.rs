//! HTTP API tests driven through the router without a socket

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use librudder_core::{PassTrigger, SyncStatus};
use serde_json::{json, Value};
use tower::ServiceExt;

use rudder_daemon::server;

const APP: &str = "web";

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_push_webhook_refreshes_matching_application() {
    let mut other = application("other", automated());
    other.source.repo_url = "https://git.example.com/org/unrelated.git".to_string();
    let mut h = Harness::start(vec![application(APP, automated()), other], web_tree("c1", "hello"));
    let router = server::router(h.controller.clone());

    let (status, body) = send(
        router,
        post_json(
            "/api/webhook",
            json!({
                "ref": "refs/heads/main",
                "after": "c1",
                "repository": {"clone_url": "https://git.example.com/org/web", "html_url": "https://git.example.com/org/web"}
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["refreshed"], json!([APP]));
    assert_eq!(h.next_pass(APP).await.0, SyncStatus::Synced);
    assert_eq!(
        h.controller.latest(APP).unwrap().unwrap().trigger,
        PassTrigger::Refresh
    );
    assert!(h.controller.latest("other").unwrap().is_none());

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_push_to_untracked_branch_is_ignored() {
    let h = Harness::start(vec![application(APP, automated())], web_tree("c1", "hello"));
    let router = server::router(h.controller.clone());

    let (status, body) = send(
        router,
        post_json(
            "/api/webhook",
            json!({
                "ref": "refs/heads/feature",
                "after": "c9",
                "repository": {"clone_url": REPO}
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["refreshed"], json!([]));

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_webhook_without_repository_url_is_rejected() {
    let h = Harness::start(vec![application(APP, automated())], web_tree("c1", "hello"));
    let router = server::router(h.controller.clone());

    let (status, body) = send(
        router,
        post_json("/api/webhook", json!({"ref": "refs/heads/main", "repository": {}})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_payload");

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_application_queries() {
    let mut h = Harness::start(vec![application(APP, automated())], web_tree("c1", "hello"));

    h.controller.poll(APP).await.unwrap();
    assert_eq!(h.next_pass(APP).await.0, SyncStatus::Synced);

    let (status, body) = send(server::router(h.controller.clone()), get("/api/applications")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], APP);
    assert_eq!(body[0]["status"]["state"], "idle");
    assert_eq!(body[0]["last_status"], "synced");

    let (status, body) = send(server::router(h.controller.clone()), get("/api/applications/web")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["application"]["name"], APP);
    assert_eq!(body["status"]["synced_commit"], "c1");
    assert_eq!(body["latest"]["status"], "synced");
    assert_eq!(body["latest"]["operations"].as_array().unwrap().len(), 2);

    let (status, body) = send(
        server::router(h.controller.clone()),
        get("/api/applications/web/history?limit=5"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_unknown_application_is_404() {
    let h = Harness::start(vec![application(APP, automated())], web_tree("c1", "hello"));

    let (status, body) = send(server::router(h.controller.clone()), get("/api/applications/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "application_not_found");

    let (status, _) = send(
        server::router(h.controller.clone()),
        post_json("/api/applications/nope/sync", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_sync_endpoint_applies_manual_application() {
    let policy = librudder_core::SyncPolicy {
        automated: false,
        prune: false,
        self_heal: false,
    };
    let mut h = Harness::start(vec![application(APP, policy)], web_tree("c1", "hello"));

    let (status, body) = send(
        server::router(h.controller.clone()),
        post_json("/api/applications/web/sync", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queued"], "sync");

    assert_eq!(h.next_pass(APP).await.0, SyncStatus::Synced);
    assert_eq!(h.cluster.len(), 2);

    let (status, _) = send(
        server::router(h.controller.clone()),
        post_json("/api/applications/web/refresh", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(h.next_pass(APP).await.0, SyncStatus::Synced);

    h.controller.shutdown().await;
}
