/// HTTP surface tests against an engine with no tenant configurations.
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use k8s_openapi::serde_json::{self, Value};
use kubepulse::config::SyncConfig;
use kubepulse::engine::Engine;
use kubepulse::k8s::client_manager::KubeClientFactory;
use kubepulse::k8s::credentials::StaticConfigStore;
use kubepulse::k8s::kinds::KindTable;
use kubepulse::server::router;
use std::sync::Arc;
use tower::ServiceExt;

fn engine() -> Arc<Engine> {
    Engine::new(
        SyncConfig::default(),
        Arc::new(StaticConfigStore::new()),
        Arc::new(KubeClientFactory::default()),
        KindTable::standard(),
    )
}

async fn send(engine: &Arc<Engine>, request: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = router(engine.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_healthz() {
    let engine = engine();
    let (status, _, body) = send(&engine, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_unknown_config_is_404_json() {
    let engine = engine();
    let (status, content_type, body) = send(&engine, get("/api/v1/cfg-x/prod/resources/pods")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json, serde_json::json!({ "error": "configuration not found: cfg-x" }));
}

#[tokio::test]
async fn test_streaming_setup_error_is_single_frame() {
    let engine = engine();
    let request = Request::builder()
        .uri("/api/v1/cfg-x/prod/resources/pods")
        .header(header::ACCEPT, "text/event-stream")
        .body(Body::empty())
        .unwrap();
    let (status, content_type, body) = send(&engine, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/event-stream"));
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "data: {\"error\":\"configuration not found: cfg-x\"}\n\n"
    );
}

#[tokio::test]
async fn test_unknown_kind_is_400() {
    let engine = engine();
    let (status, _, body) = send(&engine, get("/api/v1/cfg-x/prod/resources/widgets")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("widgets"));
}

#[tokio::test]
async fn test_helm_releases_of_unknown_config() {
    let engine = engine();
    let (status, _, _) = send(&engine, get("/api/v1/cfg-x/prod/helm/releases")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalidate_and_stats() {
    let engine = engine();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/configs/cfg-x/invalidate")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&engine, request).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["config"], "cfg-x");
    assert_eq!(json["invalidated"], 0);

    let (status, _, body) = send(&engine, get("/debug/stats")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json.is_object());

    engine.shutdown();
}
