use crate::engine::Engine;
use crate::error::Error;
use crate::k8s::tenant::TenantKey;
use crate::stream::frame::{EVENT_STREAM_CONTENT_TYPE, ErrorPayload, error_frame};
use crate::stream::hub::SubscriberStream;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{ACCEPT, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use k8s_openapi::serde_json::{Value, json};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    pub namespace: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("❌ {}: {}", status, self);
        }
        (status, Json(ErrorPayload::from(&self))).into_response()
    }
}

/// Clients opt into streaming with `Accept: text/event-stream`
pub fn wants_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(EVENT_STREAM_CONTENT_TYPE))
}

fn event_stream_headers() -> [(axum::http::HeaderName, &'static str); 3] {
    [
        (CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE),
        (CACHE_CONTROL, "no-cache"),
        (CONNECTION, "keep-alive"),
    ]
}

fn event_stream(stream: SubscriberStream) -> Response {
    (event_stream_headers(), Body::from_stream(stream)).into_response()
}

/// Streams that fail to start answer 200 with a single error frame
fn event_stream_error(err: &Error) -> Response {
    debug!("Stream setup failed: {}", err);
    (event_stream_headers(), Body::from(error_frame(err))).into_response()
}

fn streamed(result: crate::error::Result<SubscriberStream>) -> Response {
    match result {
        Ok(stream) => event_stream(stream),
        Err(e) => event_stream_error(&e),
    }
}

fn snapshot(result: crate::error::Result<Value>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn list_resources(
    State(engine): State<Arc<Engine>>,
    Path((config, cluster, kind)): Path<(String, String, String)>,
    Query(scope): Query<ScopeQuery>,
    headers: HeaderMap,
) -> Response {
    let tenant = TenantKey::new(config, cluster);
    let namespace = scope.namespace.as_deref();

    if wants_stream(&headers) {
        streamed(
            engine
                .stream_list(&tenant, &kind, namespace, CancellationToken::new())
                .await,
        )
    } else {
        snapshot(engine.list(&tenant, &kind, namespace).await)
    }
}

pub async fn get_resource(
    State(engine): State<Arc<Engine>>,
    Path((config, cluster, kind, name)): Path<(String, String, String, String)>,
    Query(scope): Query<ScopeQuery>,
    headers: HeaderMap,
) -> Response {
    let tenant = TenantKey::new(config, cluster);
    let namespace = scope.namespace.as_deref();

    if wants_stream(&headers) {
        streamed(
            engine
                .stream_object(&tenant, &kind, namespace, &name, CancellationToken::new())
                .await,
        )
    } else {
        snapshot(engine.get(&tenant, &kind, namespace, &name).await)
    }
}

pub async fn helm_releases(
    State(engine): State<Arc<Engine>>,
    Path((config, cluster)): Path<(String, String)>,
    Query(scope): Query<ScopeQuery>,
    headers: HeaderMap,
) -> Response {
    let tenant = TenantKey::new(config, cluster);
    let namespace = scope.namespace.as_deref().filter(|ns| !ns.is_empty());

    if wants_stream(&headers) {
        streamed(
            engine
                .stream_helm_releases(&tenant, namespace, CancellationToken::new())
                .await,
        )
    } else {
        snapshot(engine.helm_releases(&tenant, namespace).await)
    }
}

pub async fn invalidate_config(State(engine): State<Arc<Engine>>, Path(config): Path<String>) -> impl IntoResponse {
    let invalidated = engine.invalidate_config(&config).await;
    Json(json!({ "config": config, "invalidated": invalidated }))
}

pub async fn stats(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.stats().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_wants_stream() {
        let mut headers = HeaderMap::new();
        assert!(!wants_stream(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!wants_stream(&headers));

        headers.append(ACCEPT, HeaderValue::from_static("text/event-stream"));
        assert!(wants_stream(&headers));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            Error::ConfigNotFound("cfg".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::PermissionDenied("pods".into()).into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::BadRequest("kind".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
