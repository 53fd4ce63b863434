//! Webhook router
//!
//! HTTP entry for durable-queue callbacks. Fixed paths under `/api/tasks/`
//! plus the health probe. Every task path reads the (length-bounded) raw
//! body, verifies the `upstash-signature` header, and only then parses and
//! dispatches. Unknown topics are acknowledged with 200 so the queue stops
//! redelivering them.
//!
//! The server starts before the protocol supervisor and must stay
//! listening regardless of other subsystems' startup failures.

use crate::pipeline::{TaskManager, WebhookResponse};
use crate::queue::signature;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Maximum accepted webhook body.
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Shared router state.
pub struct AppState {
    pub manager: Arc<TaskManager>,
    /// Key the durable queue signs bodies with
    pub signing_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskPayload {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchPayload {
    group_id: String,
    task_ids: Vec<String>,
}

/// Build the webhook router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks/:topic", post(handle_topic))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(router: Router, port: u16) -> std::io::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "webhook router listening");
    axum::serve(listener, router).await
}

async fn health() -> &'static str {
    "OK"
}

fn respond(result: WebhookResponse) -> Response {
    let status =
        StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(json!({
        "success": result.success,
        "message": result.message,
    }));
    (status, body).into_response()
}

fn bad_request(message: &str) -> Response {
    // Malformed payloads are permanent failures; the queue must not retry.
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "message": message })),
    )
        .into_response()
}

async fn handle_topic(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Signature verification is mandatory for every task topic.
    let header = headers
        .get(signature::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !signature::verify(&state.signing_key, header, &body) {
        tracing::warn!(topic = %topic, "webhook signature rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "message": "invalid signature" })),
        )
            .into_response();
    }

    match topic.as_str() {
        "download" => {
            let payload: TaskPayload = match serde_json::from_slice(&body) {
                Ok(payload) => payload,
                Err(err) => return bad_request(&format!("malformed payload: {err}")),
            };
            respond(state.manager.handle_download_webhook(&payload.task_id).await)
        }
        "upload" => {
            let payload: TaskPayload = match serde_json::from_slice(&body) {
                Ok(payload) => payload,
                Err(err) => return bad_request(&format!("malformed payload: {err}")),
            };
            respond(state.manager.handle_upload_webhook(&payload.task_id).await)
        }
        "batch" => {
            let payload: BatchPayload = match serde_json::from_slice(&body) {
                Ok(payload) => payload,
                Err(err) => return bad_request(&format!("malformed payload: {err}")),
            };
            respond(
                state
                    .manager
                    .handle_media_batch_webhook(&payload.group_id, &payload.task_ids)
                    .await,
            )
        }
        "system-events" => {
            // Observed but not acted upon.
            tracing::debug!("system event acknowledged");
            respond(WebhookResponse::ok())
        }
        other => {
            tracing::warn!(topic = other, "unknown webhook topic acknowledged");
            respond(WebhookResponse::ok_with("unknown topic"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::coordinator::{CoordinatorConfig, InstanceCoordinator, MemoryInstanceStore};
    use crate::drive::DriveProviderFactory;
    use crate::kv::{KvStore, KvStoreConfig, MemoryKv};
    use crate::limits::RateLimiter;
    use crate::pipeline::PipelineConfig;
    use crate::protocol::{
        BreakerConfig, CircuitBreaker, ClientSupervisor, DetachedTransport, SupervisorConfig,
    };
    use crate::queue::RecordingQueue;
    use crate::repository::tasks::TaskRepositoryConfig;
    use crate::repository::{MemoryDriveStore, MemoryTaskStore, TaskRepository};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const KEY: &str = "test-signing-key";

    fn test_router() -> Router {
        let kv = Arc::new(KvStore::new(
            Arc::new(MemoryKv::new("primary")),
            None,
            KvStoreConfig::default(),
        ));
        let clock = Arc::new(SystemClock);
        let coordinator = Arc::new(InstanceCoordinator::new(
            kv,
            Arc::new(MemoryInstanceStore::new()),
            clock.clone(),
            CoordinatorConfig::default(),
        ));
        let limiter = Arc::new(RateLimiter::default());
        let supervisor = Arc::new(ClientSupervisor::new(
            Arc::new(DetachedTransport),
            CircuitBreaker::new(BreakerConfig::default(), clock.clone()),
            coordinator.clone(),
            limiter.clone(),
            SupervisorConfig::default(),
        ));
        let repo = Arc::new(TaskRepository::new(
            Arc::new(MemoryTaskStore::new()),
            clock,
            TaskRepositoryConfig::default(),
        ));
        let manager = Arc::new(TaskManager::new(
            repo,
            Arc::new(MemoryDriveStore::new()),
            Arc::new(DriveProviderFactory::new("/")),
            Arc::new(RecordingQueue::new()),
            coordinator,
            supervisor,
            limiter,
            PipelineConfig::default(),
        ));
        manager.start();

        router(Arc::new(AppState {
            manager,
            signing_key: KEY.to_string(),
        }))
    }

    fn signed_request(path: &str, body: &str) -> Request<Body> {
        Request::post(path)
            .header("content-type", "application/json")
            .header(signature::SIGNATURE_HEADER, signature::sign(KEY, body.as_bytes()))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let response = test_router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_signature_is_401() {
        let body = r#"{"taskId":"t-1"}"#;
        let request = Request::post("/api/tasks/download")
            .header(signature::SIGNATURE_HEADER, "v1=deadbeef")
            .body(Body::from(body))
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_signature_is_401() {
        let request = Request::post("/api/tasks/download")
            .body(Body::from(r#"{"taskId":"t-1"}"#))
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_signature_without_leadership_is_503() {
        let response = test_router()
            .oneshot(signed_request("/api/tasks/download", r#"{"taskId":"t-1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn malformed_json_is_500() {
        let response = test_router()
            .oneshot(signed_request("/api/tasks/download", r#"{"nope":true"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unknown_topic_is_acknowledged() {
        let response = test_router()
            .oneshot(signed_request("/api/tasks/mystery", r#"{}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn system_events_are_no_ops() {
        let response = test_router()
            .oneshot(signed_request(
                "/api/tasks/system-events",
                r#"{"event":"deploy"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
