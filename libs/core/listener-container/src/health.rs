//! Health check handlers for listener containers.
//!
//! - Liveness probe (`/health`, `/healthz`)
//! - Readiness probe (`/ready`, `/readyz`), ready only while RUNNING
//! - Container snapshot (`/container`)
//! - Prometheus metrics (`/metrics`)
//! - Dead-letter admin endpoints (`/admin/dead-letters*`) when a queue is attached

use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::container::ListenerContainer;
use crate::dead_letter::{DeadLetterEntry, DeadLetterStats, InMemoryDeadLetterQueue};
use crate::metrics;
use crate::state::{ContainerSnapshot, LifecycleState};

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub container: Arc<ListenerContainer>,
    pub app_name: String,
    pub app_version: String,
    pub dead_letters: Option<Arc<InMemoryDeadLetterQueue>>,
}

impl HealthState {
    pub fn new(
        container: Arc<ListenerContainer>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            container,
            app_name: app_name.into(),
            app_version: app_version.into(),
            dead_letters: None,
        }
    }

    /// Expose `queue` through the dead-letter admin endpoints
    pub fn with_dead_letters(mut self, queue: Arc<InMemoryDeadLetterQueue>) -> Self {
        self.dead_letters = Some(queue);
        self
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler. Always OK while the process serves requests.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready while the container is RUNNING with every worker slot alive.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let container = &state.container;
    let lifecycle = container.state();
    let active = container.active_workers();
    let expected = container.config().concurrency;

    let ready = lifecycle == LifecycleState::Running && active == expected;
    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "checks": {
            "state": lifecycle,
            "workers": format!("{active}/{expected}"),
        }
    });

    if ready {
        Ok((StatusCode::OK, Json(body)))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

/// Container snapshot handler.
pub async fn container_handler(State(state): State<HealthState>) -> Json<ContainerSnapshot> {
    Json(state.container.snapshot())
}

/// Prometheus metrics handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics recorder not installed",
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    100
}

fn dead_letters_unavailable() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "no dead-letter queue attached" })),
    )
}

/// Dead-letter statistics
pub async fn dead_letter_stats_handler(
    State(state): State<HealthState>,
) -> Result<Json<DeadLetterStats>, (StatusCode, Json<Value>)> {
    let queue = state.dead_letters.ok_or_else(dead_letters_unavailable)?;
    Ok(Json(queue.stats()))
}

/// List dead letters, oldest first
pub async fn dead_letter_list_handler(
    State(state): State<HealthState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DeadLetterEntry>>, (StatusCode, Json<Value>)> {
    let queue = state.dead_letters.ok_or_else(dead_letters_unavailable)?;
    Ok(Json(queue.list(params.count)))
}

/// Drop every dead letter
pub async fn dead_letter_purge_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let queue = state.dead_letters.ok_or_else(dead_letters_unavailable)?;
    let purged = queue.purge();
    Ok(Json(json!({ "purged": purged })))
}

/// Create the health router.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/container", get(container_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/admin/dead-letters",
            get(dead_letter_list_handler).delete(dead_letter_purge_handler),
        )
        .route("/admin/dead-letters/stats", get(dead_letter_stats_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ListenerRegistration;
    use crate::config::ContainerConfig;
    use crate::dead_letter::DeadLetterSink;
    use crate::delivery::Delivery;
    use crate::listener::listener_fn;
    use crate::memory::InMemoryBroker;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> HealthState {
        let broker = InMemoryBroker::new();
        broker.declare_queue("health");
        let container = ListenerContainer::new(
            Arc::new(broker),
            ListenerRegistration::new(
                ContainerConfig::new("health").with_concurrency(2),
                listener_fn(|_: String, _| async move { Ok(()) }),
            ),
        )
        .unwrap();
        HealthState::new(Arc::new(container), "listener-test", "0.1.0")
    }

    async fn get(router: axum::Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health_is_always_ok() {
        let (status, body) = get(health_router(state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "listener-test");
    }

    #[tokio::test]
    async fn test_ready_follows_lifecycle() {
        let state = state();
        let (status, body) = get(health_router(state.clone()), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["state"], "NEW");

        state.container.start().await.unwrap();
        let (status, body) = get(health_router(state.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["workers"], "2/2");

        state.container.stop().await.unwrap();
        let (status, _) = get(health_router(state.clone()), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_container_snapshot_endpoint() {
        let (status, body) = get(health_router(state()), "/container").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue"], "health");
        assert_eq!(body["concurrency"], 2);
        assert_eq!(body["workers"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn test_dead_letter_endpoints() {
        let (status, _) = get(health_router(state()), "/admin/dead-letters/stats").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let queue = Arc::new(InMemoryDeadLetterQueue::new());
        let delivery = Delivery::new(1, "health", b"bad".to_vec());
        queue
            .publish(DeadLetterEntry::from_delivery(&delivery, "rejected"))
            .await
            .unwrap();
        let router = health_router(state().with_dead_letters(queue));

        let (status, body) = get(router.clone(), "/admin/dead-letters/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["length"], 1);

        let (_, body) = get(router, "/admin/dead-letters?count=5").await;
        assert_eq!(body[0]["reason"], "rejected");
    }
}
