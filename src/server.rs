//! Ops HTTP Server
//!
//! Liveness, readiness, Prometheus metrics and a JSON stats dump for the
//! cache engine. Caller traffic does not go through here.

use crate::cache::coordinator::Coordinator;
use crate::cache::RiskCache;
use crate::error::{Error, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Error body returned by the ops endpoints
#[derive(Debug, Clone, Serialize)]
pub struct OpsErrorResponse {
    pub error: String,
    pub message: String,
}

/// Ops router builder
pub struct OpsRouter {
    engine: Arc<Coordinator>,
}

impl OpsRouter {
    pub fn new(engine: Arc<Coordinator>) -> Self {
        Self { engine }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            engine: self.engine,
        };

        Router::new()
            .route("/healthz", get(liveness))
            .route("/livez", get(liveness))
            .route("/readyz", get(readiness))
            .route("/metrics", get(metrics))
            .route("/stats", get(stats))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<Coordinator>,
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.health_check().await {
        Ok(true) => (StatusCode::OK, "ready".to_string()),
        Ok(false) => (StatusCode::SERVICE_UNAVAILABLE, "degraded".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.stats().await.render_prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Metrics rendering failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OpsErrorResponse {
                    error: "metrics_failed".into(),
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.engine.stats().await;
    (StatusCode::OK, Json(snapshot))
}

/// Serve the ops endpoints until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, engine: Arc<Coordinator>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = OpsRouter::new(engine).build();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind ops server: {}", e)))?;

    info!("Ops server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(format!("Ops server error: {}", e)))?;

    info!("Ops server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LocalNode, MemoryStore};
    use crate::cache::metrics::StatsSnapshot;
    use crate::config::EngineConfig;
    use crate::domain::ports::SharedBackingStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let config = EngineConfig::default();
        let nodes = LocalNode::shared_from_config(&config.distributed);
        let engine =
            Coordinator::new(config, Arc::new(MemoryStore::new()) as SharedBackingStore, nodes).unwrap();
        OpsRouter::new(engine).build()
    }

    async fn call(app: Router, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let app = router();
        assert_eq!(call(app.clone(), "/healthz").await, (StatusCode::OK, "ok".into()));
        assert_eq!(call(app.clone(), "/readyz").await, (StatusCode::OK, "ready".into()));
        assert_eq!(call(app, "/nope").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_and_stats() {
        let app = router();
        let (status, body) = call(app.clone(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("risk_cache_"));

        let (status, body) = call(app, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: StatsSnapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(snapshot.shards.len(), 1);
    }
}
