use crate::admin;
use crate::stream::progress_ws_handler;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use conduit_orchestrator::Orchestrator;
use conduit_transport::HybridTransportAdapter;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Shared application state.
pub struct AppState {
    /// Runs workflows and owns the cache and progress channel.
    pub orchestrator: Arc<Orchestrator>,
    /// Source of breaker and connection state.
    pub transport: Arc<HybridTransportAdapter>,
}

impl AppState {
    /// Bundle the handles for the router.
    pub fn new(orchestrator: Arc<Orchestrator>, transport: Arc<HybridTransportAdapter>) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            transport,
        })
    }
}

/// The HTTP/WebSocket front of the orchestrator.
pub struct GatewayServer;

impl GatewayServer {
    /// The router with every route mounted.
    pub fn build(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/query", post(query_handler))
            .route("/ws/progress", get(progress_ws_handler))
            .route("/admin/breakers", get(admin::list_breakers))
            .route("/admin/breakers/{name}/reset", post(admin::reset_breaker))
            .route("/admin/connections", get(admin::list_connections))
            .route("/admin/cache", get(admin::cache_stats))
            .route("/admin/cache/invalidate", post(admin::invalidate_cache))
            .with_state(state)
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "conduit",
        "agents": state.transport.agents().len(),
    }))
}

/// Body of `POST /query`.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    /// Natural-language question.
    pub query: String,
}

/// Runs one workflow. Failed and cancelled workflows are still a 200; the
/// outcome carries the failure. Dropping the request abandons the workflow.
async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> impl IntoResponse {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "query must not be empty"})),
        )
            .into_response();
    }
    let outcome = state.orchestrator.run(&req.query).await;
    info!(
        workflow_id = %outcome.workflow_id,
        status = %outcome.status,
        cached = outcome.cached,
        "Query answered"
    );
    Json(outcome).into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use conduit_cache::{CacheConfig, SemanticCache};
    use conduit_core::AgentIdentity;
    use conduit_orchestrator::{PipelineConfig, ProgressReporter};
    use conduit_resilience::BreakerRegistry;
    use conduit_transport::TransportConfig;
    use tower::ServiceExt;

    fn app() -> Router {
        let transport = Arc::new(
            HybridTransportAdapter::new(
                vec![AgentIdentity::new("nlp", "http://127.0.0.1:1").with_capability("understand_query")],
                TransportConfig::default(),
                Arc::new(BreakerRegistry::new()),
            )
            .unwrap(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            transport.clone(),
            Arc::new(SemanticCache::new(CacheConfig::default())),
            Arc::new(ProgressReporter::default()),
            PipelineConfig::default(),
        ));
        GatewayServer::build(AppState::new(orchestrator, transport))
    }

    #[tokio::test]
    async fn test_empty_query_is_bad_request() {
        let resp = app()
            .oneshot(
                Request::post("/query")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query": "  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let resp = app()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
