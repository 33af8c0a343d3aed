//! Operator endpoints: breaker dump and override, connection and cache state.

use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// `GET /admin/breakers`: every breaker snapshot, sorted by name.
pub async fn list_breakers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.transport.breakers().snapshot_all())
}

/// `POST /admin/breakers/{name}/reset`: force a breaker back to Closed. 404 if unknown.
pub async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let breakers = state.transport.breakers();
    match breakers.get(&name) {
        Some(breaker) if breakers.reset(&name) => {
            info!(breaker = %name, "Breaker reset by operator");
            Json(breaker.snapshot()).into_response()
        }
        _ => {
            warn!(breaker = %name, "Reset requested for unknown breaker");
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": format!("unknown breaker '{name}'")})),
            )
                .into_response()
        }
    }
}

/// `GET /admin/connections`: persistent connection states.
pub async fn list_connections(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.transport.connection_states())
}

/// `GET /admin/cache`: cache counters.
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.cache().stats().await)
}

/// Body of `POST /admin/cache/invalidate`.
#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    /// Entries carrying this tag are dropped.
    pub tag: String,
}

/// `POST /admin/cache/invalidate`: drop entries by tag.
pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InvalidateRequest>,
) -> impl IntoResponse {
    let removed = state.orchestrator.cache().invalidate(&req.tag).await;
    info!(tag = %req.tag, removed, "Cache invalidated by operator");
    Json(serde_json::json!({"tag": req.tag, "removed": removed}))
}
