use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::AppState;

async fn liveness() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Readiness: the durable store must answer a ping.
async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ready"}))),
        Err(e) => {
            warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "reason": "database unreachable"})),
            )
        }
    }
}

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(liveness))
        .route("/ready", get(readiness))
}
