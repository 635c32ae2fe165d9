pub mod bookings;
pub mod common;
pub mod health;
pub mod queue;

use axum::{http::StatusCode, response::IntoResponse, Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "error": {"code": "NOT_FOUND", "message": "no such route"}})),
    )
}

/// Assembles the API routes. Middleware (trace, cors, timeouts, rate
/// limiting) is layered by the caller so tests can drive the bare router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/health", health::health_routes())
        .nest("/bookings", bookings::bookings_routes())
        .nest("/queue", queue::queue_routes())
        .fallback(not_found)
        .with_state(state)
}
