use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::entities::booking::BookingStatus;
use crate::errors::{ApiError, ServiceError};
use crate::handlers::common::{success_response, validate_input, PaginatedResponse, PaginationParams};
use crate::services::bookings::ReserveBooking;
use crate::AppState;

const QUEUE_PASS_HEADER: &str = "x-queue-pass";

#[derive(Debug, Deserialize, Validate)]
pub struct ReserveRequestBody {
    pub event_id: Uuid,
    pub show_id: Uuid,
    pub zone_id: Uuid,
    #[validate(range(min = 1, max = 100))]
    pub quantity: i32,
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmRequestBody {
    #[validate(length(min = 1, max = 128))]
    pub payment_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "PaginationParams::first_page")]
    pub page: u64,
    #[serde(default = "PaginationParams::default_size")]
    pub per_page: u64,
    pub status: Option<String>,
}

/// POST /bookings/reserve
///
/// When the event runs a waiting room, a valid `X-Queue-Pass` is required
/// and is consumed here, before the reserve script runs: one admission per
/// pass, even if the reservation itself is rejected.
async fn reserve(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    headers: HeaderMap,
    Json(payload): Json<ReserveRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let event = state.services.catalog.event(payload.event_id).await?;
    if event.queue_enabled {
        let pass = headers
            .get(QUEUE_PASS_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError(ServiceError::Unauthorized(
                    "queue pass required for this event".to_string(),
                ))
            })?;
        state
            .services
            .queue
            .validate_and_consume(payload.event_id, user.user_id, pass)
            .await?;
    }

    let summary = state
        .services
        .bookings
        .reserve(
            user.user_id,
            ReserveBooking {
                event_id: payload.event_id,
                show_id: payload.show_id,
                zone_id: payload.zone_id,
                quantity: payload.quantity,
                idempotency_key: payload.idempotency_key,
            },
        )
        .await?;

    info!(booking_id = %summary.booking_id, user_id = %user.user_id, "reservation accepted");
    Ok(success_response(summary))
}

/// POST /bookings/:id/confirm
async fn confirm(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<Uuid>,
    Json(payload): Json<ConfirmRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let summary = state
        .services
        .bookings
        .confirm(user.user_id, booking_id, &payload.payment_id)
        .await?;
    Ok(success_response(summary))
}

/// POST /bookings/:id/cancel
async fn cancel(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .services
        .bookings
        .cancel(user.user_id, booking_id)
        .await?;
    Ok(success_response(summary))
}

/// GET /bookings
async fn list(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(BookingStatus::parse(raw).ok_or_else(|| {
            ApiError(ServiceError::Validation(format!(
                "unknown status filter {:?}",
                raw
            )))
        })?),
        None => None,
    };
    let (items, total) = state
        .services
        .bookings
        .list(user.user_id, query.page, query.per_page, status)
        .await?;
    Ok(success_response(PaginatedResponse::new(
        items,
        query.page,
        query.per_page,
        total,
    )))
}

/// GET /bookings/pending
async fn pending(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.services.bookings.pending(user.user_id).await?;
    Ok(success_response(items))
}

/// GET /bookings/:id
async fn get_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state.services.bookings.get(user.user_id, booking_id).await?;
    Ok(success_response(summary))
}

pub fn bookings_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/reserve", post(reserve))
        .route("/pending", get(pending))
        .route("/:id/confirm", post(confirm))
        .route("/:id/cancel", post(cancel))
        .route("/:id", get(get_booking))
        .route("/", get(list))
}
