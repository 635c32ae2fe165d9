use axum::{
    extract::{Path, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::errors::ApiError;
use crate::handlers::common::success_response;
use crate::queue::QueueAdmissionService;
use crate::AppState;

const POSITION_HEARTBEAT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct JoinRequestBody {
    pub event_id: Uuid,
}

/// POST /queue/join
async fn join(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<JoinRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .services
        .queue
        .join(payload.event_id, user.user_id)
        .await?;
    Ok(success_response(outcome))
}

/// POST /queue/leave
async fn leave(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<JoinRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state
        .services
        .queue
        .leave(payload.event_id, user.user_id)
        .await?;
    Ok(success_response(json!({"removed": removed})))
}

struct PositionStream {
    service: QueueAdmissionService,
    event_id: Uuid,
    user_id: Uuid,
    rx: mpsc::Receiver<String>,
    pending_pass: Option<String>,
    deadline: Instant,
    done: bool,
}

/// GET /queue/position/:event_id/stream
///
/// SSE stream: `position` events with `{position, estimated_wait}` on a
/// heartbeat, then one terminal `queue_pass` event when the release worker
/// admits the user. The pass subscription is opened before the first
/// position read so an admission in between cannot be missed.
async fn position_stream(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(event_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let service = state.services.queue.clone();
    let rx = service.subscribe_pass(event_id, user.user_id).await?;
    // A pass minted while the client was disconnected is delivered
    // immediately on reconnect.
    let pending_pass = service.peek_pass(event_id, user.user_id).await?;

    let stream_state = PositionStream {
        service,
        event_id,
        user_id: user.user_id,
        rx,
        pending_pass,
        deadline: Instant::now() + Duration::from_secs(state.config.queue_stream_max_secs),
        done: false,
    };

    let stream = stream::unfold(stream_state, |mut st| async move {
        if st.done {
            return None;
        }
        if let Some(token) = st.pending_pass.take() {
            st.done = true;
            return Some((Ok(pass_event(&token)), st));
        }

        tokio::select! {
            token = st.rx.recv() => {
                match token {
                    Some(token) => {
                        st.done = true;
                        Some((Ok(pass_event(&token)), st))
                    }
                    None => None,
                }
            }
            _ = tokio::time::sleep(POSITION_HEARTBEAT) => {
                if Instant::now() >= st.deadline {
                    debug!(event_id = %st.event_id, "queue stream hit server-side cutoff");
                    return None;
                }
                let update = st
                    .service
                    .position(st.event_id, st.user_id)
                    .await
                    .ok()
                    .flatten();
                let payload = match update {
                    Some(update) => json!({
                        "position": update.position,
                        "queue_len": update.queue_len,
                        "estimated_wait": update.estimated_wait_secs,
                    }),
                    // Popped but the pass has not landed yet.
                    None => json!({"position": 0, "estimated_wait": 0}),
                };
                Some((
                    Ok(SseEvent::default().event("position").data(payload.to_string())),
                    st,
                ))
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn pass_event(token: &str) -> SseEvent {
    SseEvent::default()
        .event("queue_pass")
        .data(json!({"queue_pass": token}).to_string())
}

pub fn queue_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/join", post(join))
        .route("/leave", post(leave))
        .route("/position/:event_id/stream", get(position_stream))
}
