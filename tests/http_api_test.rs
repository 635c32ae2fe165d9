//! HTTP surface tests: auth enforcement, response envelope, error codes.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use bookrush_api::auth::Claims;
use bookrush_api::config::{AppConfig, RateLimitConfig};
use bookrush_api::{handlers, AppState};
use common::TestHarness;

const JWT_SECRET: &str = "test-jwt-secret-test-jwt-secret-test";

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        redis_url: "redis://localhost:6379".into(),
        jwt_secret: JWT_SECRET.into(),
        queue_pass_secret: "queue-pass-secret-queue-pass-secret!".into(),
        host: "127.0.0.1".into(),
        port: 0,
        environment: "test".into(),
        log_level: "error".into(),
        log_json: false,
        auto_migrate: false,
        payment_window_secs: 600,
        saga_step_timeout_secs: 30,
        saga_run_timeout_secs: 60,
        saga_max_retries: 3,
        queue_pass_ttl_secs: 300,
        queue_release_interval_secs: 1,
        queue_stream_max_secs: 900,
        expiry_scan_interval_secs: 60,
        inventory_sync_interval_secs: 5,
        outbox_poll_interval_ms: 500,
        mq_backend: "in-memory".into(),
        mq_namespace: "test:mq".into(),
        request_timeout_secs: 10,
        rate_limit: RateLimitConfig::default(),
        db_max_connections: 1,
        db_min_connections: 1,
        db_connect_timeout_secs: 5,
        db_acquire_timeout_secs: 5,
    }
}

fn bearer(user_id: Uuid) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        tenant_id: None,
        iat: now,
        exp: now + 3600,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}

async fn app(h: &TestHarness) -> axum::Router {
    let state = Arc::new(AppState::new(
        test_config(),
        h.db.clone(),
        h.inventory.clone(),
    ));
    handlers::router(state)
}

async fn body_json(body: Body) -> Value {
    let bytes = to_bytes(body, usize::MAX).await.expect("body read");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_is_open() {
    let h = common::harness().await;
    let app = app(&h).await;

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn bookings_require_a_bearer_token() {
    let h = common::harness().await;
    let app = app(&h).await;

    let response = app
        .oneshot(Request::get("/bookings/pending").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(response.into_body()).await;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"]["code"], json!("UNAUTHORIZED"));
}

#[tokio::test]
async fn reserve_round_trips_through_the_envelope() {
    let h = common::harness().await;
    let app = app(&h).await;
    let user = Uuid::new_v4();

    let request = Request::post("/bookings/reserve")
        .header(header::AUTHORIZATION, bearer(user))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "event_id": h.event_id,
                "show_id": h.show_id,
                "zone_id": h.zone_id,
                "quantity": 2,
                "idempotency_key": "http-checkout-1",
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["quantity"], json!(2));
    assert_eq!(body["data"]["status"], json!("reserved"));
    assert_eq!(body["data"]["remaining_availability"], json!(8));
}

#[tokio::test]
async fn insufficient_stock_maps_to_conflict() {
    let h = common::harness_with(4, 1, false).await;
    let app = app(&h).await;

    let reserve = |user: Uuid, key: &str| {
        Request::post("/bookings/reserve")
            .header(header::AUTHORIZATION, bearer(user))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "event_id": h.event_id,
                    "show_id": h.show_id,
                    "zone_id": h.zone_id,
                    "quantity": 1,
                    "idempotency_key": key,
                })
                .to_string(),
            ))
            .unwrap()
    };

    let first = app.clone().oneshot(reserve(Uuid::new_v4(), "k1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(reserve(Uuid::new_v4(), "k2")).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body = body_json(second.into_body()).await;
    assert_eq!(body["error"]["code"], json!("INSUFFICIENT_STOCK"));
}

#[tokio::test]
async fn queued_event_rejects_reserve_without_pass() {
    let h = common::harness_with(4, 10, true).await;
    let app = app(&h).await;

    let request = Request::post("/bookings/reserve")
        .header(header::AUTHORIZATION, bearer(Uuid::new_v4()))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "event_id": h.event_id,
                "show_id": h.show_id,
                "zone_id": h.zone_id,
                "quantity": 1,
                "idempotency_key": "no-pass",
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], json!("UNAUTHORIZED"));
}

#[tokio::test]
async fn queue_join_returns_position() {
    let h = common::harness().await;
    let app = app(&h).await;

    let request = Request::post("/queue/join")
        .header(header::AUTHORIZATION, bearer(Uuid::new_v4()))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"event_id": h.event_id}).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"]["position"], json!(1));
}
