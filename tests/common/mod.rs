//! Shared test fixtures: an in-memory SQLite durable store with the full
//! schema, an in-memory inventory store, and seeded catalog rows.
#![allow(dead_code)]

use chrono::Utc;
use migrations::{Migrator, MigratorTrait};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, DatabaseConnection, Set};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use bookrush_api::entities::{seat_zone, ticket_event};
use bookrush_api::inventory::{InMemoryInventoryStore, InventoryStore};
use bookrush_api::services::{BookingService, CatalogService};

pub struct TestHarness {
    pub db: Arc<DatabaseConnection>,
    pub inventory: Arc<InMemoryInventoryStore>,
    pub bookings: BookingService,
    pub catalog: CatalogService,
    pub event_id: Uuid,
    pub show_id: Uuid,
    pub zone_id: Uuid,
}

/// Payment window used throughout the tests.
pub const PAYMENT_WINDOW: Duration = Duration::from_secs(600);

pub async fn connect_test_db() -> Arc<DatabaseConnection> {
    // A single pooled connection keeps every session on the same
    // in-memory database.
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await.expect("sqlite connect");
    Migrator::up(&db, None).await.expect("migrations");
    Arc::new(db)
}

/// Full harness: schema, one event with one zone, hot cache seeded.
pub async fn harness() -> TestHarness {
    harness_full(4, 10, false, PAYMENT_WINDOW).await
}

pub async fn harness_with(max_per_user: i32, capacity: i32, queue_enabled: bool) -> TestHarness {
    harness_full(max_per_user, capacity, queue_enabled, PAYMENT_WINDOW).await
}

/// Harness with a custom payment window; a zero window makes reservations
/// expire immediately, which the expiry tests rely on.
pub async fn harness_with_payment_window(window: Duration) -> TestHarness {
    harness_full(4, 10, false, window).await
}

pub async fn harness_full(
    max_per_user: i32,
    capacity: i32,
    queue_enabled: bool,
    payment_window: Duration,
) -> TestHarness {
    let db = connect_test_db().await;
    let inventory = Arc::new(InMemoryInventoryStore::new());

    let event_id = Uuid::new_v4();
    let show_id = Uuid::new_v4();
    let zone_id = Uuid::new_v4();
    let now = Utc::now();

    ticket_event::ActiveModel {
        id: Set(event_id),
        name: Set("Flash Sale Concert".to_string()),
        max_per_user: Set(max_per_user),
        queue_enabled: Set(queue_enabled),
        tenant_id: Set(None),
        created_at: Set(now),
    }
    .insert(&*db)
    .await
    .expect("seed event");

    seat_zone::ActiveModel {
        id: Set(zone_id),
        event_id: Set(event_id),
        show_id: Set(show_id),
        name: Set("GA Floor".to_string()),
        capacity: Set(capacity),
        unit_price: Set(Decimal::new(5000, 2)),
        created_at: Set(now),
    }
    .insert(&*db)
    .await
    .expect("seed zone");

    inventory
        .seed_availability(zone_id, capacity as i64, true)
        .await
        .expect("seed availability");

    let catalog = CatalogService::new(db.clone());
    let bookings = BookingService::new(
        db.clone(),
        inventory.clone(),
        catalog.clone(),
        payment_window,
    );

    TestHarness {
        db,
        inventory,
        bookings,
        catalog,
        event_id,
        show_id,
        zone_id,
    }
}
