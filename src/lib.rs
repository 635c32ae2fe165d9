//! bookrush-api
//!
//! High-concurrency ticket reservation engine: atomic inventory scripts on
//! Redis, a durable booking record with a transactional outbox, a
//! message-driven post-payment saga, and a virtual waiting room with
//! SSE-delivered bypass passes.

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod inventory;
pub mod message_queue;
pub mod queue;
pub mod rate_limiter;
pub mod saga;
pub mod services;
pub mod workers;

use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::inventory::InventoryStore;
use crate::queue::{PassSigner, QueueAdmissionService};
use crate::services::{BookingService, CatalogService, InventorySyncService};

/// Business services shared by handlers and workers.
#[derive(Clone)]
pub struct AppServices {
    pub bookings: BookingService,
    pub catalog: CatalogService,
    pub queue: QueueAdmissionService,
    pub inventory_sync: InventorySyncService,
}

impl AppServices {
    pub fn new(
        config: &AppConfig,
        db: Arc<DatabaseConnection>,
        inventory: Arc<dyn InventoryStore>,
    ) -> Self {
        let catalog = CatalogService::new(db.clone());
        let bookings = BookingService::new(
            db.clone(),
            inventory.clone(),
            catalog.clone(),
            Duration::from_secs(config.payment_window_secs),
        );
        let queue = QueueAdmissionService::new(
            inventory,
            PassSigner::new(&config.queue_pass_secret),
            Duration::from_secs(config.queue_pass_ttl_secs),
            Duration::from_secs(config.queue_release_interval_secs),
        );
        let inventory_sync = InventorySyncService::new(db);
        Self {
            bookings,
            catalog,
            queue,
            inventory_sync,
        }
    }
}

/// Application state shared with handlers. Initialized once at startup and
/// never mutated afterwards.
pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<DatabaseConnection>,
    pub inventory: Arc<dyn InventoryStore>,
    pub services: AppServices,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: Arc<DatabaseConnection>,
        inventory: Arc<dyn InventoryStore>,
    ) -> Self {
        let services = AppServices::new(&config, db.clone(), inventory.clone());
        Self {
            config,
            db,
            inventory,
            services,
        }
    }
}
