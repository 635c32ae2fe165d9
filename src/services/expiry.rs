//! Expiry worker.
//!
//! Releases seats whose reservations passed the payment deadline unpaid.
//! The inventory script runs first; the booking row only moves to
//! `expired` when the store agreed the reservation was not confirmed.
//! A row that a confirm won in the meantime is left untouched.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info, instrument, warn};

use crate::entities::booking::{self, BookingStatus, Entity as BookingEntity};
use crate::errors::ServiceError;
use crate::events::{outbox, Event};
use crate::inventory::{ExpiredReleaseOutcome, InventoryStore};

const SCAN_BATCH: u64 = 500;

/// Result of one expiry pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpiryPassResult {
    /// Rows transitioned to `expired`.
    pub expired: u64,
    /// Rows skipped because a confirm won the race.
    pub confirmed_races: u64,
    /// Rows another worker handled first.
    pub skipped: u64,
}

#[derive(Clone)]
pub struct ExpiryWorker {
    db: Arc<DatabaseConnection>,
    inventory: Arc<dyn InventoryStore>,
}

impl ExpiryWorker {
    pub fn new(db: Arc<DatabaseConnection>, inventory: Arc<dyn InventoryStore>) -> Self {
        Self { db, inventory }
    }

    /// Loop entry point; scans on the given interval until shutdown.
    pub async fn run(self, scan_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("expiry worker started");
        let mut ticker = interval(scan_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(result) if result.expired > 0 => {
                            info!(
                                expired = result.expired,
                                confirmed_races = result.confirmed_races,
                                "expiry pass released overdue reservations"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "expiry pass failed"),
                    }
                }
            }
        }
        info!("expiry worker stopped");
    }

    /// One scan: release every overdue `reserved` booking and mark it
    /// expired. Idempotent; safe to run concurrently with confirms and
    /// other scans.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ExpiryPassResult, ServiceError> {
        let now = Utc::now();
        let overdue = BookingEntity::find()
            .filter(booking::Column::Status.eq(BookingStatus::Reserved.as_str()))
            .filter(booking::Column::ExpiresAt.lt(now))
            .order_by_asc(booking::Column::ExpiresAt)
            .limit(SCAN_BATCH)
            .all(&*self.db)
            .await?;

        let mut result = ExpiryPassResult::default();
        for row in overdue {
            match self.expire_one(&row).await {
                Ok(Outcome::Expired) => result.expired += 1,
                Ok(Outcome::ConfirmRace) => result.confirmed_races += 1,
                Ok(Outcome::Skipped) => result.skipped += 1,
                Err(e) => {
                    warn!(booking_id = %row.id, error = %e, "failed to expire booking");
                }
            }
        }
        Ok(result)
    }

    async fn expire_one(&self, row: &booking::Model) -> Result<Outcome, ServiceError> {
        let outcome = self
            .inventory
            .release_expired(
                row.id,
                row.user_id,
                row.zone_id,
                row.event_id,
                row.quantity as i64,
            )
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;

        if matches!(outcome, ExpiredReleaseOutcome::AlreadyConfirmed) {
            // The confirm script ran first; its worker owns the row now.
            return Ok(Outcome::ConfirmRace);
        }

        let txn = self.db.begin().await?;
        let updated = BookingEntity::update_many()
            .col_expr(
                booking::Column::Status,
                Expr::value(BookingStatus::Expired.as_str()),
            )
            .col_expr(booking::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(booking::Column::Id.eq(row.id))
            .filter(booking::Column::Status.eq(BookingStatus::Reserved.as_str()))
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(Outcome::Skipped);
        }

        outbox::enqueue(
            &txn,
            "booking",
            Some(row.id),
            &Event::BookingExpired {
                booking_id: row.id,
                event_id: row.event_id,
                zone_id: row.zone_id,
                quantity: row.quantity,
            },
        )
        .await?;
        txn.commit().await?;
        Ok(Outcome::Expired)
    }
}

enum Outcome {
    Expired,
    ConfirmRace,
    Skipped,
}
