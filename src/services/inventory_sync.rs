//! Inventory sync worker.
//!
//! Folds booking lifecycle events into the durable `zone_inventory` read
//! model in batches. This table is for reporting and cold-cache rebuilds;
//! the hot store remains the source of truth for live availability.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::{
    seat_zone::{self, Entity as SeatZoneEntity},
    zone_inventory::{self, Entity as ZoneInventoryEntity},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventHandler};
use crate::inventory::InventoryStore;

/// Pending availability deltas per zone, folded between flushes.
#[derive(Default)]
struct PendingDeltas {
    by_zone: HashMap<Uuid, ZoneDelta>,
}

#[derive(Clone, Copy)]
struct ZoneDelta {
    event_id: Uuid,
    delta: i64,
}

#[derive(Clone)]
pub struct InventorySyncService {
    db: Arc<DatabaseConnection>,
    pending: Arc<Mutex<PendingDeltas>>,
}

impl InventorySyncService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            pending: Arc::new(Mutex::new(PendingDeltas::default())),
        }
    }

    fn record_delta(&self, zone_id: Uuid, event_id: Uuid, delta: i64) {
        let mut pending = self.pending.lock().expect("pending deltas poisoned");
        let entry = pending
            .by_zone
            .entry(zone_id)
            .or_insert(ZoneDelta { event_id, delta: 0 });
        entry.delta += delta;
    }

    /// Batch loop; flushes folded deltas on the given interval.
    pub async fn run(self, flush_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("inventory sync worker started");
        let mut ticker = interval(flush_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Final flush so deltas are not lost on teardown.
                        if let Err(e) = self.flush_once().await {
                            error!(error = %e, "final inventory sync flush failed");
                        }
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_once().await {
                        error!(error = %e, "inventory sync flush failed");
                    }
                }
            }
        }
        info!("inventory sync worker stopped");
    }

    /// Applies all folded deltas to `zone_inventory`. Zones without a row
    /// yet are initialized from the catalog's declared capacity.
    #[instrument(skip(self))]
    pub async fn flush_once(&self) -> Result<usize, ServiceError> {
        let drained: Vec<(Uuid, ZoneDelta)> = {
            let mut pending = self.pending.lock().expect("pending deltas poisoned");
            pending.by_zone.drain().collect()
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let mut applied = 0usize;
        for (zone_id, change) in drained {
            if change.delta == 0 {
                continue;
            }
            match self.apply_delta(zone_id, change).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(zone_id = %zone_id, error = %e, "failed to apply inventory delta");
                    // Put the delta back so the next flush retries it.
                    self.record_delta(zone_id, change.event_id, change.delta);
                }
            }
        }
        debug!(applied, "inventory sync flush complete");
        Ok(applied)
    }

    async fn apply_delta(&self, zone_id: Uuid, change: ZoneDelta) -> Result<(), ServiceError> {
        let existing = ZoneInventoryEntity::find_by_id(zone_id).one(&*self.db).await?;
        match existing {
            Some(row) => {
                let mut active: zone_inventory::ActiveModel = row.clone().into();
                active.available = Set(row.available + change.delta as i32);
                active.updated_at = Set(Utc::now());
                active.update(&*self.db).await?;
            }
            None => {
                let capacity = SeatZoneEntity::find_by_id(zone_id)
                    .one(&*self.db)
                    .await?
                    .map(|z| z.capacity)
                    .unwrap_or(0);
                let row = zone_inventory::ActiveModel {
                    zone_id: Set(zone_id),
                    event_id: Set(change.event_id),
                    total_capacity: Set(capacity),
                    available: Set(capacity + change.delta as i32),
                    updated_at: Set(Utc::now()),
                };
                row.insert(&*self.db).await?;
            }
        }
        Ok(())
    }

    /// Cold-cache seeding: publishes durable availability for every zone
    /// whose hot key is absent. Run at startup before traffic arrives.
    #[instrument(skip(self, inventory))]
    pub async fn seed_cold_cache(
        &self,
        inventory: &dyn InventoryStore,
    ) -> Result<usize, ServiceError> {
        let rows = ZoneInventoryEntity::find().all(&*self.db).await?;
        let mut seeded = 0usize;
        for row in rows {
            let written = inventory
                .seed_availability(row.zone_id, row.available as i64, false)
                .await
                .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;
            if written {
                seeded += 1;
            }
        }
        if seeded > 0 {
            info!(seeded, "seeded cold inventory cache from durable store");
        }
        Ok(seeded)
    }

    /// Rows for a given event (reporting).
    pub async fn zones_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<zone_inventory::Model>, ServiceError> {
        Ok(ZoneInventoryEntity::find()
            .filter(zone_inventory::Column::EventId.eq(event_id))
            .all(&*self.db)
            .await?)
    }
}

#[async_trait]
impl EventHandler for InventorySyncService {
    async fn handle_event(&self, event: Event) -> Result<(), String> {
        match event {
            Event::BookingReserved {
                zone_id,
                event_id,
                quantity,
                ..
            } => {
                self.record_delta(zone_id, event_id, -(quantity as i64));
            }
            Event::BookingCancelled {
                zone_id,
                event_id,
                quantity,
                ..
            }
            | Event::BookingExpired {
                zone_id,
                event_id,
                quantity,
                ..
            } => {
                self.record_delta(zone_id, event_id, quantity as i64);
            }
            // A confirm keeps the seats deducted; nothing moves.
            Event::BookingConfirmed { .. } => {}
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> InventorySyncService {
        // The DB connection is only touched by flush; delta folding is pure.
        InventorySyncService {
            db: Arc::new(DatabaseConnection::Disconnected),
            pending: Arc::new(Mutex::new(PendingDeltas::default())),
        }
    }

    #[tokio::test]
    async fn deltas_fold_per_zone() {
        let sync = service();
        let zone = Uuid::new_v4();
        let event = Uuid::new_v4();

        sync.handle_event(Event::BookingReserved {
            booking_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            event_id: event,
            zone_id: zone,
            quantity: 3,
        })
        .await
        .unwrap();
        sync.handle_event(Event::BookingExpired {
            booking_id: Uuid::new_v4(),
            event_id: event,
            zone_id: zone,
            quantity: 1,
        })
        .await
        .unwrap();

        let pending = sync.pending.lock().unwrap();
        assert_eq!(pending.by_zone.get(&zone).unwrap().delta, -2);
    }

    #[tokio::test]
    async fn confirm_leaves_deltas_untouched() {
        let sync = service();
        sync.handle_event(Event::BookingConfirmed {
            booking_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            zone_id: Uuid::new_v4(),
            quantity: 2,
            payment_id: None,
        })
        .await
        .unwrap();
        assert!(sync.pending.lock().unwrap().by_zone.is_empty());
    }
}
