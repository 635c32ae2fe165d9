//! Read-only access to the ticketing catalog.
//!
//! The catalog tables are owned by the ticket service; the booking core
//! reads zone capacity/pricing and per-event caps from them, and pushes
//! zone capacity onto the hot store when a zone goes on sale.

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::entities::{
    seat_zone::{self, Entity as SeatZoneEntity},
    ticket_event::{self, Entity as TicketEventEntity},
};
use crate::errors::ServiceError;
use crate::inventory::InventoryStore;

#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn event(&self, event_id: Uuid) -> Result<ticket_event::Model, ServiceError> {
        TicketEventEntity::find_by_id(event_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("event {} not found", event_id)))
    }

    pub async fn zone(&self, zone_id: Uuid) -> Result<seat_zone::Model, ServiceError> {
        SeatZoneEntity::find_by_id(zone_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("zone {} not found", zone_id)))
    }

    pub async fn zones_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<seat_zone::Model>, ServiceError> {
        Ok(SeatZoneEntity::find()
            .filter(seat_zone::Column::EventId.eq(event_id))
            .all(&*self.db)
            .await?)
    }

    /// Administrative sync: pushes a zone's declared capacity onto the hot
    /// store, overwriting whatever is there. Used when a zone goes on sale
    /// or its capacity is re-declared.
    #[instrument(skip(self, inventory))]
    pub async fn sync_zone_to_inventory(
        &self,
        inventory: &dyn InventoryStore,
        zone_id: Uuid,
    ) -> Result<i64, ServiceError> {
        let zone = self.zone(zone_id).await?;
        let capacity = zone.capacity as i64;
        inventory
            .seed_availability(zone_id, capacity, true)
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;
        info!(zone_id = %zone_id, capacity, "synced zone capacity to inventory store");
        Ok(capacity)
    }
}
