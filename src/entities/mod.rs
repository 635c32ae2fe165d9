//! SeaORM entities for the durable store.
//!
//! `booking`, `saga_instance`, `outbox_event`, `payment` and
//! `zone_inventory` are owned by this service. The catalog entities
//! (`ticket_event`, `show`, `seat_zone`) are read-only projections of tables
//! owned by the ticketing catalog service.

pub mod booking;
pub mod outbox_event;
pub mod payment;
pub mod saga_instance;
pub mod seat_zone;
pub mod show;
pub mod ticket_event;
pub mod zone_inventory;
