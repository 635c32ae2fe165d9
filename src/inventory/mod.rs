//! Live inventory store.
//!
//! The inventory store is the authoritative view of seat availability during
//! a sale. All mutation goes through atomic scripts so that
//! check-and-decrement can never interleave; the durable store only ever
//! sees the outcome.
//!
//! Two backends implement [`InventoryStore`]: [`RedisInventoryStore`] runs
//! the Lua scripts in `scripts.rs` against Redis, and
//! [`InMemoryInventoryStore`] mirrors the same semantics behind a mutex for
//! tests and single-process deployments.

mod memory;
mod redis_store;
pub mod scripts;

pub use memory::InMemoryInventoryStore;
pub use redis_store::RedisInventoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Key layout shared by both backends.
pub mod keys {
    use uuid::Uuid;

    pub fn zone_availability(zone_id: Uuid) -> String {
        format!("zone:availability:{}", zone_id)
    }

    pub fn user_tally(user_id: Uuid, event_id: Uuid) -> String {
        format!("user:reservations:{}:{}", user_id, event_id)
    }

    pub fn reservation(booking_id: Uuid) -> String {
        format!("reservation:{}", booking_id)
    }

    /// Terminal marker left behind when a reservation key is removed, so
    /// that release/expiry retries stay idempotent after the hash is gone.
    pub fn reservation_tombstone(booking_id: Uuid) -> String {
        format!("reservation:tombstone:{}", booking_id)
    }

    pub fn queue(event_id: Uuid) -> String {
        format!("queue:{}", event_id)
    }

    pub fn queue_user(event_id: Uuid, user_id: Uuid) -> String {
        format!("queue:user:{}:{}", event_id, user_id)
    }

    pub fn queue_pass(event_id: Uuid, user_id: Uuid) -> String {
        format!("queue:pass:{}:{}", event_id, user_id)
    }

    /// Sorted set of outstanding passes per event, scored by expiry epoch
    /// millis; lets the release worker count live passes without scanning.
    pub fn queue_pass_index(event_id: Uuid) -> String {
        format!("queue:passes:{}", event_id)
    }

    pub fn queue_config(event_id: Uuid) -> String {
        format!("queue:config:{}", event_id)
    }

    /// Set of event ids with at least one queue join since startup.
    pub fn queue_events() -> String {
        "queue:events".to_string()
    }
}

/// Errors surfaced by the atomic scripts.
///
/// Codes match the script replies one-to-one; [`InventoryError::into_service_error`]
/// translates them into the public taxonomy.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("zone {zone_id} has no availability entry")]
    ZoneNotFound { zone_id: Uuid },

    #[error("insufficient stock: {available} available")]
    InsufficientStock { available: i64 },

    #[error("user limit exceeded: user already holds {current}")]
    UserLimitExceeded { current: i64 },

    #[error("reservation missing or expired")]
    ReservationNotFound,

    #[error("reservation already released")]
    AlreadyReleased,

    #[error("reservation belongs to another user or booking")]
    OwnerMismatch,

    #[error("reservation already confirmed")]
    AlreadyConfirmed {
        confirmed_at: Option<DateTime<Utc>>,
    },

    #[error("user already queued at position {position}")]
    AlreadyInQueue { position: i64, queue_len: i64 },

    #[error("queue is full ({queue_len} waiting)")]
    QueueFull { queue_len: i64 },

    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("store i/o error: {0}")]
    Io(String),
}

impl InventoryError {
    /// Maps a script error onto the public error taxonomy for a given zone
    /// and request quantity.
    pub fn into_service_error(self, zone_id: Uuid, requested: i64, cap: i64) -> ServiceError {
        match self {
            InventoryError::ZoneNotFound { zone_id } => {
                ServiceError::NotFound(format!("zone {} is not on sale", zone_id))
            }
            InventoryError::InsufficientStock { available } => ServiceError::InsufficientStock {
                zone_id: zone_id.to_string(),
                requested,
                available,
            },
            InventoryError::UserLimitExceeded { current } => ServiceError::MaxPerUserExceeded {
                current,
                requested,
                cap,
            },
            InventoryError::ReservationNotFound | InventoryError::AlreadyReleased => {
                ServiceError::ReservationExpired("reservation missing or expired".to_string())
            }
            InventoryError::OwnerMismatch => {
                ServiceError::Forbidden("reservation belongs to another user".to_string())
            }
            InventoryError::AlreadyConfirmed { .. } => {
                ServiceError::Conflict("reservation already confirmed".to_string())
            }
            InventoryError::AlreadyInQueue { position, .. } => {
                ServiceError::Conflict(format!("already in queue at position {}", position))
            }
            InventoryError::QueueFull { queue_len } => {
                ServiceError::Conflict(format!("queue is full ({} waiting)", queue_len))
            }
            InventoryError::Validation(msg) => ServiceError::Validation(msg),
            InventoryError::Io(msg) => ServiceError::InventoryStore(msg),
        }
    }
}

/// Arguments for the reserve script.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub zone_id: Uuid,
    pub event_id: Uuid,
    pub show_id: Uuid,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub max_per_user: i64,
    pub ttl: Duration,
}

/// Successful reserve outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveOk {
    pub remaining: i64,
    pub user_tally: i64,
    /// True when the script found the reservation hash already written for
    /// this booking id (a retried request) and applied no new deduction.
    pub already_reserved: bool,
}

/// Successful release outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOk {
    pub availability: i64,
    pub user_tally: i64,
}

/// Who is asking for a release. Only saga compensation may undo a
/// confirmed reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    ReservedOnly,
    Compensation,
}

/// Confirm outcome; already-confirmed is success-shaped for idempotency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed { confirmed_at: DateTime<Utc> },
    AlreadyConfirmed { confirmed_at: Option<DateTime<Utc>> },
}

/// Outcome of the expiry worker's release path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiredReleaseOutcome {
    /// Reservation hash was still present and has been released.
    Released { availability: i64 },
    /// Hash already gone (TTL fired); availability restored from the
    /// caller-provided quantity, exactly once.
    Restored { availability: i64 },
    /// Another scan already restored this booking.
    AlreadyRestored,
    /// A confirm won the race; nothing to release.
    AlreadyConfirmed,
}

/// Live reservation record as held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRecord {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub zone_id: Uuid,
    pub event_id: Uuid,
    pub show_id: Uuid,
    pub quantity: i64,
    pub unit_price: String,
    pub status: ReservationState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub payment_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Reserved,
    Confirmed,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "reserved",
            ReservationState::Confirmed => "confirmed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(ReservationState::Reserved),
            "confirmed" => Some(ReservationState::Confirmed),
            _ => None,
        }
    }
}

/// Successful queue join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueJoinOk {
    /// 1-based FIFO position.
    pub position: i64,
    pub queue_len: i64,
}

/// Current queue standing for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePosition {
    pub position: i64,
    pub queue_len: i64,
}

/// Atomic operations over the live inventory and queue state.
///
/// Everything here corresponds to one script execution (or one command) on
/// the backing store; callers never see intermediate state.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Check-and-decrement under per-user quota. See the reserve script.
    async fn reserve(&self, req: &ReserveRequest) -> Result<ReserveOk, InventoryError>;

    /// Returns a reserved quantity to the zone and drops the reservation.
    async fn release(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        zone_id: Uuid,
        event_id: Uuid,
        mode: ReleaseMode,
    ) -> Result<ReleaseOk, InventoryError>;

    /// Marks a reservation confirmed and makes its key permanent.
    async fn confirm(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        payment_id: Option<&str>,
    ) -> Result<ConfirmOutcome, InventoryError>;

    /// Expiry-path release that also handles a reservation key the TTL
    /// already removed, restoring availability exactly once.
    async fn release_expired(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        zone_id: Uuid,
        event_id: Uuid,
        quantity: i64,
    ) -> Result<ExpiredReleaseOutcome, InventoryError>;

    /// Current availability for a zone, if seeded.
    async fn availability(&self, zone_id: Uuid) -> Result<Option<i64>, InventoryError>;

    /// Live reservation record, if present.
    async fn reservation(
        &self,
        booking_id: Uuid,
    ) -> Result<Option<ReservationRecord>, InventoryError>;

    /// Seeds a zone's availability counter. With `force` false the write
    /// only happens when the key is absent (cold-cache rebuild); with
    /// `force` true it overwrites (administrative catalog sync).
    async fn seed_availability(
        &self,
        zone_id: Uuid,
        value: i64,
        force: bool,
    ) -> Result<bool, InventoryError>;

    /// FIFO queue join; ties on the same millisecond break by user id.
    async fn join_queue(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        max_queue_size: i64,
        meta_ttl: Duration,
    ) -> Result<QueueJoinOk, InventoryError>;

    /// 1-based position, or None when the user is not queued.
    async fn queue_position(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<QueuePosition>, InventoryError>;

    /// Removes a user from the queue; true when they were present.
    async fn leave_queue(&self, event_id: Uuid, user_id: Uuid) -> Result<bool, InventoryError>;

    /// `max_concurrent` for an event's queue, when configured.
    async fn queue_max_concurrent(&self, event_id: Uuid) -> Result<Option<i64>, InventoryError>;

    /// Writes `max_concurrent` for an event's queue.
    async fn set_queue_max_concurrent(
        &self,
        event_id: Uuid,
        max_concurrent: i64,
    ) -> Result<(), InventoryError>;

    /// Event ids that have seen queue activity.
    async fn active_queue_events(&self) -> Result<Vec<Uuid>, InventoryError>;

    /// Pops up to `count` users in FIFO order.
    async fn pop_queue_batch(
        &self,
        event_id: Uuid,
        count: i64,
    ) -> Result<Vec<Uuid>, InventoryError>;

    /// Number of unexpired bypass passes outstanding for an event.
    async fn count_active_passes(&self, event_id: Uuid) -> Result<i64, InventoryError>;

    /// Stores a freshly minted pass for a user.
    async fn put_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        token: &str,
        ttl: Duration,
    ) -> Result<(), InventoryError>;

    /// Reads a stored pass without consuming it.
    async fn peek_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<String>, InventoryError>;

    /// Consumes a pass (single use): returns and deletes it atomically.
    async fn take_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<String>, InventoryError>;

    /// Publishes a pass on the per-user channel for SSE delivery.
    async fn publish_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        token: &str,
    ) -> Result<(), InventoryError>;

    /// Subscribes to the per-user pass channel. The receiver yields the
    /// token when (if) it is published.
    async fn subscribe_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<mpsc::Receiver<String>, InventoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let zone = Uuid::nil();
        let user = Uuid::nil();
        let event = Uuid::nil();
        assert_eq!(
            keys::zone_availability(zone),
            format!("zone:availability:{}", zone)
        );
        assert_eq!(
            keys::user_tally(user, event),
            format!("user:reservations:{}:{}", user, event)
        );
        assert_eq!(
            keys::queue_pass(event, user),
            format!("queue:pass:{}:{}", event, user)
        );
        assert_eq!(keys::queue_events(), "queue:events");
    }

    #[test]
    fn script_errors_map_to_taxonomy() {
        let zone = Uuid::new_v4();
        let err = InventoryError::InsufficientStock { available: 1 }.into_service_error(zone, 2, 4);
        assert_eq!(err.code(), "INSUFFICIENT_STOCK");

        let err = InventoryError::UserLimitExceeded { current: 3 }.into_service_error(zone, 2, 4);
        assert_eq!(err.code(), "MAX_PER_USER_EXCEEDED");

        let err = InventoryError::ReservationNotFound.into_service_error(zone, 1, 4);
        assert_eq!(err.code(), "RESERVATION_EXPIRED");

        let err = InventoryError::ZoneNotFound { zone_id: zone }.into_service_error(zone, 1, 4);
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn reservation_state_round_trips() {
        assert_eq!(ReservationState::parse("reserved"), Some(ReservationState::Reserved));
        assert_eq!(ReservationState::parse("confirmed"), Some(ReservationState::Confirmed));
        assert_eq!(ReservationState::parse("bogus"), None);
        assert_eq!(ReservationState::Reserved.as_str(), "reserved");
    }
}
