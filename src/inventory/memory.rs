use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::{
    ConfirmOutcome, ExpiredReleaseOutcome, InventoryError, InventoryStore, QueueJoinOk,
    QueuePosition, ReleaseMode, ReleaseOk, ReservationRecord, ReservationState, ReserveOk,
    ReserveRequest,
};

/// In-memory inventory store.
///
/// One mutex around all state gives the same serialization guarantee the
/// Redis scripting engine provides; every trait method is a single critical
/// section. TTLs are evaluated lazily against wall-clock time, so a
/// reservation written with a zero TTL is immediately expired.
#[derive(Default)]
pub struct InMemoryInventoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    zones: HashMap<Uuid, i64>,
    tallies: HashMap<(Uuid, Uuid), i64>,
    reservations: HashMap<Uuid, StoredReservation>,
    tombstones: HashSet<Uuid>,
    /// (join ms, user id as string, user id) — the string component gives
    /// the same lexicographic tie-break Redis applies to equal zset scores.
    queues: HashMap<Uuid, BTreeSet<(i64, String, Uuid)>>,
    queue_configs: HashMap<Uuid, i64>,
    active_events: HashSet<Uuid>,
    passes: HashMap<(Uuid, Uuid), StoredPass>,
    pass_channels: HashMap<(Uuid, Uuid), broadcast::Sender<String>>,
}

#[derive(Clone)]
struct StoredReservation {
    record: ReservationRecord,
    ttl_expires_at: Option<DateTime<Utc>>,
}

impl StoredReservation {
    fn live(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_expires_at {
            Some(deadline) => deadline > now,
            None => true,
        }
    }
}

struct StoredPass {
    token: String,
    expires_at: DateTime<Utc>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pass_sender(
        state: &mut State,
        event_id: Uuid,
        user_id: Uuid,
    ) -> broadcast::Sender<String> {
        state
            .pass_channels
            .entry((event_id, user_id))
            .or_insert_with(|| broadcast::channel(4).0)
            .clone()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn reserve(&self, req: &ReserveRequest) -> Result<ReserveOk, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let now = Utc::now();

        if req.quantity <= 0 {
            return Err(InventoryError::Validation(
                "quantity must be positive".to_string(),
            ));
        }
        let Some(&available) = state.zones.get(&req.zone_id) else {
            return Err(InventoryError::ZoneNotFound {
                zone_id: req.zone_id,
            });
        };

        let tally_key = (req.user_id, req.event_id);
        let tally = state.tallies.get(&tally_key).copied().unwrap_or(0);

        if let Some(existing) = state.reservations.get(&req.booking_id) {
            if existing.live(now) {
                return Ok(ReserveOk {
                    remaining: available,
                    user_tally: tally,
                    already_reserved: true,
                });
            }
            state.reservations.remove(&req.booking_id);
        }

        if available < req.quantity {
            return Err(InventoryError::InsufficientStock { available });
        }
        if req.max_per_user > 0 && tally + req.quantity > req.max_per_user {
            return Err(InventoryError::UserLimitExceeded { current: tally });
        }

        let remaining = available - req.quantity;
        let new_tally = tally + req.quantity;
        state.zones.insert(req.zone_id, remaining);
        state.tallies.insert(tally_key, new_tally);

        let ttl = ChronoDuration::from_std(req.ttl).unwrap_or_else(|_| ChronoDuration::zero());
        let expires_at = now + ttl;
        state.reservations.insert(
            req.booking_id,
            StoredReservation {
                record: ReservationRecord {
                    booking_id: req.booking_id,
                    user_id: req.user_id,
                    zone_id: req.zone_id,
                    event_id: req.event_id,
                    show_id: req.show_id,
                    quantity: req.quantity,
                    unit_price: req.unit_price.to_string(),
                    status: ReservationState::Reserved,
                    created_at: now,
                    expires_at,
                    confirmed_at: None,
                    payment_id: None,
                },
                ttl_expires_at: Some(expires_at),
            },
        );

        Ok(ReserveOk {
            remaining,
            user_tally: new_tally,
            already_reserved: false,
        })
    }

    async fn release(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        zone_id: Uuid,
        event_id: Uuid,
        mode: ReleaseMode,
    ) -> Result<ReleaseOk, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let now = Utc::now();

        let entry = match state.reservations.get(&booking_id) {
            Some(entry) if entry.live(now) => entry.clone(),
            _ => {
                if state.tombstones.contains(&booking_id) {
                    return Err(InventoryError::AlreadyReleased);
                }
                return Err(InventoryError::ReservationNotFound);
            }
        };

        if entry.record.booking_id != booking_id {
            return Err(InventoryError::ReservationNotFound);
        }
        if entry.record.user_id != user_id {
            return Err(InventoryError::OwnerMismatch);
        }
        match entry.record.status {
            ReservationState::Confirmed if mode != ReleaseMode::Compensation => {
                return Err(InventoryError::AlreadyConfirmed {
                    confirmed_at: entry.record.confirmed_at,
                })
            }
            _ => {}
        }

        let availability = {
            let slot = state.zones.entry(zone_id).or_insert(0);
            *slot += entry.record.quantity;
            *slot
        };
        let tally_key = (user_id, event_id);
        let user_tally = {
            let tally = state.tallies.entry(tally_key).or_insert(0);
            *tally -= entry.record.quantity;
            *tally
        };
        let user_tally = if user_tally <= 0 {
            state.tallies.remove(&tally_key);
            0
        } else {
            user_tally
        };
        state.reservations.remove(&booking_id);
        state.tombstones.insert(booking_id);

        Ok(ReleaseOk {
            availability,
            user_tally,
        })
    }

    async fn confirm(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        payment_id: Option<&str>,
    ) -> Result<ConfirmOutcome, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let now = Utc::now();

        let entry = match state.reservations.get_mut(&booking_id) {
            Some(entry) if entry.live(now) => entry,
            _ => return Err(InventoryError::ReservationNotFound),
        };
        if entry.record.user_id != user_id {
            return Err(InventoryError::OwnerMismatch);
        }
        if entry.record.status == ReservationState::Confirmed {
            return Ok(ConfirmOutcome::AlreadyConfirmed {
                confirmed_at: entry.record.confirmed_at,
            });
        }

        entry.record.status = ReservationState::Confirmed;
        entry.record.confirmed_at = Some(now);
        entry.record.payment_id = payment_id.map(|p| p.to_string());
        entry.ttl_expires_at = None;

        Ok(ConfirmOutcome::Confirmed { confirmed_at: now })
    }

    async fn release_expired(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        zone_id: Uuid,
        event_id: Uuid,
        quantity: i64,
    ) -> Result<ExpiredReleaseOutcome, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let now = Utc::now();

        let live_entry = state
            .reservations
            .get(&booking_id)
            .filter(|e| e.live(now))
            .cloned();

        if let Some(entry) = live_entry {
            if entry.record.booking_id != booking_id {
                return Err(InventoryError::ReservationNotFound);
            }
            if entry.record.status == ReservationState::Confirmed {
                return Ok(ExpiredReleaseOutcome::AlreadyConfirmed);
            }
            let availability = {
                let slot = state.zones.entry(zone_id).or_insert(0);
                *slot += entry.record.quantity;
                *slot
            };
            let tally_key = (user_id, event_id);
            if let Some(tally) = state.tallies.get_mut(&tally_key) {
                *tally -= entry.record.quantity;
                if *tally <= 0 {
                    state.tallies.remove(&tally_key);
                }
            }
            state.reservations.remove(&booking_id);
            state.tombstones.insert(booking_id);
            return Ok(ExpiredReleaseOutcome::Released { availability });
        }

        // TTL already dropped the hash (or it never survived): restore once.
        state.reservations.remove(&booking_id);
        if state.tombstones.insert(booking_id) {
            let availability = {
                let slot = state.zones.entry(zone_id).or_insert(0);
                *slot += quantity;
                *slot
            };
            let tally_key = (user_id, event_id);
            if let Some(tally) = state.tallies.get_mut(&tally_key) {
                *tally -= quantity;
                if *tally <= 0 {
                    state.tallies.remove(&tally_key);
                }
            }
            Ok(ExpiredReleaseOutcome::Restored { availability })
        } else {
            Ok(ExpiredReleaseOutcome::AlreadyRestored)
        }
    }

    async fn availability(&self, zone_id: Uuid) -> Result<Option<i64>, InventoryError> {
        let state = self.state.lock().expect("inventory state poisoned");
        Ok(state.zones.get(&zone_id).copied())
    }

    async fn reservation(
        &self,
        booking_id: Uuid,
    ) -> Result<Option<ReservationRecord>, InventoryError> {
        let state = self.state.lock().expect("inventory state poisoned");
        let now = Utc::now();
        Ok(state
            .reservations
            .get(&booking_id)
            .filter(|e| e.live(now))
            .map(|e| e.record.clone()))
    }

    async fn seed_availability(
        &self,
        zone_id: Uuid,
        value: i64,
        force: bool,
    ) -> Result<bool, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        if !force && state.zones.contains_key(&zone_id) {
            return Ok(false);
        }
        state.zones.insert(zone_id, value);
        Ok(true)
    }

    async fn join_queue(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        max_queue_size: i64,
        _meta_ttl: Duration,
    ) -> Result<QueueJoinOk, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let now_ms = Utc::now().timestamp_millis();

        let queue = state.queues.entry(event_id).or_default();
        if let Some(rank) = queue.iter().position(|(_, _, u)| *u == user_id) {
            return Err(InventoryError::AlreadyInQueue {
                position: rank as i64 + 1,
                queue_len: queue.len() as i64,
            });
        }
        let queue_len = queue.len() as i64;
        if max_queue_size > 0 && queue_len >= max_queue_size {
            return Err(InventoryError::QueueFull { queue_len });
        }

        queue.insert((now_ms, user_id.to_string(), user_id));
        let position = queue
            .iter()
            .position(|(_, _, u)| *u == user_id)
            .unwrap_or(0) as i64
            + 1;
        let queue_len = queue.len() as i64;
        state.active_events.insert(event_id);

        Ok(QueueJoinOk {
            position,
            queue_len,
        })
    }

    async fn queue_position(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<QueuePosition>, InventoryError> {
        let state = self.state.lock().expect("inventory state poisoned");
        let Some(queue) = state.queues.get(&event_id) else {
            return Ok(None);
        };
        Ok(queue
            .iter()
            .position(|(_, _, u)| *u == user_id)
            .map(|rank| QueuePosition {
                position: rank as i64 + 1,
                queue_len: queue.len() as i64,
            }))
    }

    async fn leave_queue(&self, event_id: Uuid, user_id: Uuid) -> Result<bool, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let Some(queue) = state.queues.get_mut(&event_id) else {
            return Ok(false);
        };
        let entry = queue.iter().find(|(_, _, u)| *u == user_id).cloned();
        match entry {
            Some(entry) => {
                queue.remove(&entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_max_concurrent(&self, event_id: Uuid) -> Result<Option<i64>, InventoryError> {
        let state = self.state.lock().expect("inventory state poisoned");
        Ok(state.queue_configs.get(&event_id).copied())
    }

    async fn set_queue_max_concurrent(
        &self,
        event_id: Uuid,
        max_concurrent: i64,
    ) -> Result<(), InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        state.queue_configs.insert(event_id, max_concurrent);
        state.active_events.insert(event_id);
        Ok(())
    }

    async fn active_queue_events(&self) -> Result<Vec<Uuid>, InventoryError> {
        let state = self.state.lock().expect("inventory state poisoned");
        Ok(state.active_events.iter().copied().collect())
    }

    async fn pop_queue_batch(
        &self,
        event_id: Uuid,
        count: i64,
    ) -> Result<Vec<Uuid>, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let Some(queue) = state.queues.get_mut(&event_id) else {
            return Ok(Vec::new());
        };
        let mut popped = Vec::new();
        while popped.len() < count.max(0) as usize {
            let Some(first) = queue.iter().next().cloned() else {
                break;
            };
            queue.remove(&first);
            popped.push(first.2);
        }
        Ok(popped)
    }

    async fn count_active_passes(&self, event_id: Uuid) -> Result<i64, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let now = Utc::now();
        state
            .passes
            .retain(|_, pass| pass.expires_at > now);
        Ok(state
            .passes
            .keys()
            .filter(|(event, _)| *event == event_id)
            .count() as i64)
    }

    async fn put_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        token: &str,
        ttl: Duration,
    ) -> Result<(), InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero());
        state.passes.insert(
            (event_id, user_id),
            StoredPass {
                token: token.to_string(),
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(())
    }

    async fn peek_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<String>, InventoryError> {
        let state = self.state.lock().expect("inventory state poisoned");
        let now = Utc::now();
        Ok(state
            .passes
            .get(&(event_id, user_id))
            .filter(|pass| pass.expires_at > now)
            .map(|pass| pass.token.clone()))
    }

    async fn take_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<String>, InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let now = Utc::now();
        Ok(state
            .passes
            .remove(&(event_id, user_id))
            .filter(|pass| pass.expires_at > now)
            .map(|pass| pass.token))
    }

    async fn publish_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        token: &str,
    ) -> Result<(), InventoryError> {
        let mut state = self.state.lock().expect("inventory state poisoned");
        let sender = Self::pass_sender(&mut state, event_id, user_id);
        // No subscribers is fine; the pass stays readable via take_pass.
        let _ = sender.send(token.to_string());
        Ok(())
    }

    async fn subscribe_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<mpsc::Receiver<String>, InventoryError> {
        let mut rx = {
            let mut state = self.state.lock().expect("inventory state poisoned");
            Self::pass_sender(&mut state, event_id, user_id).subscribe()
        };
        let (tx, out) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Ok(token) = rx.recv().await {
                let _ = tx.send(token).await;
                break;
            }
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(
        booking_id: Uuid,
        user_id: Uuid,
        zone_id: Uuid,
        event_id: Uuid,
        quantity: i64,
        ttl_secs: u64,
    ) -> ReserveRequest {
        ReserveRequest {
            booking_id,
            user_id,
            zone_id,
            event_id,
            show_id: Uuid::new_v4(),
            quantity,
            unit_price: dec!(50.00),
            max_per_user: 4,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    #[tokio::test]
    async fn reserve_decrements_and_tracks_tally() {
        let store = InMemoryInventoryStore::new();
        let (zone, event, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.seed_availability(zone, 10, true).await.unwrap();

        let ok = store
            .reserve(&request(Uuid::new_v4(), user, zone, event, 2, 600))
            .await
            .unwrap();
        assert_eq!(ok.remaining, 8);
        assert_eq!(ok.user_tally, 2);
        assert!(!ok.already_reserved);
    }

    #[tokio::test]
    async fn reserve_rejects_when_zone_missing() {
        let store = InMemoryInventoryStore::new();
        let err = store
            .reserve(&request(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                1,
                600,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::ZoneNotFound { .. }));
    }

    #[tokio::test]
    async fn reserve_enforces_stock_before_user_cap() {
        let store = InMemoryInventoryStore::new();
        let (zone, event, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.seed_availability(zone, 1, true).await.unwrap();

        let err = store
            .reserve(&request(Uuid::new_v4(), user, zone, event, 2, 600))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InventoryError::InsufficientStock { available: 1 }
        ));
    }

    #[tokio::test]
    async fn reserve_enforces_per_user_cap() {
        let store = InMemoryInventoryStore::new();
        let (zone, event, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.seed_availability(zone, 10, true).await.unwrap();

        store
            .reserve(&request(Uuid::new_v4(), user, zone, event, 3, 600))
            .await
            .unwrap();
        let err = store
            .reserve(&request(Uuid::new_v4(), user, zone, event, 2, 600))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InventoryError::UserLimitExceeded { current: 3 }
        ));

        // Neither availability nor tally moved.
        assert_eq!(store.availability(zone).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn reserve_retry_is_idempotent() {
        let store = InMemoryInventoryStore::new();
        let (zone, event, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let booking = Uuid::new_v4();
        store.seed_availability(zone, 10, true).await.unwrap();

        let first = store
            .reserve(&request(booking, user, zone, event, 2, 600))
            .await
            .unwrap();
        let second = store
            .reserve(&request(booking, user, zone, event, 2, 600))
            .await
            .unwrap();
        assert!(!first.already_reserved);
        assert!(second.already_reserved);
        assert_eq!(second.remaining, first.remaining);
        assert_eq!(store.availability(zone).await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn release_restores_and_remembers() {
        let store = InMemoryInventoryStore::new();
        let (zone, event, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let booking = Uuid::new_v4();
        store.seed_availability(zone, 10, true).await.unwrap();
        store
            .reserve(&request(booking, user, zone, event, 2, 600))
            .await
            .unwrap();

        let ok = store
            .release(booking, user, zone, event, ReleaseMode::ReservedOnly)
            .await
            .unwrap();
        assert_eq!(ok.availability, 10);
        assert_eq!(ok.user_tally, 0);

        let err = store
            .release(booking, user, zone, event, ReleaseMode::ReservedOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::AlreadyReleased));
    }

    #[tokio::test]
    async fn confirm_clears_ttl_and_is_idempotent() {
        let store = InMemoryInventoryStore::new();
        let (zone, event, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let booking = Uuid::new_v4();
        store.seed_availability(zone, 10, true).await.unwrap();
        store
            .reserve(&request(booking, user, zone, event, 1, 600))
            .await
            .unwrap();

        let first = store.confirm(booking, user, Some("pay-1")).await.unwrap();
        assert!(matches!(first, ConfirmOutcome::Confirmed { .. }));

        let second = store.confirm(booking, user, Some("pay-1")).await.unwrap();
        assert!(matches!(second, ConfirmOutcome::AlreadyConfirmed { .. }));

        let record = store.reservation(booking).await.unwrap().unwrap();
        assert_eq!(record.status, ReservationState::Confirmed);
        assert_eq!(record.payment_id.as_deref(), Some("pay-1"));
    }

    #[tokio::test]
    async fn expired_reservation_vanishes_and_restore_is_single_shot() {
        let store = InMemoryInventoryStore::new();
        let (zone, event, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let booking = Uuid::new_v4();
        store.seed_availability(zone, 10, true).await.unwrap();
        store
            .reserve(&request(booking, user, zone, event, 2, 0))
            .await
            .unwrap();

        // TTL of zero: the hash is already gone.
        assert!(store.reservation(booking).await.unwrap().is_none());

        let first = store
            .release_expired(booking, user, zone, event, 2)
            .await
            .unwrap();
        assert!(matches!(
            first,
            ExpiredReleaseOutcome::Restored { availability: 10 }
        ));

        let second = store
            .release_expired(booking, user, zone, event, 2)
            .await
            .unwrap();
        assert!(matches!(second, ExpiredReleaseOutcome::AlreadyRestored));
        assert_eq!(store.availability(zone).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn queue_is_fifo_with_user_id_tie_break() {
        let store = InMemoryInventoryStore::new();
        let event = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        store.join_queue(event, a, 0, Duration::from_secs(60)).await.unwrap();
        store.join_queue(event, b, 0, Duration::from_secs(60)).await.unwrap();
        store.join_queue(event, c, 0, Duration::from_secs(60)).await.unwrap();

        let popped = store.pop_queue_batch(event, 2).await.unwrap();
        assert_eq!(popped, vec![a, b]);
        let pos = store.queue_position(event, c).await.unwrap().unwrap();
        assert_eq!(pos.position, 1);
    }

    #[tokio::test]
    async fn duplicate_join_reports_position() {
        let store = InMemoryInventoryStore::new();
        let event = Uuid::new_v4();
        let user = Uuid::new_v4();

        store
            .join_queue(event, user, 0, Duration::from_secs(60))
            .await
            .unwrap();
        let err = store
            .join_queue(event, user, 0, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InventoryError::AlreadyInQueue { position: 1, .. }
        ));
    }

    #[tokio::test]
    async fn queue_full_is_rejected() {
        let store = InMemoryInventoryStore::new();
        let event = Uuid::new_v4();
        store
            .join_queue(event, Uuid::new_v4(), 1, Duration::from_secs(60))
            .await
            .unwrap();
        let err = store
            .join_queue(event, Uuid::new_v4(), 1, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::QueueFull { queue_len: 1 }));
    }

    #[tokio::test]
    async fn peek_does_not_consume_a_pass() {
        let store = InMemoryInventoryStore::new();
        let (event, user) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .put_pass(event, user, "token-7", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            store.peek_pass(event, user).await.unwrap().as_deref(),
            Some("token-7")
        );
        assert_eq!(
            store.peek_pass(event, user).await.unwrap().as_deref(),
            Some("token-7")
        );
        // Still available for its one consumption.
        assert_eq!(
            store.take_pass(event, user).await.unwrap().as_deref(),
            Some("token-7")
        );
        assert_eq!(store.peek_pass(event, user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pass_is_single_use() {
        let store = InMemoryInventoryStore::new();
        let (event, user) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .put_pass(event, user, "token-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.count_active_passes(event).await.unwrap(), 1);

        let taken = store.take_pass(event, user).await.unwrap();
        assert_eq!(taken.as_deref(), Some("token-1"));
        assert_eq!(store.take_pass(event, user).await.unwrap(), None);
        assert_eq!(store.count_active_passes(event).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn published_pass_reaches_subscriber() {
        let store = InMemoryInventoryStore::new();
        let (event, user) = (Uuid::new_v4(), Uuid::new_v4());

        let mut rx = store.subscribe_pass(event, user).await.unwrap();
        store.publish_pass(event, user, "token-9").await.unwrap();

        let token = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("subscription timed out")
            .expect("channel closed");
        assert_eq!(token, "token-9");
    }
}
