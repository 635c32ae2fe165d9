//! Reservation lifecycle scenarios: contention, caps, idempotency, expiry.

mod common;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use bookrush_api::entities::booking::{BookingStatus, Entity as BookingEntity};
use bookrush_api::inventory::InventoryStore;
use bookrush_api::services::bookings::ReserveBooking;
use bookrush_api::services::ExpiryWorker;
use common::{harness, harness_with, harness_with_payment_window};
use sea_orm::EntityTrait;

fn reserve_request(h: &common::TestHarness, quantity: i32, key: &str) -> ReserveBooking {
    ReserveBooking {
        event_id: h.event_id,
        show_id: h.show_id,
        zone_id: h.zone_id,
        quantity,
        idempotency_key: key.to_string(),
    }
}

#[tokio::test]
async fn last_seat_goes_to_exactly_one_caller() {
    let h = Arc::new(harness_with(4, 1, false).await);
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let h1 = h.clone();
    let first = tokio::spawn(async move {
        h1.bookings
            .reserve(alice, reserve_request(&h1, 1, "alice-attempt"))
            .await
    });
    let h2 = h.clone();
    let second = tokio::spawn(async move {
        h2.bookings
            .reserve(bob, reserve_request(&h2, 1, "bob-attempt"))
            .await
    });

    let outcomes = [first.await.unwrap(), second.await.unwrap()];
    let successes: Vec<_> = outcomes.iter().filter(|o| o.is_ok()).collect();
    let failures: Vec<_> = outcomes.iter().filter(|o| o.is_err()).collect();

    assert_eq!(successes.len(), 1, "exactly one caller wins the last seat");
    assert_eq!(failures.len(), 1);
    assert_eq!(
        successes[0].as_ref().unwrap().remaining_availability,
        Some(0)
    );
    assert_eq!(
        failures[0].as_ref().unwrap_err().code(),
        "INSUFFICIENT_STOCK"
    );
    assert_eq!(h.inventory.availability(h.zone_id).await.unwrap(), Some(0));
}

#[tokio::test]
async fn per_user_cap_rejects_without_side_effects() {
    let h = harness().await;
    let user = Uuid::new_v4();

    let first = h
        .bookings
        .reserve(user, reserve_request(&h, 3, "first-three"))
        .await
        .unwrap();
    assert_eq!(first.remaining_availability, Some(7));

    let err = h
        .bookings
        .reserve(user, reserve_request(&h, 2, "two-more"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MAX_PER_USER_EXCEEDED");

    // Availability and tally unchanged by the rejection.
    assert_eq!(h.inventory.availability(h.zone_id).await.unwrap(), Some(7));
}

#[tokio::test]
async fn quantity_above_event_cap_is_a_validation_error() {
    let h = harness().await;
    let err = h
        .bookings
        .reserve(Uuid::new_v4(), reserve_request(&h, 5, "too-many"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn reserve_is_idempotent_per_key() {
    let h = harness().await;
    let user = Uuid::new_v4();

    let first = h
        .bookings
        .reserve(user, reserve_request(&h, 2, "checkout-42"))
        .await
        .unwrap();
    let second = h
        .bookings
        .reserve(user, reserve_request(&h, 2, "checkout-42"))
        .await
        .unwrap();

    assert_eq!(first.booking_id, second.booking_id);
    // One deduction, one row.
    assert_eq!(h.inventory.availability(h.zone_id).await.unwrap(), Some(8));
    let rows = BookingEntity::find().all(&*h.db).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn idempotency_key_is_scoped_to_its_owner() {
    let h = harness().await;
    let owner = Uuid::new_v4();
    h.bookings
        .reserve(owner, reserve_request(&h, 1, "shared-key"))
        .await
        .unwrap();

    let err = h
        .bookings
        .reserve(Uuid::new_v4(), reserve_request(&h, 1, "shared-key"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn confirm_then_repeat_confirm_is_stable() {
    let h = harness().await;
    let user = Uuid::new_v4();
    let booked = h
        .bookings
        .reserve(user, reserve_request(&h, 2, "confirm-path"))
        .await
        .unwrap();

    let confirmed = h
        .bookings
        .confirm(user, booked.booking_id, "pay-123")
        .await
        .unwrap();
    assert_eq!(confirmed.status, "confirmed");
    assert!(confirmed.confirmed_at.is_some());

    let repeat = h
        .bookings
        .confirm(user, booked.booking_id, "pay-123")
        .await
        .unwrap();
    assert_eq!(repeat.status, "confirmed");

    // The hold no longer expires: seats stay deducted.
    assert_eq!(h.inventory.availability(h.zone_id).await.unwrap(), Some(8));
    let record = h.inventory.reservation(booked.booking_id).await.unwrap();
    assert!(record.is_some(), "confirmed reservation key is permanent");
}

#[tokio::test]
async fn cancel_restores_availability() {
    let h = harness().await;
    let user = Uuid::new_v4();
    let booked = h
        .bookings
        .reserve(user, reserve_request(&h, 3, "cancel-path"))
        .await
        .unwrap();
    assert_eq!(h.inventory.availability(h.zone_id).await.unwrap(), Some(7));

    let cancelled = h.bookings.cancel(user, booked.booking_id).await.unwrap();
    assert_eq!(cancelled.status, "cancelled");
    assert_eq!(h.inventory.availability(h.zone_id).await.unwrap(), Some(10));

    // Cancelling an already-cancelled booking is a no-op success.
    let repeat = h.bookings.cancel(user, booked.booking_id).await.unwrap();
    assert_eq!(repeat.status, "cancelled");
}

#[tokio::test]
async fn confirm_after_cancel_conflicts() {
    let h = harness().await;
    let user = Uuid::new_v4();
    let booked = h
        .bookings
        .reserve(user, reserve_request(&h, 1, "cancel-then-confirm"))
        .await
        .unwrap();
    h.bookings.cancel(user, booked.booking_id).await.unwrap();

    let err = h
        .bookings
        .confirm(user, booked.booking_id, "pay-9")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn expiry_worker_releases_overdue_reservations() {
    // Zero payment window: the hold lapses immediately.
    let h = harness_with_payment_window(Duration::ZERO).await;
    let user = Uuid::new_v4();
    let booked = h
        .bookings
        .reserve(user, reserve_request(&h, 2, "never-paid"))
        .await
        .unwrap();
    assert_eq!(h.inventory.availability(h.zone_id).await.unwrap(), Some(8));

    let worker = ExpiryWorker::new(h.db.clone(), h.inventory.clone());
    let result = worker.run_once().await.unwrap();
    assert_eq!(result.expired, 1);

    let row = BookingEntity::find_by_id(booked.booking_id)
        .one(&*h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, BookingStatus::Expired.as_str());
    assert_eq!(h.inventory.availability(h.zone_id).await.unwrap(), Some(10));

    // A second pass finds nothing left to do.
    let second = worker.run_once().await.unwrap();
    assert_eq!(second.expired, 0);
}

#[tokio::test]
async fn confirm_of_expired_reservation_is_gone() {
    let h = harness_with_payment_window(Duration::ZERO).await;
    let user = Uuid::new_v4();
    let booked = h
        .bookings
        .reserve(user, reserve_request(&h, 1, "expired-confirm"))
        .await
        .unwrap();

    let err = h
        .bookings
        .confirm(user, booked.booking_id, "pay-late")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RESERVATION_EXPIRED");
}

#[tokio::test]
async fn projections_are_owner_scoped() {
    let h = harness().await;
    let user = Uuid::new_v4();
    let booked = h
        .bookings
        .reserve(user, reserve_request(&h, 1, "projection"))
        .await
        .unwrap();

    let fetched = h.bookings.get(user, booked.booking_id).await.unwrap();
    assert_eq!(fetched.booking_id, booked.booking_id);

    // Another user sees NOT_FOUND, not FORBIDDEN: existence is not leaked.
    let err = h
        .bookings
        .get(Uuid::new_v4(), booked.booking_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let pending = h.bookings.pending(user).await.unwrap();
    assert_eq!(pending.len(), 1);

    let (page, total) = h
        .bookings
        .list(user, 1, 20, Some(BookingStatus::Reserved))
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(page.len(), 1);
}
