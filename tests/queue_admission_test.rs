//! Waiting-room scenarios: FIFO admission, pass delivery, single use.

mod common;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use bookrush_api::inventory::{InMemoryInventoryStore, InventoryStore};
use bookrush_api::queue::{PassSigner, QueueAdmissionService, QueueReleaseWorker};
use bookrush_api::services::bookings::ReserveBooking;
use common::harness_with;

const SECRET: &str = "queue-pass-secret-queue-pass-secret";

fn admission(store: Arc<InMemoryInventoryStore>) -> QueueAdmissionService {
    QueueAdmissionService::new(
        store,
        PassSigner::new(SECRET),
        Duration::from_secs(300),
        Duration::from_secs(1),
    )
}

fn release_worker(store: Arc<InMemoryInventoryStore>) -> QueueReleaseWorker {
    QueueReleaseWorker::new(store, PassSigner::new(SECRET), Duration::from_secs(300))
}

#[tokio::test]
async fn three_joiners_admitted_one_per_tick_in_join_order() {
    let store = Arc::new(InMemoryInventoryStore::new());
    let event = Uuid::new_v4();
    store.set_queue_max_concurrent(event, 1).await.unwrap();

    let svc = admission(store.clone());
    let users = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    for (i, user) in users.iter().enumerate() {
        let joined = svc.join(event, *user).await.unwrap();
        assert_eq!(joined.position, i as i64 + 1);
    }

    let worker = release_worker(store.clone());
    let signer = PassSigner::new(SECRET);

    // Three ticks with each pass consumed in between: tokens are minted for
    // user 1, then user 2, then user 3, in that order.
    for expected in users {
        worker.run_once().await.unwrap();
        let token = store
            .take_pass(event, expected)
            .await
            .unwrap()
            .expect("pass minted for the queue head");
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.user_id, expected);
        assert_eq!(claims.event_id, event);

        // Nobody behind the head got a pass this tick.
        for other in users {
            if other != expected {
                assert!(store.take_pass(event, other).await.unwrap().is_none());
            }
        }
    }
}

#[tokio::test]
async fn waiting_subscriber_receives_terminal_pass() {
    let store = Arc::new(InMemoryInventoryStore::new());
    let event = Uuid::new_v4();
    store.set_queue_max_concurrent(event, 1).await.unwrap();

    let svc = admission(store.clone());
    let user = Uuid::new_v4();
    svc.join(event, user).await.unwrap();

    // Subscribe before release, as the SSE handler does.
    let mut rx = svc.subscribe_pass(event, user).await.unwrap();
    release_worker(store.clone()).run_once().await.unwrap();

    let token = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("pass not delivered")
        .expect("channel closed");
    assert_eq!(PassSigner::new(SECRET).verify(&token).unwrap().user_id, user);

    // Admitted users are out of the queue.
    assert!(svc.position(event, user).await.unwrap().is_none());
}

#[tokio::test]
async fn bypass_pass_admits_exactly_one_reservation_attempt() {
    let h = harness_with(4, 10, true).await;
    let svc = admission(h.inventory.clone());
    let user = Uuid::new_v4();

    svc.join(h.event_id, user).await.unwrap();
    h.inventory
        .set_queue_max_concurrent(h.event_id, 5)
        .await
        .unwrap();
    release_worker(h.inventory.clone()).run_once().await.unwrap();

    // The pass was minted before any stream subscribed; read it from the
    // store the way a reconnecting stream would.
    let token = svc
        .peek_pass(h.event_id, user)
        .await
        .unwrap()
        .expect("pass available");

    // First presentation: consumed, reservation goes through.
    svc.validate_and_consume(h.event_id, user, &token)
        .await
        .unwrap();
    let booked = h
        .bookings
        .reserve(
            user,
            ReserveBooking {
                event_id: h.event_id,
                show_id: h.show_id,
                zone_id: h.zone_id,
                quantity: 1,
                idempotency_key: "queued-user".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(booked.quantity, 1);

    // Second presentation of the same token: rejected as unauthorized.
    let err = svc
        .validate_and_consume(h.event_id, user, &token)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");
}

#[tokio::test]
async fn leave_vacates_the_slot() {
    let store = Arc::new(InMemoryInventoryStore::new());
    let event = Uuid::new_v4();
    store.set_queue_max_concurrent(event, 1).await.unwrap();

    let svc = admission(store.clone());
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
    svc.join(event, first).await.unwrap();
    svc.join(event, second).await.unwrap();

    assert!(svc.leave(event, first).await.unwrap());
    let pos = svc.position(event, second).await.unwrap().unwrap();
    assert_eq!(pos.position, 1);

    // Leaving twice is a no-op.
    assert!(!svc.leave(event, first).await.unwrap());
}
