//! Queue release worker.
//!
//! Every tick, for each active event: read the concurrency budget, count
//! live passes, admit the difference from the head of the queue. Each
//! admitted user gets a freshly minted single-use pass, stored under their
//! key and published on their channel for SSE delivery.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::inventory::InventoryStore;
use crate::queue::pass::PassSigner;

/// Fallback budget for events with no queue config entry.
const DEFAULT_MAX_CONCURRENT: i64 = 100;

/// What one tick did (logging and tests).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseTickResult {
    pub events_scanned: usize,
    pub admitted: usize,
}

pub struct QueueReleaseWorker {
    inventory: Arc<dyn InventoryStore>,
    signer: PassSigner,
    pass_ttl: Duration,
}

impl QueueReleaseWorker {
    pub fn new(
        inventory: Arc<dyn InventoryStore>,
        signer: PassSigner,
        pass_ttl: Duration,
    ) -> Self {
        Self {
            inventory,
            signer,
            pass_ttl,
        }
    }

    pub async fn run(self, tick_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("queue release worker started");
        let mut ticker = interval(tick_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(result) if result.admitted > 0 => {
                            debug!(admitted = result.admitted, "released users from queue");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "queue release tick failed"),
                    }
                }
            }
        }
        info!("queue release worker stopped");
    }

    /// One tick over every active event queue.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ReleaseTickResult, ServiceError> {
        let events = self
            .inventory
            .active_queue_events()
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;

        let mut result = ReleaseTickResult {
            events_scanned: events.len(),
            admitted: 0,
        };
        for event_id in events {
            match self.release_for_event(event_id).await {
                Ok(count) => result.admitted += count,
                Err(e) => warn!(event_id = %event_id, error = %e, "release pass failed for event"),
            }
        }
        Ok(result)
    }

    async fn release_for_event(&self, event_id: Uuid) -> Result<usize, ServiceError> {
        let max_concurrent = self
            .inventory
            .queue_max_concurrent(event_id)
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))?
            .unwrap_or(DEFAULT_MAX_CONCURRENT)
            .max(0);
        let active = self
            .inventory
            .count_active_passes(event_id)
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;

        let available = max_concurrent - active;
        if available <= 0 {
            return Ok(0);
        }

        let admitted = self
            .inventory
            .pop_queue_batch(event_id, available)
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;

        for user_id in &admitted {
            let token = self.signer.mint(event_id, *user_id, self.pass_ttl);
            self.inventory
                .put_pass(event_id, *user_id, &token, self.pass_ttl)
                .await
                .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;
            self.inventory
                .publish_pass(event_id, *user_id, &token)
                .await
                .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;
            debug!(event_id = %event_id, user_id = %user_id, "bypass pass issued");
        }
        Ok(admitted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::InMemoryInventoryStore;

    fn worker(store: Arc<InMemoryInventoryStore>) -> QueueReleaseWorker {
        QueueReleaseWorker::new(
            store,
            PassSigner::new("queue-pass-secret-queue-pass-secret"),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn admits_in_fifo_order_under_budget() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let event = Uuid::new_v4();
        store.set_queue_max_concurrent(event, 1).await.unwrap();

        let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for user in [u1, u2, u3] {
            store
                .join_queue(event, user, 0, Duration::from_secs(60))
                .await
                .unwrap();
        }

        let worker = worker(store.clone());

        // Tick 1: only the head of the queue gets a pass.
        let first = worker.run_once().await.unwrap();
        assert_eq!(first.admitted, 1);
        assert!(store.take_pass(event, u1).await.unwrap().is_some());
        assert!(store.take_pass(event, u2).await.unwrap().is_none());

        // u1's pass was consumed above, freeing one slot for u2.
        let second = worker.run_once().await.unwrap();
        assert_eq!(second.admitted, 1);
        assert!(store.take_pass(event, u2).await.unwrap().is_some());

        let third = worker.run_once().await.unwrap();
        assert_eq!(third.admitted, 1);
        assert!(store.take_pass(event, u3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn budget_counts_outstanding_passes() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let event = Uuid::new_v4();
        store.set_queue_max_concurrent(event, 1).await.unwrap();

        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        for user in [u1, u2] {
            store
                .join_queue(event, user, 0, Duration::from_secs(60))
                .await
                .unwrap();
        }

        let worker = worker(store.clone());
        worker.run_once().await.unwrap();

        // u1 has not consumed their pass: no slot for u2 yet.
        let second = worker.run_once().await.unwrap();
        assert_eq!(second.admitted, 0);
        let pos = store.queue_position(event, u2).await.unwrap().unwrap();
        assert_eq!(pos.position, 1);
    }

    #[tokio::test]
    async fn published_pass_reaches_waiting_subscriber() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let event = Uuid::new_v4();
        let user = Uuid::new_v4();
        store.set_queue_max_concurrent(event, 5).await.unwrap();
        store
            .join_queue(event, user, 0, Duration::from_secs(60))
            .await
            .unwrap();

        let mut rx = store.subscribe_pass(event, user).await.unwrap();
        let worker = worker(store.clone());
        worker.run_once().await.unwrap();

        let token = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("pass not delivered")
            .expect("channel closed");
        let claims = PassSigner::new("queue-pass-secret-queue-pass-secret")
            .verify(&token)
            .unwrap();
        assert_eq!(claims.user_id, user);
    }
}
