//! Virtual queue admission.
//!
//! A FIFO waiting room per event: joins land in an ordered set scored by
//! join time, the release worker mints single-use bypass tokens under the
//! event's concurrency budget, and waiting clients hear about their token
//! over a pub/sub-fed SSE stream instead of polling.

pub mod pass;
pub mod release;

pub use pass::{PassClaims, PassError, PassSigner};
pub use release::QueueReleaseWorker;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::inventory::{InventoryStore, QueuePosition};

/// Fallback concurrency budget for events without explicit queue config.
const DEFAULT_MAX_CONCURRENT: i64 = 100;
/// Queue-user metadata outlives the expected wait by this much.
const QUEUE_META_TTL: Duration = Duration::from_secs(3600);

/// Response to a queue join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinOutcome {
    pub position: i64,
    pub queue_len: i64,
    pub estimated_wait_secs: u64,
}

/// A position probe for the SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub position: i64,
    pub queue_len: i64,
    pub estimated_wait_secs: u64,
}

#[derive(Clone)]
pub struct QueueAdmissionService {
    inventory: Arc<dyn InventoryStore>,
    signer: PassSigner,
    pass_ttl: Duration,
    release_interval: Duration,
}

impl QueueAdmissionService {
    pub fn new(
        inventory: Arc<dyn InventoryStore>,
        signer: PassSigner,
        pass_ttl: Duration,
        release_interval: Duration,
    ) -> Self {
        Self {
            inventory,
            signer,
            pass_ttl,
            release_interval,
        }
    }

    /// Adds the caller to the event's queue. A user already queued gets a
    /// conflict carrying their position.
    #[instrument(skip(self))]
    pub async fn join(&self, event_id: Uuid, user_id: Uuid) -> Result<JoinOutcome, ServiceError> {
        let joined = self
            .inventory
            .join_queue(event_id, user_id, 0, QUEUE_META_TTL)
            .await
            .map_err(|e| e.into_service_error(event_id, 0, 0))?;

        let max_concurrent = self.max_concurrent(event_id).await;
        info!(event_id = %event_id, position = joined.position, "user joined queue");
        Ok(JoinOutcome {
            position: joined.position,
            queue_len: joined.queue_len,
            estimated_wait_secs: self.estimated_wait(joined.position, max_concurrent),
        })
    }

    /// Current standing, or None once the user has been popped (admitted or
    /// left).
    pub async fn position(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<PositionUpdate>, ServiceError> {
        let position: Option<QueuePosition> = self
            .inventory
            .queue_position(event_id, user_id)
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;
        let max_concurrent = self.max_concurrent(event_id).await;
        Ok(position.map(|p| PositionUpdate {
            position: p.position,
            queue_len: p.queue_len,
            estimated_wait_secs: self.estimated_wait(p.position, max_concurrent),
        }))
    }

    /// Removes the caller from the queue.
    #[instrument(skip(self))]
    pub async fn leave(&self, event_id: Uuid, user_id: Uuid) -> Result<bool, ServiceError> {
        self.inventory
            .leave_queue(event_id, user_id)
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))
    }

    /// Subscribes to the caller's pass channel; must be called before
    /// reading positions so an admission between the two is not missed.
    pub async fn subscribe_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<mpsc::Receiver<String>, ServiceError> {
        self.inventory
            .subscribe_pass(event_id, user_id)
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))
    }

    /// An already-minted pass for the caller, if one is waiting unconsumed.
    /// Read-only: delivery must never touch the single use.
    pub async fn peek_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<String>, ServiceError> {
        self.inventory
            .peek_pass(event_id, user_id)
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))
    }

    /// Validates a presented bypass token and burns it. Exactly one
    /// successful call per minted token.
    #[instrument(skip(self, token))]
    pub async fn validate_and_consume(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        token: &str,
    ) -> Result<(), ServiceError> {
        let claims = self
            .signer
            .verify(token)
            .map_err(|e| ServiceError::Unauthorized(format!("invalid queue pass: {}", e)))?;
        if claims.event_id != event_id || claims.user_id != user_id {
            return Err(ServiceError::Unauthorized(
                "queue pass does not match this request".to_string(),
            ));
        }

        let stored = self
            .inventory
            .take_pass(event_id, user_id)
            .await
            .map_err(|e| ServiceError::InventoryStore(e.to_string()))?;
        match stored {
            Some(stored_token) if stored_token == token => Ok(()),
            Some(other) => {
                // The stored pass differs from the presented one; put the
                // live one back and reject.
                warn!(event_id = %event_id, "presented pass does not match stored pass");
                let _ = self
                    .inventory
                    .put_pass(event_id, user_id, &other, self.pass_ttl)
                    .await;
                Err(ServiceError::Unauthorized(
                    "queue pass already consumed".to_string(),
                ))
            }
            None => Err(ServiceError::Unauthorized(
                "queue pass already consumed".to_string(),
            )),
        }
    }

    async fn max_concurrent(&self, event_id: Uuid) -> i64 {
        self.inventory
            .queue_max_concurrent(event_id)
            .await
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_MAX_CONCURRENT)
            .max(1)
    }

    /// Wait estimate: full release rounds ahead of the caller times the
    /// release interval, at least one interval.
    fn estimated_wait(&self, position: i64, max_concurrent: i64) -> u64 {
        let rounds = (position.max(1) + max_concurrent - 1) / max_concurrent;
        (rounds.max(1) as u64) * self.release_interval.as_secs().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::InMemoryInventoryStore;

    fn service(store: Arc<InMemoryInventoryStore>) -> QueueAdmissionService {
        QueueAdmissionService::new(
            store,
            PassSigner::new("queue-pass-secret-queue-pass-secret"),
            Duration::from_secs(300),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn join_reports_position_and_wait() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let svc = service(store.clone());
        let event = Uuid::new_v4();
        store.set_queue_max_concurrent(event, 2).await.unwrap();

        let first = svc.join(event, Uuid::new_v4()).await.unwrap();
        assert_eq!(first.position, 1);
        assert_eq!(first.estimated_wait_secs, 1);

        let third_user = Uuid::new_v4();
        svc.join(event, Uuid::new_v4()).await.unwrap();
        let third = svc.join(event, third_user).await.unwrap();
        assert_eq!(third.position, 3);
        // Two admissions per round: position 3 waits two rounds.
        assert_eq!(third.estimated_wait_secs, 2);
    }

    #[tokio::test]
    async fn pass_single_use_enforced() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let svc = service(store.clone());
        let (event, user) = (Uuid::new_v4(), Uuid::new_v4());

        let token = svc
            .signer
            .mint(event, user, Duration::from_secs(300));
        store
            .put_pass(event, user, &token, Duration::from_secs(300))
            .await
            .unwrap();

        svc.validate_and_consume(event, user, &token).await.unwrap();
        let err = svc
            .validate_and_consume(event, user, &token)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn peeking_never_blocks_the_holder_from_consuming() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let svc = service(store.clone());
        let (event, user) = (Uuid::new_v4(), Uuid::new_v4());

        let token = svc.signer.mint(event, user, Duration::from_secs(300));
        store
            .put_pass(event, user, &token, Duration::from_secs(300))
            .await
            .unwrap();

        // A reconnecting stream peeks; the holder's reserve must still
        // consume the very same token.
        let peeked = svc.peek_pass(event, user).await.unwrap();
        assert_eq!(peeked.as_deref(), Some(token.as_str()));
        svc.validate_and_consume(event, user, &token).await.unwrap();
    }

    #[tokio::test]
    async fn pass_for_other_event_is_rejected() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let svc = service(store.clone());
        let (event, other_event, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let token = svc.signer.mint(other_event, user, Duration::from_secs(300));
        store
            .put_pass(event, user, &token, Duration::from_secs(300))
            .await
            .unwrap();

        let err = svc
            .validate_and_consume(event, user, &token)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        // The stored pass was not consumed by the failed attempt.
        assert!(store.take_pass(event, user).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn forged_pass_is_rejected_without_store_lookup() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let svc = service(store);
        let err = svc
            .validate_and_consume(Uuid::new_v4(), Uuid::new_v4(), "forged.token")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }
}
