//! Saga step workers.
//!
//! Each worker consumes one command topic and applies its effect
//! idempotently; the idempotency key is derived from `(saga_id,
//! step_index)` by the bus envelope. Outcomes are published as success or
//! failure events; failures carry a `retryable` flag so the orchestrator
//! can tell transient I/O from logical invariant violations.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::booking::{self, BookingStatus, Entity as BookingEntity};
use crate::errors::ServiceError;
use crate::events::{outbox, Event};
use crate::inventory::{InventoryError, InventoryStore, ReleaseMode};
use crate::message_queue::{topics, Message, MessageQueue};
use crate::saga::{
    COMPENSATION_REFUND_PAYMENT, COMPENSATION_RELEASE_BOOKING, STEP_CONFIRM_BOOKING,
    STEP_SEND_NOTIFICATION,
};
use crate::services::BookingService;

/// A step failure, classified for the orchestrator's retry policy.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl StepFailure {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// One step's effect.
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn step_name(&self) -> &'static str;
    async fn execute(&self, message: &Message) -> Result<Value, StepFailure>;
}

/// Consumes command topics and dispatches to the registered handler per
/// step name. Unknown steps hit a logging no-op so a skewed deployment
/// never crashes the worker.
pub struct SagaStepWorker {
    queue: Arc<dyn MessageQueue>,
    saga_name: String,
    handlers: HashMap<&'static str, Arc<dyn StepHandler>>,
}

impl SagaStepWorker {
    pub fn new(queue: Arc<dyn MessageQueue>, saga_name: impl Into<String>) -> Self {
        Self {
            queue,
            saga_name: saga_name.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn register(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(handler.step_name(), handler);
        self
    }

    pub async fn run(self: Arc<Self>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(saga = self.saga_name, "saga step worker started");
        let mut ticker = interval(poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "step worker tick failed");
                    }
                }
            }
        }
        info!("saga step worker stopped");
    }

    /// Drains every registered command topic once. The handler is resolved
    /// from the message's own step name; a command naming an unknown step
    /// (deployment skew) is logged and acked instead of crashing.
    pub async fn tick(&self) -> Result<(), ServiceError> {
        for step_name in self.handlers.keys() {
            let topic = topics::step_command(&self.saga_name, step_name);
            loop {
                let msg = self
                    .queue
                    .subscribe(&topic)
                    .await
                    .map_err(|e| ServiceError::MessageQueue(e.to_string()))?;
                let Some(msg) = msg else { break };
                let id = msg.message_id;
                match msg
                    .step_name
                    .as_deref()
                    .and_then(|name| self.handlers.get(name))
                {
                    Some(handler) => self.dispatch(handler.as_ref(), &msg).await,
                    None => {
                        warn!(
                            step_name = ?msg.step_name,
                            topic,
                            "no handler registered for step; dropping command"
                        );
                    }
                }
                if let Err(e) = self.queue.ack(&id).await {
                    warn!(error = %e, "command ack failed");
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, handler, msg), fields(step = handler.step_name(), saga_id = ?msg.saga_id))]
    async fn dispatch(&self, handler: &dyn StepHandler, msg: &Message) {
        match handler.execute(msg).await {
            Ok(output) => {
                let topic = topics::step_success(&self.saga_name, handler.step_name());
                let mut event = Message::new(&topic, output);
                if let (Some(saga_id), Some(step_index)) = (msg.saga_id, msg.step_index) {
                    event = event.with_saga(saga_id, &self.saga_name, handler.step_name(), step_index);
                }
                if let Err(e) = self.queue.publish(&topic, event).await {
                    error!(error = %e, "failed to publish step success");
                }
            }
            Err(failure) => {
                warn!(
                    code = failure.code,
                    retryable = failure.retryable,
                    "step execution failed"
                );
                let topic = topics::step_failure(&self.saga_name, handler.step_name());
                let mut event = Message::new(&topic, json!({"retryable": failure.retryable}))
                    .with_error(&failure.code, &failure.message);
                if let (Some(saga_id), Some(step_index)) = (msg.saga_id, msg.step_index) {
                    event = event.with_saga(saga_id, &self.saga_name, handler.step_name(), step_index);
                }
                if let Err(e) = self.queue.publish(&topic, event).await {
                    error!(error = %e, "failed to publish step failure");
                }
            }
        }
    }
}

fn data_uuid(data: &Value, field: &str) -> Result<Uuid, StepFailure> {
    data.get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| StepFailure::fatal("BAD_COMMAND", format!("missing {}", field)))
}

/// Confirms the booking: inventory confirm script plus the conditional row
/// update, via the reservation service. A repeated command observes the
/// booking already confirmed and succeeds without re-invoking the script.
pub struct ConfirmBookingHandler {
    bookings: BookingService,
}

impl ConfirmBookingHandler {
    pub fn new(bookings: BookingService) -> Self {
        Self { bookings }
    }
}

#[async_trait]
impl StepHandler for ConfirmBookingHandler {
    fn step_name(&self) -> &'static str {
        STEP_CONFIRM_BOOKING
    }

    async fn execute(&self, message: &Message) -> Result<Value, StepFailure> {
        let booking_id = data_uuid(&message.data, "booking_id")?;
        let user_id = data_uuid(&message.data, "user_id")?;
        let payment_id = message
            .data
            .get("payment_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        match self.bookings.confirm(user_id, booking_id, &payment_id).await {
            Ok(summary) => Ok(json!({
                "booking_id": booking_id,
                "status": summary.status,
                "confirmed_at": summary.confirmed_at,
            })),
            Err(e) => {
                let code = e.code().to_string();
                if e.is_retryable() {
                    Err(StepFailure::retryable(code, e.to_string()))
                } else {
                    Err(StepFailure::fatal(code, e.to_string()))
                }
            }
        }
    }
}

/// Notification dispatch is an external collaborator; the step records the
/// request and always succeeds.
pub struct SendNotificationHandler;

#[async_trait]
impl StepHandler for SendNotificationHandler {
    fn step_name(&self) -> &'static str {
        STEP_SEND_NOTIFICATION
    }

    async fn execute(&self, message: &Message) -> Result<Value, StepFailure> {
        let booking_id = data_uuid(&message.data, "booking_id")?;
        info!(booking_id = %booking_id, "notification requested for confirmed booking");
        Ok(json!({"booking_id": booking_id, "notification": "queued"}))
    }
}

/// Compensation: undoes a completed confirm-booking step. The only caller
/// allowed to release a confirmed reservation.
pub struct ReleaseBookingHandler {
    db: Arc<DatabaseConnection>,
    inventory: Arc<dyn InventoryStore>,
}

impl ReleaseBookingHandler {
    pub fn new(db: Arc<DatabaseConnection>, inventory: Arc<dyn InventoryStore>) -> Self {
        Self { db, inventory }
    }
}

#[async_trait]
impl StepHandler for ReleaseBookingHandler {
    fn step_name(&self) -> &'static str {
        COMPENSATION_RELEASE_BOOKING
    }

    async fn execute(&self, message: &Message) -> Result<Value, StepFailure> {
        let booking_id = data_uuid(&message.data, "booking_id")?;

        let row = BookingEntity::find_by_id(booking_id)
            .one(&*self.db)
            .await
            .map_err(|e| StepFailure::retryable("INTERNAL_ERROR", e.to_string()))?
            .ok_or_else(|| StepFailure::fatal("NOT_FOUND", "booking row missing"))?;

        match row.status() {
            Some(BookingStatus::Cancelled) | Some(BookingStatus::Expired) => {
                // Already unwound.
                return Ok(json!({"booking_id": booking_id, "status": row.status}));
            }
            _ => {}
        }

        match self
            .inventory
            .release(
                booking_id,
                row.user_id,
                row.zone_id,
                row.event_id,
                ReleaseMode::Compensation,
            )
            .await
        {
            Ok(_) => {}
            Err(InventoryError::ReservationNotFound) | Err(InventoryError::AlreadyReleased) => {
                debug!(booking_id = %booking_id, "reservation already gone during compensation");
            }
            Err(InventoryError::Io(e)) => {
                return Err(StepFailure::retryable("INTERNAL_ERROR", e));
            }
            Err(e) => {
                return Err(StepFailure::fatal("COMPENSATION_FAILED", e.to_string()));
            }
        }

        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| StepFailure::retryable("INTERNAL_ERROR", e.to_string()))?;
        let updated = BookingEntity::update_many()
            .col_expr(
                booking::Column::Status,
                Expr::value(BookingStatus::Cancelled.as_str()),
            )
            .col_expr(booking::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(booking::Column::Id.eq(booking_id))
            .filter(
                booking::Column::Status.is_in([
                    BookingStatus::Reserved.as_str(),
                    BookingStatus::Confirmed.as_str(),
                ]),
            )
            .exec(&txn)
            .await
            .map_err(|e| StepFailure::retryable("INTERNAL_ERROR", e.to_string()))?;

        if updated.rows_affected > 0 {
            outbox::enqueue(
                &txn,
                "booking",
                Some(booking_id),
                &Event::BookingCancelled {
                    booking_id,
                    event_id: row.event_id,
                    zone_id: row.zone_id,
                    quantity: row.quantity,
                },
            )
            .await
            .map_err(|e| StepFailure::retryable("INTERNAL_ERROR", e.to_string()))?;
        }
        txn.commit()
            .await
            .map_err(|e| StepFailure::retryable("INTERNAL_ERROR", e.to_string()))?;

        info!(booking_id = %booking_id, "booking compensated");
        Ok(json!({"booking_id": booking_id, "status": "cancelled"}))
    }
}

/// Refunds ride the payment collaborator's pipeline; the core only records
/// that the request went out.
pub struct RefundPaymentHandler;

#[async_trait]
impl StepHandler for RefundPaymentHandler {
    fn step_name(&self) -> &'static str {
        COMPENSATION_REFUND_PAYMENT
    }

    async fn execute(&self, message: &Message) -> Result<Value, StepFailure> {
        let payment_id = message
            .data
            .get("payment_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        info!(payment_id, "refund requested from payment service");
        Ok(json!({"payment_id": payment_id, "refund": "requested"}))
    }
}
