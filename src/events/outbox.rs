//! Transactional outbox.
//!
//! Domain events are enqueued in the same transaction as the booking state
//! change; a polling publisher claims pending entries and hands them to the
//! in-process event loop, retrying with exponential backoff until delivered
//! or the attempt budget runs out. Delivery is therefore at-least-once and
//! consumers must be idempotent.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::outbox_event::{self, Entity as OutboxEventEntity, OutboxStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::message_queue::{Message, MessageQueue};

const MAX_ATTEMPTS: i32 = 8;
const BASE_BACKOFF_SECS: u64 = 2;

/// Enqueues a domain event. Call inside the same transaction as the write
/// it describes.
pub async fn enqueue(
    db: &impl ConnectionTrait,
    aggregate_type: &str,
    aggregate_id: Option<Uuid>,
    event: &Event,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let entry = outbox_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        aggregate_type: Set(aggregate_type.to_string()),
        aggregate_id: Set(aggregate_id),
        event_type: Set(event.event_type().to_string()),
        payload: Set(event.payload().to_string()),
        status: Set(OutboxStatus::Pending.as_str().to_string()),
        attempts: Set(0),
        available_at: Set(now),
        processed_at: Set(None),
        error_message: Set(None),
        ..Default::default()
    };
    entry.insert(db).await?;
    debug!(
        event_type = event.event_type(),
        aggregate_type, "enqueued outbox event"
    );
    Ok(())
}

/// Publisher loop. Drains pending entries until the shutdown signal flips.
pub async fn run_publisher(
    db: Arc<DatabaseConnection>,
    sender: EventSender,
    bus: Option<Arc<dyn MessageQueue>>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("outbox publisher started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = sleep(poll_interval) => {
                if let Err(e) = drain_once(&db, &sender, bus.as_deref(), 50).await {
                    error!(error = %e, "outbox publisher pass failed");
                }
            }
        }
    }
    info!("outbox publisher stopped");
}

/// One publisher pass: claim up to `batch_size` due entries, dispatch each
/// (to the message bus when one is wired, and always to the in-process
/// loop), and record the outcome. Claiming is an optimistic conditional
/// update so concurrent publishers never double-send a delivered entry.
pub async fn drain_once(
    db: &DatabaseConnection,
    sender: &EventSender,
    bus: Option<&dyn MessageQueue>,
    batch_size: u64,
) -> Result<usize, ServiceError> {
    let now = Utc::now();
    let due = OutboxEventEntity::find()
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending.as_str()))
        .filter(outbox_event::Column::AvailableAt.lte(now))
        .order_by_asc(outbox_event::Column::CreatedAt)
        .limit(batch_size)
        .all(db)
        .await?;

    let mut dispatched = 0usize;
    for entry in due {
        let claimed = OutboxEventEntity::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Processing.as_str()),
            )
            .col_expr(
                outbox_event::Column::Attempts,
                Expr::col(outbox_event::Column::Attempts).add(1),
            )
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(outbox_event::Column::Id.eq(entry.id))
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending.as_str()))
            .exec(db)
            .await?;
        if claimed.rows_affected == 0 {
            continue;
        }

        let payload: serde_json::Value =
            serde_json::from_str(&entry.payload).unwrap_or(serde_json::Value::Null);
        let event = map_to_event(&entry.event_type, &payload)
            .unwrap_or_else(|| Event::with_data(entry.event_type.clone()));

        let bus_ok = match bus {
            Some(bus) => bus
                .publish(
                    &entry.event_type,
                    Message::new(entry.event_type.clone(), payload.clone()),
                )
                .await
                .is_ok(),
            None => true,
        };

        if bus_ok && sender.send(event).await.is_ok() {
            mark_delivered(db, entry.id).await?;
            dispatched += 1;
        } else {
            schedule_retry(db, entry.id, entry.attempts + 1).await?;
        }
    }
    Ok(dispatched)
}

async fn mark_delivered(db: &DatabaseConnection, id: Uuid) -> Result<(), ServiceError> {
    let now = Utc::now();
    OutboxEventEntity::update_many()
        .col_expr(
            outbox_event::Column::Status,
            Expr::value(OutboxStatus::Delivered.as_str()),
        )
        .col_expr(outbox_event::Column::ProcessedAt, Expr::value(Some(now)))
        .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
        .col_expr(
            outbox_event::Column::ErrorMessage,
            Expr::value(None::<String>),
        )
        .filter(outbox_event::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

async fn schedule_retry(
    db: &DatabaseConnection,
    id: Uuid,
    attempts: i32,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    if attempts < MAX_ATTEMPTS {
        let delay = retry_delay(attempts);
        OutboxEventEntity::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Pending.as_str()),
            )
            .col_expr(
                outbox_event::Column::AvailableAt,
                Expr::value(now + delay),
            )
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                outbox_event::Column::ErrorMessage,
                Expr::value(Some("send failed".to_string())),
            )
            .filter(outbox_event::Column::Id.eq(id))
            .exec(db)
            .await?;
    } else {
        warn!(outbox_id = %id, "outbox entry exceeded max attempts");
        OutboxEventEntity::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Failed.as_str()),
            )
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                outbox_event::Column::ErrorMessage,
                Expr::value(Some("max attempts exceeded".to_string())),
            )
            .filter(outbox_event::Column::Id.eq(id))
            .exec(db)
            .await?;
    }
    Ok(())
}

/// Exponential backoff with millisecond jitter: `base^attempts` seconds,
/// capped at five minutes.
fn retry_delay(attempts: i32) -> ChronoDuration {
    let secs = BASE_BACKOFF_SECS
        .saturating_pow(attempts.max(1) as u32)
        .min(300);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    ChronoDuration::seconds(secs as i64) + ChronoDuration::milliseconds(jitter_ms)
}

fn map_to_event(event_type: &str, payload: &serde_json::Value) -> Option<Event> {
    let uuid_field = |name: &str| -> Option<Uuid> {
        payload
            .get(name)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    };
    let quantity = payload
        .get("quantity")
        .and_then(|v| v.as_i64())
        .unwrap_or(0) as i32;

    match event_type {
        "booking.reserved" => Some(Event::BookingReserved {
            booking_id: uuid_field("booking_id")?,
            user_id: uuid_field("user_id")?,
            event_id: uuid_field("event_id")?,
            zone_id: uuid_field("zone_id")?,
            quantity,
        }),
        "booking.confirmed" => Some(Event::BookingConfirmed {
            booking_id: uuid_field("booking_id")?,
            event_id: uuid_field("event_id")?,
            zone_id: uuid_field("zone_id")?,
            quantity,
            payment_id: payload
                .get("payment_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        }),
        "booking.cancelled" => Some(Event::BookingCancelled {
            booking_id: uuid_field("booking_id")?,
            event_id: uuid_field("event_id")?,
            zone_id: uuid_field("zone_id")?,
            quantity,
        }),
        "booking.expired" => Some(Event::BookingExpired {
            booking_id: uuid_field("booking_id")?,
            event_id: uuid_field("event_id")?,
            zone_id: uuid_field("zone_id")?,
            quantity,
        }),
        "saga.booking.started.event" => Some(Event::SagaStarted {
            saga_id: uuid_field("saga_id")?,
            definition_id: payload
                .get("definition_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "saga.booking.completed.event" => Some(Event::SagaCompleted {
            saga_id: uuid_field("saga_id")?,
        }),
        "saga.booking.failed.event" => Some(Event::SagaFailed {
            saga_id: uuid_field("saga_id")?,
            error: payload
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "saga.booking.compensated.event" => Some(Event::SagaCompensated {
            saga_id: uuid_field("saga_id")?,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_booking_reserved_event() {
        let booking_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let event_id = Uuid::new_v4();
        let zone_id = Uuid::new_v4();
        let payload = json!({
            "booking_id": booking_id.to_string(),
            "user_id": user_id.to_string(),
            "event_id": event_id.to_string(),
            "zone_id": zone_id.to_string(),
            "quantity": 3,
        });

        let event = map_to_event("booking.reserved", &payload).expect("event not mapped");
        match event {
            Event::BookingReserved {
                booking_id: mapped,
                quantity,
                ..
            } => {
                assert_eq!(mapped, booking_id);
                assert_eq!(quantity, 3);
            }
            other => unreachable!("expected BookingReserved, got {:?}", other),
        }
    }

    #[test]
    fn unknown_event_type_maps_to_none() {
        assert!(map_to_event("warehouse.rebalanced", &json!({})).is_none());
    }

    #[test]
    fn retry_delay_grows_and_is_capped() {
        let d1 = retry_delay(1);
        let d3 = retry_delay(3);
        assert!(d1 >= ChronoDuration::seconds(2));
        assert!(d3 >= ChronoDuration::seconds(8));
        assert!(retry_delay(30) <= ChronoDuration::seconds(301));
    }

    #[test]
    fn round_trips_event_payloads() {
        let event = Event::BookingExpired {
            booking_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            zone_id: Uuid::new_v4(),
            quantity: 2,
        };
        let mapped = map_to_event(event.event_type(), &event.payload()).unwrap();
        assert_eq!(mapped.event_type(), "booking.expired");
    }
}
