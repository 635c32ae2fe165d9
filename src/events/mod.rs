use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub mod outbox;

/// Domain events emitted by the booking core.
///
/// These flow through the outbox to the in-process event loop, where
/// registered handlers (the inventory sync worker among them) consume them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    BookingReserved {
        booking_id: Uuid,
        user_id: Uuid,
        event_id: Uuid,
        zone_id: Uuid,
        quantity: i32,
    },
    BookingConfirmed {
        booking_id: Uuid,
        event_id: Uuid,
        zone_id: Uuid,
        quantity: i32,
        payment_id: Option<String>,
    },
    BookingCancelled {
        booking_id: Uuid,
        event_id: Uuid,
        zone_id: Uuid,
        quantity: i32,
    },
    BookingExpired {
        booking_id: Uuid,
        event_id: Uuid,
        zone_id: Uuid,
        quantity: i32,
    },
    SagaStarted {
        saga_id: Uuid,
        definition_id: String,
    },
    SagaCompleted {
        saga_id: Uuid,
    },
    SagaFailed {
        saga_id: Uuid,
        error: String,
    },
    SagaCompensated {
        saga_id: Uuid,
    },
    Generic {
        message: String,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    },
}

impl Event {
    /// Outbox/bus event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::BookingReserved { .. } => "booking.reserved",
            Event::BookingConfirmed { .. } => "booking.confirmed",
            Event::BookingCancelled { .. } => "booking.cancelled",
            Event::BookingExpired { .. } => "booking.expired",
            Event::SagaStarted { .. } => "saga.booking.started.event",
            Event::SagaCompleted { .. } => "saga.booking.completed.event",
            Event::SagaFailed { .. } => "saga.booking.failed.event",
            Event::SagaCompensated { .. } => "saga.booking.compensated.event",
            Event::Generic { .. } => "generic",
        }
    }

    /// Payload written to the outbox for this event.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Event::BookingReserved {
                booking_id,
                user_id,
                event_id,
                zone_id,
                quantity,
            } => json!({
                "booking_id": booking_id,
                "user_id": user_id,
                "event_id": event_id,
                "zone_id": zone_id,
                "quantity": quantity,
            }),
            Event::BookingConfirmed {
                booking_id,
                event_id,
                zone_id,
                quantity,
                payment_id,
            } => json!({
                "booking_id": booking_id,
                "event_id": event_id,
                "zone_id": zone_id,
                "quantity": quantity,
                "payment_id": payment_id,
            }),
            Event::BookingCancelled {
                booking_id,
                event_id,
                zone_id,
                quantity,
            }
            | Event::BookingExpired {
                booking_id,
                event_id,
                zone_id,
                quantity,
            } => json!({
                "booking_id": booking_id,
                "event_id": event_id,
                "zone_id": zone_id,
                "quantity": quantity,
            }),
            Event::SagaStarted {
                saga_id,
                definition_id,
            } => json!({"saga_id": saga_id, "definition_id": definition_id}),
            Event::SagaCompleted { saga_id } | Event::SagaCompensated { saga_id } => {
                json!({"saga_id": saga_id})
            }
            Event::SagaFailed { saga_id, error } => {
                json!({"saga_id": saga_id, "error": error})
            }
            Event::Generic {
                message, metadata, ..
            } => json!({"message": message, "metadata": metadata}),
        }
    }

    pub fn with_data(data: String) -> Self {
        Event::Generic {
            message: data,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("failed to send event: {}", e))
    }
}

/// Handlers registered with the event loop process events asynchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Distributes incoming events to every registered handler. Ends when the
/// sending side is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("starting event processing loop");

    while let Some(event) = rx.recv().await {
        for handler in &handlers {
            if let Err(e) = handler.handle_event(event.clone()).await {
                warn!(
                    event_type = event.event_type(),
                    error = %e,
                    "event handler failed"
                );
            }
        }
    }

    info!("event processing loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: Event) -> Result<(), String> {
            self.seen
                .lock()
                .unwrap()
                .push(event.event_type().to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_reach_every_handler() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);

        let loop_handle = tokio::spawn(process_events(rx, vec![recorder.clone()]));

        sender
            .send(Event::BookingExpired {
                booking_id: Uuid::new_v4(),
                event_id: Uuid::new_v4(),
                zone_id: Uuid::new_v4(),
                quantity: 1,
            })
            .await
            .unwrap();
        drop(sender);
        loop_handle.await.unwrap();

        assert_eq!(
            recorder.seen.lock().unwrap().as_slice(),
            ["booking.expired"]
        );
    }

    #[test]
    fn event_types_match_topics() {
        let event = Event::BookingReserved {
            booking_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            zone_id: Uuid::new_v4(),
            quantity: 2,
        };
        assert_eq!(event.event_type(), "booking.reserved");
        assert!(event.payload().get("booking_id").is_some());
    }
}
