/*!
 * # Message Bus
 *
 * Carries saga commands, step outcome events, and lifecycle events between
 * the orchestrator and its workers. Delivery is at-least-once: every
 * message carries an idempotency key and consumers must tolerate replays.
 *
 * Two backends: an in-memory queue for tests and single-process
 * deployments, and a Redis list-backed queue (BRPOPLPUSH into a processing
 * list, ack removes, nack requeues) for multi-instance deployments.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Topic names used on the bus.
pub mod topics {
    pub const PAYMENT_SUCCESS: &str = "payment.success";

    pub fn step_command(saga_name: &str, step_name: &str) -> String {
        format!("saga.{}.{}.command", saga_name, step_name)
    }

    pub fn step_success(saga_name: &str, step_name: &str) -> String {
        format!("saga.{}.{}.success.event", saga_name, step_name)
    }

    pub fn step_failure(saga_name: &str, step_name: &str) -> String {
        format!("saga.{}.{}.failure.event", saga_name, step_name)
    }

    pub fn lifecycle(saga_name: &str, phase: &str) -> String {
        format!("saga.{}.{}.event", saga_name, phase)
    }
}

/// Message queue errors
#[derive(Error, Debug)]
pub enum MessageQueueError {
    #[error("queue is full")]
    QueueFull,
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
}

/// Bus message envelope.
///
/// `data` carries the full payload a step needs; the saga fields are set on
/// command and step-event messages and absent on plain domain triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<i32>,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub produced_at: DateTime<Utc>,
}

impl Message {
    pub fn new(message_type: impl Into<String>, data: serde_json::Value) -> Self {
        let message_type = message_type.into();
        Self {
            message_id: Uuid::new_v4(),
            idempotency_key: format!("{}:{}", message_type, Uuid::new_v4()),
            message_type,
            saga_id: None,
            saga_name: None,
            step_name: None,
            step_index: None,
            data,
            error_code: None,
            error_message: None,
            timeout_at: None,
            produced_at: Utc::now(),
        }
    }

    pub fn with_saga(
        mut self,
        saga_id: Uuid,
        saga_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: i32,
    ) -> Self {
        let step_name = step_name.into();
        self.idempotency_key = format!("{}:{}:{}", saga_id, step_index, step_name);
        self.saga_id = Some(saga_id);
        self.saga_name = Some(saga_name.into());
        self.step_name = Some(step_name);
        self.step_index = Some(step_index);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn with_timeout(mut self, timeout_at: DateTime<Utc>) -> Self {
        self.timeout_at = Some(timeout_at);
        self
    }
}

/// Message queue seam shared by the orchestrator and workers.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), MessageQueueError>;
    /// Non-blocking pop; `None` when the topic is empty.
    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError>;
    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
}

/// In-memory message queue implementation
#[derive(Debug)]
pub struct InMemoryMessageQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<Message>>>>,
    max_size: usize,
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::with_max_size(10_000)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            max_size,
        }
    }

    /// Number of messages waiting on a topic (test observability).
    pub fn depth(&self, topic: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(topic)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), MessageQueueError> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(topic.to_string()).or_default();
        if queue.len() >= self.max_size {
            return Err(MessageQueueError::QueueFull);
        }
        queue.push_back(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut queues = self.queues.lock().unwrap();
        Ok(queues.get_mut(topic).and_then(|q| q.pop_front()))
    }

    async fn ack(&self, _message_id: &Uuid) -> Result<(), MessageQueueError> {
        Ok(())
    }

    async fn nack(&self, _message_id: &Uuid) -> Result<(), MessageQueueError> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct InFlightRecord {
    topic: String,
    payload: String,
}

/// Redis-backed message queue for cross-instance delivery.
#[derive(Debug)]
pub struct RedisMessageQueue {
    client: Arc<redis::Client>,
    namespace: String,
    block_timeout: Duration,
    inflight: Arc<Mutex<HashMap<Uuid, InFlightRecord>>>,
}

impl RedisMessageQueue {
    const DEFAULT_NAMESPACE: &'static str = "bookrush:mq";

    pub async fn new(
        client: Arc<redis::Client>,
        namespace: impl Into<String>,
        block_timeout: Duration,
    ) -> Result<Self, MessageQueueError> {
        let namespace = namespace.into();
        let namespace = if namespace.trim().is_empty() {
            Self::DEFAULT_NAMESPACE.to_string()
        } else {
            namespace
        };

        let queue = Self {
            client,
            namespace,
            block_timeout,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        };
        queue.recover_stalled_messages().await?;
        Ok(queue)
    }

    fn queue_key(&self, topic: &str) -> String {
        format!("{}:queue:{}", self.namespace, topic)
    }

    fn processing_key(&self, topic: &str) -> String {
        format!("{}:processing:{}", self.namespace, topic)
    }

    fn topics_key(&self) -> String {
        format!("{}:topics", self.namespace)
    }

    /// Moves anything stranded in processing lists (a consumer died
    /// mid-flight) back onto its queue.
    async fn recover_stalled_messages(&self) -> Result<(), MessageQueueError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;

        let known_topics: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.topics_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;

        for topic in known_topics {
            loop {
                let payload: Option<String> = redis::cmd("RPOPLPUSH")
                    .arg(self.processing_key(&topic))
                    .arg(self.queue_key(&topic))
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;
                if payload.is_none() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn block_timeout_secs(&self) -> usize {
        self.block_timeout.as_secs().max(1) as usize
    }
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), MessageQueueError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;

        let payload = serde_json::to_string(&message)
            .map_err(|e| MessageQueueError::SerializationError(e.to_string()))?;

        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(self.queue_key(topic))
            .arg(&payload)
            .cmd("SADD")
            .arg(self.topics_key())
            .arg(topic)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(self.queue_key(topic))
            .arg(self.processing_key(topic))
            .arg(self.block_timeout_secs())
            .query_async(&mut conn)
            .await
            .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;

        if let Some(payload) = result {
            let message: Message = serde_json::from_str(&payload)
                .map_err(|e| MessageQueueError::SerializationError(e.to_string()))?;

            self.inflight.lock().unwrap().insert(
                message.message_id,
                InFlightRecord {
                    topic: topic.to_string(),
                    payload,
                },
            );
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }

    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        let record = self.inflight.lock().unwrap().remove(message_id);

        if let Some(record) = record {
            let mut conn = self
                .client
                .get_async_connection()
                .await
                .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;

            redis::cmd("LREM")
                .arg(self.processing_key(&record.topic))
                .arg(1)
                .arg(&record.payload)
                .query_async::<_, i64>(&mut conn)
                .await
                .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;
        }
        Ok(())
    }

    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        let record = self.inflight.lock().unwrap().remove(message_id);

        if let Some(record) = record {
            let mut conn = self
                .client
                .get_async_connection()
                .await
                .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;

            redis::pipe()
                .atomic()
                .cmd("LREM")
                .arg(self.processing_key(&record.topic))
                .arg(1)
                .arg(&record.payload)
                .cmd("RPUSH")
                .arg(self.queue_key(&record.topic))
                .arg(&record.payload)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_queue_round_trip() {
        let queue = InMemoryMessageQueue::new();
        let message = Message::new("payment.success", json!({"booking_id": "b1"}));
        let id = message.message_id;

        queue.publish(topics::PAYMENT_SUCCESS, message).await.unwrap();
        assert_eq!(queue.depth(topics::PAYMENT_SUCCESS), 1);

        let received = queue.subscribe(topics::PAYMENT_SUCCESS).await.unwrap();
        let received = received.expect("message missing");
        assert_eq!(received.message_id, id);

        assert!(queue
            .subscribe(topics::PAYMENT_SUCCESS)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn in_memory_queue_enforces_capacity() {
        let queue = InMemoryMessageQueue::with_max_size(1);
        queue
            .publish("t", Message::new("a", json!({})))
            .await
            .unwrap();
        let err = queue.publish("t", Message::new("b", json!({}))).await;
        assert!(matches!(err, Err(MessageQueueError::QueueFull)));
    }

    #[test]
    fn saga_messages_share_idempotency_key_per_step() {
        let saga_id = Uuid::new_v4();
        let first = Message::new("x", json!({})).with_saga(saga_id, "booking", "confirm-booking", 0);
        let second =
            Message::new("x", json!({})).with_saga(saga_id, "booking", "confirm-booking", 0);
        assert_eq!(first.idempotency_key, second.idempotency_key);
        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn topic_names_follow_convention() {
        assert_eq!(
            topics::step_command("booking", "confirm-booking"),
            "saga.booking.confirm-booking.command"
        );
        assert_eq!(
            topics::step_success("booking", "send-notification"),
            "saga.booking.send-notification.success.event"
        );
        assert_eq!(
            topics::step_failure("booking", "confirm-booking"),
            "saga.booking.confirm-booking.failure.event"
        );
        assert_eq!(
            topics::lifecycle("booking", "completed"),
            "saga.booking.completed.event"
        );
    }
}
