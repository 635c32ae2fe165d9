//! Saga orchestrator.
//!
//! Consumes `payment.success` triggers, advances instances step by step
//! over the bus, enforces step timeouts, and drives reverse-order
//! compensation when a step fails for good. All instance writes go through
//! the optimistic-concurrency store so replicas never fight.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::saga_instance::SagaStatus;
use crate::errors::ServiceError;
use crate::message_queue::{topics, Message, MessageQueue};
use crate::saga::store::{SagaRecord, SagaStore, StepResult, StepResultStatus};
use crate::saga::{SagaDefinition, COMPENSATION_REFUND_PAYMENT};

/// Namespace for deriving saga ids from booking ids; replayed payment
/// triggers land on the same instance.
const SAGA_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x92, 0x4e, 0x17, 0xa8, 0x0b, 0x45, 0xd2, 0x8f, 0x6a, 0x1e, 0x5b, 0xc4, 0x07, 0xd9,
    0x2e,
]);

const MAX_TIMEOUT_CHECKS: i32 = 10;

pub fn saga_id_for_booking(booking_id: Uuid) -> Uuid {
    Uuid::new_v5(&SAGA_ID_NAMESPACE, booking_id.as_bytes())
}

pub struct SagaOrchestrator {
    store: Arc<dyn SagaStore>,
    queue: Arc<dyn MessageQueue>,
    definition: SagaDefinition,
    /// Base delay for retry backoff; production default 500ms, zero in
    /// tests for determinism.
    retry_base: Duration,
    /// Whole-run budget; a saga older than this fails at its next timeout
    /// check regardless of remaining retries.
    run_timeout: Duration,
}

impl SagaOrchestrator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        queue: Arc<dyn MessageQueue>,
        definition: SagaDefinition,
    ) -> Self {
        Self {
            store,
            queue,
            definition,
            retry_base: Duration::from_millis(500),
            run_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    /// Loop entry point.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(definition = self.definition.id, "saga orchestrator started");
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
                        error!(error = %e, "orchestrator tick failed");
                    }
                }
            }
        }
        info!("saga orchestrator stopped");
    }

    /// One orchestration pass: drain triggers and step outcomes, then run
    /// the timeout scan. Public so tests can drive the machine
    /// deterministically.
    pub async fn tick(&self) -> Result<(), ServiceError> {
        while let Some(msg) = self.subscribe(topics::PAYMENT_SUCCESS).await? {
            let id = msg.message_id;
            if let Err(e) = self.handle_payment_success(&msg).await {
                warn!(error = %e, "failed to handle payment trigger");
            }
            self.ack(&id).await;
        }

        for step in &self.definition.steps {
            let success_topic = topics::step_success(self.definition.name, step.name);
            while let Some(msg) = self.subscribe(&success_topic).await? {
                let id = msg.message_id;
                if let Err(e) = self.handle_step_success(&msg).await {
                    warn!(step = step.name, error = %e, "failed to handle step success");
                }
                self.ack(&id).await;
            }

            let failure_topic = topics::step_failure(self.definition.name, step.name);
            while let Some(msg) = self.subscribe(&failure_topic).await? {
                let id = msg.message_id;
                if let Err(e) = self.handle_step_failure(&msg).await {
                    warn!(step = step.name, error = %e, "failed to handle step failure");
                }
                self.ack(&id).await;
            }
        }

        self.check_timeouts().await?;
        Ok(())
    }

    #[instrument(skip(self, msg))]
    async fn handle_payment_success(&self, msg: &Message) -> Result<(), ServiceError> {
        let booking_id = msg
            .data
            .get("booking_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                ServiceError::Validation("payment.success without booking_id".to_string())
            })?;
        let saga_id = saga_id_for_booking(booking_id);

        if let Some(existing) = self.store.fetch(saga_id).await? {
            debug!(saga_id = %saga_id, status = existing.status.as_str(), "duplicate payment trigger ignored");
            return Ok(());
        }

        let record = SagaRecord::new(saga_id, self.definition.id, msg.data.clone());
        if let Err(e) = self.store.insert(&record).await {
            // Concurrent trigger delivery; the winner carries on.
            debug!(saga_id = %saga_id, error = %e, "saga insert raced");
            return Ok(());
        }

        let mut record = record;
        record.status = SagaStatus::Running;
        record.current_step_index = 0;
        self.arm_step_timeout(&mut record, 0);
        if !self.store.update(&record, 0).await? {
            return Ok(());
        }
        record.version = 1;

        self.publish_lifecycle(&record, "started", json!({"booking_id": booking_id}))
            .await?;
        self.send_step_command(&record, 0).await?;
        info!(saga_id = %saga_id, booking_id = %booking_id, "booking saga started");
        Ok(())
    }

    #[instrument(skip(self, msg))]
    async fn handle_step_success(&self, msg: &Message) -> Result<(), ServiceError> {
        let (saga_id, step_index) = match (msg.saga_id, msg.step_index) {
            (Some(s), Some(i)) => (s, i),
            _ => return Ok(()),
        };
        let Some(mut record) = self.store.fetch(saga_id).await? else {
            warn!(saga_id = %saga_id, "success event for unknown saga");
            return Ok(());
        };
        if record.status != SagaStatus::Running
            || step_index != record.current_step_index
            || record.has_result_for(step_index)
        {
            debug!(saga_id = %saga_id, step_index, "stale or duplicate success event ignored");
            return Ok(());
        }
        let Some(step) = self.definition.step(step_index) else {
            return Ok(());
        };

        let expected_version = record.version;
        record.step_results.push(StepResult {
            step_index,
            step_name: step.name.to_string(),
            status: StepResultStatus::Completed,
            output: msg.data.clone(),
            error: None,
            recorded_at: Utc::now(),
        });
        merge_data(&mut record.data, &msg.data);

        if self.definition.is_last_step(step_index) {
            record.status = SagaStatus::Completed;
            record.completed_at = Some(Utc::now());
            record.timeout_at = None;
            if self.store.update(&record, expected_version).await? {
                self.publish_lifecycle(&record, "completed", json!({})).await?;
                info!(saga_id = %saga_id, "booking saga completed");
            }
            return Ok(());
        }

        let next_index = step_index + 1;
        record.current_step_index = next_index;
        record.step_retries = 0;
        record.timeout_checks = 0;
        self.arm_step_timeout(&mut record, next_index);
        if self.store.update(&record, expected_version).await? {
            self.send_step_command(&record, next_index).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, msg))]
    async fn handle_step_failure(&self, msg: &Message) -> Result<(), ServiceError> {
        let (saga_id, step_index) = match (msg.saga_id, msg.step_index) {
            (Some(s), Some(i)) => (s, i),
            _ => return Ok(()),
        };
        let Some(record) = self.store.fetch(saga_id).await? else {
            warn!(saga_id = %saga_id, "failure event for unknown saga");
            return Ok(());
        };
        if record.status != SagaStatus::Running
            || step_index != record.current_step_index
            || record.has_result_for(step_index)
        {
            debug!(saga_id = %saga_id, step_index, "stale or duplicate failure event ignored");
            return Ok(());
        }

        let retryable = msg
            .data
            .get("retryable")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let code = msg.error_code.clone().unwrap_or_else(|| "STEP_FAILED".to_string());
        let message = msg
            .error_message
            .clone()
            .unwrap_or_else(|| "step failed".to_string());

        self.fail_step(record, step_index, &code, &message, retryable)
            .await
    }

    /// Applies a step failure: either spends a retry or starts
    /// compensation.
    async fn fail_step(
        &self,
        mut record: SagaRecord,
        step_index: i32,
        code: &str,
        message: &str,
        retryable: bool,
    ) -> Result<(), ServiceError> {
        let Some(step) = self.definition.step(step_index) else {
            return Ok(());
        };

        if retryable && (record.step_retries as u32) < step.max_retries {
            let expected_version = record.version;
            record.step_retries += 1;
            self.arm_step_timeout(&mut record, step_index);
            if !self.store.update(&record, expected_version).await? {
                return Ok(());
            }
            record.version = expected_version + 1;
            let delay = self.retry_delay(record.step_retries);
            info!(
                saga_id = %record.id,
                step = step.name,
                attempt = record.step_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying saga step"
            );
            self.resend_after(&record, step_index, delay);
            return Ok(());
        }

        warn!(
            saga_id = %record.id,
            step = step.name,
            code,
            "saga step failed; compensating"
        );

        let expected_version = record.version;
        record.step_results.push(StepResult {
            step_index,
            step_name: step.name.to_string(),
            status: StepResultStatus::Failed,
            output: Value::Null,
            error: Some(format!("{}: {}", code, message)),
            recorded_at: Utc::now(),
        });
        record.status = SagaStatus::Compensating;
        record.error = Some(format!("{}: {}", code, message));
        record.timeout_at = None;
        if !self.store.update(&record, expected_version).await? {
            return Ok(());
        }
        record.version = expected_version + 1;

        self.compensate(record).await
    }

    /// Emits compensation commands in reverse order for every previously
    /// completed step that declares one, plus a refund when the trigger
    /// carried a payment.
    async fn compensate(&self, mut record: SagaRecord) -> Result<(), ServiceError> {
        let mut emissions: Vec<(i32, String, String)> = Vec::new();
        for completed in record.completed_steps() {
            if let Some(step) = self.definition.step(completed.step_index) {
                if let Some(compensation) = step.compensation {
                    emissions.push((
                        completed.step_index,
                        step.name.to_string(),
                        compensation.to_string(),
                    ));
                }
            }
        }

        let refund_payment = record
            .data
            .get("payment_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        for (step_index, step_name, compensation) in &emissions {
            let command = Message::new(
                topics::step_command(self.definition.name, compensation),
                record.data.clone(),
            )
            .with_saga(record.id, self.definition.name, compensation.clone(), *step_index);
            if let Err(e) = self
                .queue
                .publish(&topics::step_command(self.definition.name, compensation), command)
                .await
            {
                return self.mark_failed(record, &format!("compensation publish failed: {}", e)).await;
            }
            record.step_results.push(StepResult {
                step_index: *step_index,
                step_name: step_name.clone(),
                status: StepResultStatus::CompensationEmitted,
                output: json!({"compensation": compensation}),
                error: None,
                recorded_at: Utc::now(),
            });
        }

        if let Some(payment_id) = refund_payment {
            let topic = topics::step_command(self.definition.name, COMPENSATION_REFUND_PAYMENT);
            let command = Message::new(&topic, record.data.clone()).with_saga(
                record.id,
                self.definition.name,
                COMPENSATION_REFUND_PAYMENT,
                record.current_step_index,
            );
            if let Err(e) = self.queue.publish(&topic, command).await {
                return self
                    .mark_failed(record, &format!("refund publish failed: {}", e))
                    .await;
            }
            debug!(saga_id = %record.id, payment_id, "refund command emitted");
        }

        let expected_version = record.version;
        record.status = SagaStatus::Compensated;
        record.completed_at = Some(Utc::now());
        if self.store.update(&record, expected_version).await? {
            self.publish_lifecycle(&record, "compensated", json!({})).await?;
            info!(saga_id = %record.id, "booking saga compensated");
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        mut record: SagaRecord,
        reason: &str,
    ) -> Result<(), ServiceError> {
        error!(saga_id = %record.id, reason, "saga failed terminally");
        let expected_version = record.version;
        record.status = SagaStatus::Failed;
        record.error = Some(reason.to_string());
        record.completed_at = Some(Utc::now());
        if self.store.update(&record, expected_version).await? {
            self.publish_lifecycle(&record, "failed", json!({"error": reason}))
                .await?;
        }
        Ok(())
    }

    /// Timeout scan: a step past its deadline either spends a retry (and a
    /// bounded timeout check) or fails with `STEP_TIMEOUT`.
    pub async fn check_timeouts(&self) -> Result<(), ServiceError> {
        let due = self.store.due_for_timeout_check(Utc::now()).await?;
        for mut record in due {
            let step_index = record.current_step_index;
            let Some(step) = self.definition.step(step_index) else {
                continue;
            };
            let run_budget = ChronoDuration::from_std(self.run_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(60));
            let over_budget = Utc::now().signed_duration_since(record.created_at) >= run_budget;
            let retries_left = (record.step_retries as u32) < step.max_retries;
            if !over_budget && retries_left && record.timeout_checks < MAX_TIMEOUT_CHECKS {
                let expected_version = record.version;
                record.timeout_checks += 1;
                record.step_retries += 1;
                self.arm_step_timeout(&mut record, step_index);
                if self.store.update(&record, expected_version).await? {
                    warn!(
                        saga_id = %record.id,
                        step = step.name,
                        check = record.timeout_checks,
                        "step timed out; re-issuing command"
                    );
                    self.send_step_command(&record, step_index).await?;
                }
            } else {
                self.fail_step(
                    record,
                    step_index,
                    "STEP_TIMEOUT",
                    "step timed out without an outcome",
                    false,
                )
                .await?;
            }
        }
        Ok(())
    }

    fn arm_step_timeout(&self, record: &mut SagaRecord, step_index: i32) {
        if let Some(step) = self.definition.step(step_index) {
            let timeout = ChronoDuration::from_std(step.timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(30));
            record.timeout_at = Some(Utc::now() + timeout);
        }
    }

    async fn send_step_command(
        &self,
        record: &SagaRecord,
        step_index: i32,
    ) -> Result<(), ServiceError> {
        let Some(step) = self.definition.step(step_index) else {
            return Ok(());
        };
        let topic = topics::step_command(self.definition.name, step.name);
        let mut command = Message::new(&topic, record.data.clone()).with_saga(
            record.id,
            self.definition.name,
            step.name,
            step_index,
        );
        if let Some(timeout_at) = record.timeout_at {
            command = command.with_timeout(timeout_at);
        }
        self.queue
            .publish(&topic, command)
            .await
            .map_err(|e| ServiceError::MessageQueue(e.to_string()))
    }

    fn resend_after(&self, record: &SagaRecord, step_index: i32, delay: Duration) {
        let queue = self.queue.clone();
        let Some(step) = self.definition.step(step_index) else {
            return;
        };
        let topic = topics::step_command(self.definition.name, step.name);
        let command = Message::new(&topic, record.data.clone()).with_saga(
            record.id,
            self.definition.name,
            step.name,
            step_index,
        );
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if let Err(e) = queue.publish(&topic, command).await {
                error!(error = %e, topic, "failed to re-issue step command");
            }
        });
    }

    /// `base * 2^attempt` with millisecond jitter.
    fn retry_delay(&self, attempt: i32) -> Duration {
        if self.retry_base.is_zero() {
            return Duration::ZERO;
        }
        let exp = self.retry_base.as_millis() as u64 * 2u64.saturating_pow(attempt.max(0) as u32);
        let jitter = rand::thread_rng().gen_range(0..100);
        Duration::from_millis(exp.min(30_000) + jitter)
    }

    async fn publish_lifecycle(
        &self,
        record: &SagaRecord,
        phase: &str,
        mut extra: Value,
    ) -> Result<(), ServiceError> {
        let topic = topics::lifecycle(self.definition.name, phase);
        merge_data(
            &mut extra,
            &json!({"saga_id": record.id, "definition_id": record.definition_id}),
        );
        self.queue
            .publish(&topic, Message::new(&topic, extra))
            .await
            .map_err(|e| ServiceError::MessageQueue(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, ServiceError> {
        self.queue
            .subscribe(topic)
            .await
            .map_err(|e| ServiceError::MessageQueue(e.to_string()))
    }

    async fn ack(&self, message_id: &Uuid) {
        if let Err(e) = self.queue.ack(message_id).await {
            warn!(error = %e, "message ack failed");
        }
    }
}

/// Shallow object merge: overlay keys win.
fn merge_data(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        (base_slot, overlay) => {
            if !overlay.is_null() {
                *base_slot = overlay.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_ids_are_stable_per_booking() {
        let booking = Uuid::new_v4();
        assert_eq!(saga_id_for_booking(booking), saga_id_for_booking(booking));
        assert_ne!(
            saga_id_for_booking(booking),
            saga_id_for_booking(Uuid::new_v4())
        );
    }

    #[test]
    fn merge_prefers_overlay_keys() {
        let mut base = json!({"a": 1, "b": 2});
        merge_data(&mut base, &json!({"b": 3, "c": 4}));
        assert_eq!(base, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn merge_ignores_null_overlay() {
        let mut base = json!({"a": 1});
        merge_data(&mut base, &Value::Null);
        assert_eq!(base, json!({"a": 1}));
    }
}
