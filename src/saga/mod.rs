//! Post-payment saga.
//!
//! Orchestration over choreography: the step count is small and the state
//! of every in-flight booking must be observable in one place. The
//! orchestrator owns the saga instance; step workers own their effects;
//! everything in between travels over the message bus with idempotency
//! keys.

pub mod orchestrator;
pub mod store;
pub mod workers;

pub use orchestrator::SagaOrchestrator;
pub use store::{InMemorySagaStore, SagaRecord, SagaStore, SeaOrmSagaStore, StepResult};

use std::time::Duration;

/// The booking saga's bus-facing name (`saga.booking.*` topics).
pub const BOOKING_SAGA_NAME: &str = "booking";
/// Definition id stored on instances.
pub const BOOKING_SAGA_DEFINITION_ID: &str = "booking-saga";

pub const STEP_CONFIRM_BOOKING: &str = "confirm-booking";
pub const STEP_SEND_NOTIFICATION: &str = "send-notification";
/// Compensation command for a completed confirm-booking step.
pub const COMPENSATION_RELEASE_BOOKING: &str = "release-booking";
/// Compensation command emitted when a paid saga unwinds.
pub const COMPENSATION_REFUND_PAYMENT: &str = "refund-payment";

/// One step of a saga definition.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub name: &'static str,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Command emitted to undo this step once it has completed.
    pub compensation: Option<&'static str>,
}

/// A saga definition: ordered steps plus identity.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    pub fn step(&self, index: i32) -> Option<&StepDefinition> {
        usize::try_from(index).ok().and_then(|i| self.steps.get(i))
    }

    pub fn is_last_step(&self, index: i32) -> bool {
        index as usize + 1 >= self.steps.len()
    }
}

/// The booking saga: `[confirm-booking -> send-notification]`.
///
/// The hard-path reservation is not a step here; it runs synchronously on
/// the reserve hot path.
pub fn booking_saga(step_timeout: Duration, max_retries: u32) -> SagaDefinition {
    SagaDefinition {
        id: BOOKING_SAGA_DEFINITION_ID,
        name: BOOKING_SAGA_NAME,
        steps: vec![
            StepDefinition {
                name: STEP_CONFIRM_BOOKING,
                timeout: step_timeout,
                max_retries,
                compensation: Some(COMPENSATION_RELEASE_BOOKING),
            },
            StepDefinition {
                name: STEP_SEND_NOTIFICATION,
                timeout: step_timeout,
                max_retries,
                compensation: None,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_saga_shape() {
        let def = booking_saga(Duration::from_secs(30), 3);
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].name, STEP_CONFIRM_BOOKING);
        assert_eq!(
            def.steps[0].compensation,
            Some(COMPENSATION_RELEASE_BOOKING)
        );
        assert_eq!(def.steps[1].compensation, None);
        assert!(def.is_last_step(1));
        assert!(!def.is_last_step(0));
        assert!(def.step(2).is_none());
        assert!(def.step(-1).is_none());
    }
}
