//! Saga instance persistence.
//!
//! The orchestrator is the only writer. Updates carry the version the
//! caller read; a mismatched version means another replica advanced the
//! instance first and the update is refused.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::entities::saga_instance::{self, Entity as SagaInstanceEntity, SagaStatus};
use crate::errors::ServiceError;

/// Result recorded for one executed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    pub step_index: i32,
    pub step_name: String,
    pub status: StepResultStatus,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepResultStatus {
    Completed,
    Failed,
    CompensationEmitted,
}

/// In-memory form of a saga instance.
#[derive(Debug, Clone)]
pub struct SagaRecord {
    pub id: Uuid,
    pub definition_id: String,
    pub status: SagaStatus,
    pub current_step_index: i32,
    pub step_results: Vec<StepResult>,
    pub data: serde_json::Value,
    pub error: Option<String>,
    pub version: i32,
    pub step_retries: i32,
    pub timeout_at: Option<DateTime<Utc>>,
    pub timeout_checks: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SagaRecord {
    pub fn new(id: Uuid, definition_id: &str, data: serde_json::Value) -> Self {
        Self {
            id,
            definition_id: definition_id.to_string(),
            status: SagaStatus::Created,
            current_step_index: 0,
            step_results: Vec::new(),
            data,
            error: None,
            version: 0,
            step_retries: 0,
            timeout_at: None,
            timeout_checks: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Steps that completed and whose definition declares a compensation,
    /// in reverse completion order.
    pub fn completed_steps(&self) -> Vec<&StepResult> {
        let mut completed: Vec<&StepResult> = self
            .step_results
            .iter()
            .filter(|r| r.status == StepResultStatus::Completed)
            .collect();
        completed.sort_by_key(|r| std::cmp::Reverse(r.step_index));
        completed
    }

    /// Whether an outcome for `(step_index)` was already applied.
    pub fn has_result_for(&self, step_index: i32) -> bool {
        self.step_results
            .iter()
            .any(|r| r.step_index == step_index && r.status != StepResultStatus::CompensationEmitted)
    }
}

/// Persistence seam for saga instances.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn insert(&self, record: &SagaRecord) -> Result<(), ServiceError>;

    async fn fetch(&self, id: Uuid) -> Result<Option<SagaRecord>, ServiceError>;

    /// Optimistic update: applies only when the stored version equals
    /// `expected_version`; the stored version is bumped on success.
    /// Returns false when another writer advanced the instance first.
    async fn update(
        &self,
        record: &SagaRecord,
        expected_version: i32,
    ) -> Result<bool, ServiceError>;

    /// Running or compensating instances whose step deadline has passed.
    async fn due_for_timeout_check(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaRecord>, ServiceError>;
}

/// Mutex-guarded store for tests and single-process runs.
#[derive(Default)]
pub struct InMemorySagaStore {
    records: Mutex<HashMap<Uuid, SagaRecord>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn insert(&self, record: &SagaRecord) -> Result<(), ServiceError> {
        let mut records = self.records.lock().expect("saga store poisoned");
        if records.contains_key(&record.id) {
            return Err(ServiceError::Conflict(format!(
                "saga {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<SagaRecord>, ServiceError> {
        Ok(self
            .records
            .lock()
            .expect("saga store poisoned")
            .get(&id)
            .cloned())
    }

    async fn update(
        &self,
        record: &SagaRecord,
        expected_version: i32,
    ) -> Result<bool, ServiceError> {
        let mut records = self.records.lock().expect("saga store poisoned");
        match records.get_mut(&record.id) {
            Some(stored) if stored.version == expected_version => {
                let mut updated = record.clone();
                updated.version = expected_version + 1;
                *stored = updated;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ServiceError::NotFound(format!(
                "saga {} not found",
                record.id
            ))),
        }
    }

    async fn due_for_timeout_check(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaRecord>, ServiceError> {
        Ok(self
            .records
            .lock()
            .expect("saga store poisoned")
            .values()
            .filter(|r| {
                matches!(r.status, SagaStatus::Running)
                    && r.timeout_at.map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// SeaORM-backed store.
#[derive(Clone)]
pub struct SeaOrmSagaStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmSagaStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn to_record(model: saga_instance::Model) -> Result<SagaRecord, ServiceError> {
        let status = SagaStatus::parse(&model.status).ok_or_else(|| {
            ServiceError::Internal(format!("saga {} has unknown status {}", model.id, model.status))
        })?;
        let step_results: Vec<StepResult> =
            serde_json::from_str(&model.step_results).unwrap_or_default();
        let data: serde_json::Value =
            serde_json::from_str(&model.data).unwrap_or(serde_json::Value::Null);
        Ok(SagaRecord {
            id: model.id,
            definition_id: model.definition_id,
            status,
            current_step_index: model.current_step_index,
            step_results,
            data,
            error: model.error,
            version: model.version,
            step_retries: model.step_retries,
            timeout_at: model.timeout_at,
            timeout_checks: model.timeout_checks,
            created_at: model.created_at,
            completed_at: model.completed_at,
        })
    }
}

#[async_trait]
impl SagaStore for SeaOrmSagaStore {
    async fn insert(&self, record: &SagaRecord) -> Result<(), ServiceError> {
        let row = saga_instance::ActiveModel {
            id: Set(record.id),
            definition_id: Set(record.definition_id.clone()),
            status: Set(record.status.as_str().to_string()),
            current_step_index: Set(record.current_step_index),
            step_results: Set(serde_json::to_string(&record.step_results)
                .map_err(|e| ServiceError::Internal(e.to_string()))?),
            data: Set(record.data.to_string()),
            error: Set(record.error.clone()),
            version: Set(record.version),
            step_retries: Set(record.step_retries),
            timeout_at: Set(record.timeout_at),
            timeout_checks: Set(record.timeout_checks),
            completed_at: Set(record.completed_at),
            ..Default::default()
        };
        row.insert(&*self.db).await?;
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<SagaRecord>, ServiceError> {
        let model = SagaInstanceEntity::find_by_id(id).one(&*self.db).await?;
        model.map(Self::to_record).transpose()
    }

    async fn update(
        &self,
        record: &SagaRecord,
        expected_version: i32,
    ) -> Result<bool, ServiceError> {
        let step_results = serde_json::to_string(&record.step_results)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let updated = SagaInstanceEntity::update_many()
            .col_expr(
                saga_instance::Column::Status,
                Expr::value(record.status.as_str()),
            )
            .col_expr(
                saga_instance::Column::CurrentStepIndex,
                Expr::value(record.current_step_index),
            )
            .col_expr(saga_instance::Column::StepResults, Expr::value(step_results))
            .col_expr(
                saga_instance::Column::Data,
                Expr::value(record.data.to_string()),
            )
            .col_expr(saga_instance::Column::Error, Expr::value(record.error.clone()))
            .col_expr(
                saga_instance::Column::Version,
                Expr::value(expected_version + 1),
            )
            .col_expr(
                saga_instance::Column::StepRetries,
                Expr::value(record.step_retries),
            )
            .col_expr(
                saga_instance::Column::TimeoutAt,
                Expr::value(record.timeout_at),
            )
            .col_expr(
                saga_instance::Column::TimeoutChecks,
                Expr::value(record.timeout_checks),
            )
            .col_expr(
                saga_instance::Column::CompletedAt,
                Expr::value(record.completed_at),
            )
            .col_expr(
                saga_instance::Column::UpdatedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(saga_instance::Column::Id.eq(record.id))
            .filter(saga_instance::Column::Version.eq(expected_version))
            .exec(&*self.db)
            .await?;
        Ok(updated.rows_affected > 0)
    }

    async fn due_for_timeout_check(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaRecord>, ServiceError> {
        let models = SagaInstanceEntity::find()
            .filter(saga_instance::Column::Status.eq(SagaStatus::Running.as_str()))
            .filter(saga_instance::Column::TimeoutAt.lte(now))
            .all(&*self.db)
            .await?;
        models.into_iter().map(Self::to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn optimistic_update_refuses_stale_writers() {
        let store = InMemorySagaStore::new();
        let mut record = SagaRecord::new(Uuid::new_v4(), "booking-saga", json!({}));
        store.insert(&record).await.unwrap();

        record.status = SagaStatus::Running;
        assert!(store.update(&record, 0).await.unwrap());

        // A replica that still holds version 0 loses.
        record.status = SagaStatus::Completed;
        assert!(!store.update(&record, 0).await.unwrap());

        let stored = store.fetch(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SagaStatus::Running);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_conflict() {
        let store = InMemorySagaStore::new();
        let record = SagaRecord::new(Uuid::new_v4(), "booking-saga", json!({}));
        store.insert(&record).await.unwrap();
        assert!(store.insert(&record).await.is_err());
    }

    #[test]
    fn completed_steps_come_back_in_reverse() {
        let mut record = SagaRecord::new(Uuid::new_v4(), "booking-saga", json!({}));
        for (index, name) in [(0, "confirm-booking"), (1, "send-notification")] {
            record.step_results.push(StepResult {
                step_index: index,
                step_name: name.to_string(),
                status: StepResultStatus::Completed,
                output: json!({}),
                error: None,
                recorded_at: Utc::now(),
            });
        }
        let reversed: Vec<i32> = record
            .completed_steps()
            .iter()
            .map(|r| r.step_index)
            .collect();
        assert_eq!(reversed, vec![1, 0]);
    }
}
