//! Durable mirror of workflow instances and per-step execution history
//!
//! Writes are idempotent where redelivery can repeat them: a duplicate
//! `mark_step_started` for the same `(correlation_id, step_name, run_id)` is
//! ignored, and re-asserting a terminal step status leaves the stored row
//! unchanged. Backend selection is by URL scheme.

mod inmemory;
#[cfg(feature = "postgres")]
mod postgres;
mod sqlite;

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contracts::RoutingSlip;
use crate::error::PaigeantError;

pub use inmemory::InMemoryWorkflowRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresWorkflowRepository;
pub use sqlite::SqliteWorkflowRepository;

// ═══════════════════════════════════════════════════════════════════════════
// Persisted models
// ═══════════════════════════════════════════════════════════════════════════

/// Terminal and in-flight states of a workflow instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::InProgress => write!(f, "in_progress"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

impl WorkflowStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => WorkflowStatus::Completed,
            "failed" => WorkflowStatus::Failed,
            _ => WorkflowStatus::InProgress,
        }
    }
}

/// States of one step execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Started => write!(f, "started"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

impl StepStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            _ => StepStatus::Started,
        }
    }
}

/// Record of an individual step execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub id: Option<i64>,
    pub correlation_id: String,
    pub step_name: String,
    pub run_id: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Option<StepStatus>,
    pub output: Option<Value>,
}

/// Persisted workflow instance data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub correlation_id: String,
    /// Serialized routing-slip snapshot as of the last write.
    pub routing_slip: Value,
    pub payload: HashMap<String, Value>,
    pub status: WorkflowStatus,
    pub steps: Vec<StepRecord>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Repository contract
// ═══════════════════════════════════════════════════════════════════════════

/// Workflow state persistence backend.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Persist initial workflow state with status `in_progress`.
    async fn create_workflow(
        &self,
        correlation_id: &str,
        routing_slip: &RoutingSlip,
        payload: &HashMap<String, Value>,
    ) -> Result<()>;

    /// Overwrite the stored routing-slip snapshot.
    async fn update_routing_slip(
        &self,
        correlation_id: &str,
        routing_slip: &RoutingSlip,
    ) -> Result<()>;

    /// Overwrite the stored payload.
    async fn update_payload(
        &self,
        correlation_id: &str,
        payload: &HashMap<String, Value>,
    ) -> Result<()>;

    /// Record the start of a step. Idempotent: a record already existing for
    /// `(correlation_id, step_name, run_id)` leaves the store unchanged.
    async fn mark_step_started(
        &self,
        correlation_id: &str,
        step_name: &str,
        run_id: i32,
    ) -> Result<()>;

    /// Record the completion of the matching open step. Re-asserting the same
    /// terminal state is a no-op on the stored completion time.
    async fn mark_step_completed(
        &self,
        correlation_id: &str,
        step_name: &str,
        status: StepStatus,
        output: Option<Value>,
        run_id: i32,
    ) -> Result<()>;

    /// Set the workflow's terminal status.
    async fn mark_workflow_completed(
        &self,
        correlation_id: &str,
        status: WorkflowStatus,
    ) -> Result<()>;

    /// Retrieve one workflow instance with its ordered step history.
    async fn get_workflow(&self, correlation_id: &str) -> Result<Option<WorkflowInstance>>;

    /// Return all persisted workflows (without step history).
    async fn list_workflows(&self) -> Result<Vec<WorkflowInstance>>;
}

pub(crate) fn slip_snapshot(routing_slip: &RoutingSlip) -> Result<Value> {
    Ok(serde_json::to_value(routing_slip)?)
}

// ═══════════════════════════════════════════════════════════════════════════
// Factory
// ═══════════════════════════════════════════════════════════════════════════

/// Build the repository selected by a database URL.
///
/// `sqlite://path` opens (and migrates) a SQLite file, `postgres://…`
/// connects to Postgres when the `postgres` feature is enabled, and no URL
/// at all yields the in-memory store.
pub async fn connect(database_url: Option<&str>) -> Result<Arc<dyn WorkflowRepository>> {
    let Some(database_url) = database_url else {
        return Ok(Arc::new(InMemoryWorkflowRepository::new()));
    };

    if let Some(path) = database_url.strip_prefix("sqlite://") {
        return Ok(Arc::new(SqliteWorkflowRepository::connect(path).await?));
    }

    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        #[cfg(feature = "postgres")]
        {
            return Ok(Arc::new(
                PostgresWorkflowRepository::connect(database_url).await?,
            ));
        }
        #[cfg(not(feature = "postgres"))]
        {
            return Err(PaigeantError::UnsupportedDatabase(
                "postgres support is not compiled in (enable the `postgres` feature)".to_string(),
            )
            .into());
        }
    }

    Err(PaigeantError::UnsupportedDatabase(database_url.to_string()).into())
}

/// Build the repository selected by `PAIGEANT_DATABASE_URL` / `DATABASE_URL`.
pub async fn from_env() -> Result<Arc<dyn WorkflowRepository>> {
    let database_url = env::var("PAIGEANT_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok();
    connect(database_url.as_deref()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_url_is_in_memory() {
        assert!(connect(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = match connect(Some("mongodb://nope")).await {
            Err(e) => e,
            Ok(_) => panic!("expected connect to fail for unknown scheme"),
        };
        let err = err.downcast::<PaigeantError>().unwrap();
        assert!(matches!(err, PaigeantError::UnsupportedDatabase(_)));
    }
}
