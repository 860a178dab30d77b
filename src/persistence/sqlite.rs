//! SQLite workflow repository
//!
//! Single-file store with the schema created on first use. Slip, payload and
//! output land in TEXT columns as JSON; timestamps are RFC 3339 strings.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::{
    slip_snapshot, StepRecord, StepStatus, WorkflowInstance, WorkflowRepository, WorkflowStatus,
};
use crate::contracts::RoutingSlip;

pub struct SqliteWorkflowRepository {
    pool: SqlitePool,
}

impl SqliteWorkflowRepository {
    /// Open (creating if missing) the database file and run migrations.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite database at {path}"))?;

        let repository = Self { pool };
        repository.migrate().await?;
        Ok(repository)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                correlation_id TEXT PRIMARY KEY,
                routing_slip   TEXT NOT NULL,
                payload        TEXT,
                status         TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_history (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                correlation_id TEXT NOT NULL REFERENCES workflows(correlation_id),
                step_name      TEXT NOT NULL,
                run_id         INTEGER NOT NULL DEFAULT 1,
                started_at     TEXT,
                completed_at   TEXT,
                status         TEXT,
                output         TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Uniqueness of (correlation_id, step_name, run_id) is what makes
        // step starts idempotent under redelivery.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_step_history_run
                ON step_history(correlation_id, step_name, run_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_workflow(
        &self,
        correlation_id: &str,
        routing_slip: &RoutingSlip,
        payload: &HashMap<String, Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (correlation_id, routing_slip, payload, status)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(correlation_id)
        .bind(slip_snapshot(routing_slip)?.to_string())
        .bind(serde_json::to_string(payload)?)
        .bind(WorkflowStatus::InProgress.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_routing_slip(
        &self,
        correlation_id: &str,
        routing_slip: &RoutingSlip,
    ) -> Result<()> {
        sqlx::query("UPDATE workflows SET routing_slip = ? WHERE correlation_id = ?")
            .bind(slip_snapshot(routing_slip)?.to_string())
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_payload(
        &self,
        correlation_id: &str,
        payload: &HashMap<String, Value>,
    ) -> Result<()> {
        sqlx::query("UPDATE workflows SET payload = ? WHERE correlation_id = ?")
            .bind(serde_json::to_string(payload)?)
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_step_started(
        &self,
        correlation_id: &str,
        step_name: &str,
        run_id: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_history (correlation_id, step_name, run_id, started_at, status)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (correlation_id, step_name, run_id) DO NOTHING
            "#,
        )
        .bind(correlation_id)
        .bind(step_name)
        .bind(run_id)
        .bind(Utc::now().to_rfc3339())
        .bind(StepStatus::Started.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_step_completed(
        &self,
        correlation_id: &str,
        step_name: &str,
        status: StepStatus,
        output: Option<Value>,
        run_id: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE step_history
            SET completed_at = ?, status = ?, output = ?
            WHERE correlation_id = ? AND step_name = ? AND run_id = ?
              AND completed_at IS NULL
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(status.to_string())
        .bind(output.map(|value| value.to_string()))
        .bind(correlation_id)
        .bind(step_name)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_workflow_completed(
        &self,
        correlation_id: &str,
        status: WorkflowStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE workflows SET status = ? WHERE correlation_id = ?")
            .bind(status.to_string())
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_workflow(&self, correlation_id: &str) -> Result<Option<WorkflowInstance>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT correlation_id, routing_slip, payload, status
            FROM workflows
            WHERE correlation_id = ?
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let step_rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, correlation_id, step_name, run_id,
                   started_at, completed_at, status, output
            FROM step_history
            WHERE correlation_id = ?
            ORDER BY id
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut workflow = row.into_instance()?;
        workflow.steps = step_rows
            .into_iter()
            .map(StepRow::into_record)
            .collect::<Result<_>>()?;
        Ok(Some(workflow))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT correlation_id, routing_slip, payload, status FROM workflows",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowRow::into_instance).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row types for sqlx query_as
// ═══════════════════════════════════════════════════════════════════════════

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    correlation_id: String,
    routing_slip: String,
    payload: Option<String>,
    status: String,
}

impl WorkflowRow {
    fn into_instance(self) -> Result<WorkflowInstance> {
        Ok(WorkflowInstance {
            correlation_id: self.correlation_id,
            routing_slip: serde_json::from_str(&self.routing_slip)?,
            payload: match self.payload {
                Some(payload) => serde_json::from_str(&payload)?,
                None => HashMap::new(),
            },
            status: WorkflowStatus::parse(&self.status),
            steps: Vec::new(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: i64,
    correlation_id: String,
    step_name: String,
    run_id: i32,
    started_at: Option<String>,
    completed_at: Option<String>,
    status: Option<String>,
    output: Option<String>,
}

impl StepRow {
    fn into_record(self) -> Result<StepRecord> {
        Ok(StepRecord {
            id: Some(self.id),
            correlation_id: self.correlation_id,
            step_name: self.step_name,
            run_id: self.run_id,
            started_at: parse_timestamp(self.started_at.as_deref())?,
            completed_at: parse_timestamp(self.completed_at.as_deref())?,
            status: self.status.as_deref().map(StepStatus::parse),
            output: self
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

fn parse_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp: {raw}"))?;
    Ok(Some(parsed.with_timezone(&Utc)))
}
