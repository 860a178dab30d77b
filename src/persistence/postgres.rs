//! PostgreSQL workflow repository
//!
//! Same relational shape as the SQLite store with native JSONB and
//! TIMESTAMPTZ columns. Concurrent step writes for one workflow serialize
//! through the unique `(correlation_id, step_name, run_id)` index.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{
    slip_snapshot, StepRecord, StepStatus, WorkflowInstance, WorkflowRepository, WorkflowStatus,
};
use crate::contracts::RoutingSlip;

pub struct PostgresWorkflowRepository {
    pool: PgPool,
}

impl PostgresWorkflowRepository {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;

        let repository = Self { pool };
        repository.migrate().await?;
        Ok(repository)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                correlation_id TEXT PRIMARY KEY,
                routing_slip   JSONB NOT NULL,
                payload        JSONB,
                status         TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_history (
                id             SERIAL PRIMARY KEY,
                correlation_id TEXT NOT NULL REFERENCES workflows(correlation_id),
                step_name      TEXT NOT NULL,
                run_id         INTEGER NOT NULL DEFAULT 1,
                started_at     TIMESTAMPTZ,
                completed_at   TIMESTAMPTZ,
                status         TEXT,
                output         JSONB
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

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
impl WorkflowRepository for PostgresWorkflowRepository {
    async fn create_workflow(
        &self,
        correlation_id: &str,
        routing_slip: &RoutingSlip,
        payload: &HashMap<String, Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (correlation_id, routing_slip, payload, status)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(correlation_id)
        .bind(slip_snapshot(routing_slip)?)
        .bind(serde_json::to_value(payload)?)
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
        sqlx::query("UPDATE workflows SET routing_slip = $1 WHERE correlation_id = $2")
            .bind(slip_snapshot(routing_slip)?)
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
        sqlx::query("UPDATE workflows SET payload = $1 WHERE correlation_id = $2")
            .bind(serde_json::to_value(payload)?)
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
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (correlation_id, step_name, run_id) DO NOTHING
            "#,
        )
        .bind(correlation_id)
        .bind(step_name)
        .bind(run_id)
        .bind(Utc::now())
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
            SET completed_at = $1, status = $2, output = $3
            WHERE correlation_id = $4 AND step_name = $5 AND run_id = $6
              AND completed_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(status.to_string())
        .bind(output)
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
        sqlx::query("UPDATE workflows SET status = $1 WHERE correlation_id = $2")
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
            WHERE correlation_id = $1
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
            WHERE correlation_id = $1
            ORDER BY id
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut workflow = row.into_instance()?;
        workflow.steps = step_rows.into_iter().map(StepRow::into_record).collect();
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
    routing_slip: Value,
    payload: Option<Value>,
    status: String,
}

impl WorkflowRow {
    fn into_instance(self) -> Result<WorkflowInstance> {
        Ok(WorkflowInstance {
            correlation_id: self.correlation_id,
            routing_slip: self.routing_slip,
            payload: match self.payload {
                Some(payload) => serde_json::from_value(payload)?,
                None => HashMap::new(),
            },
            status: WorkflowStatus::parse(&self.status),
            steps: Vec::new(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: i32,
    correlation_id: String,
    step_name: String,
    run_id: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    status: Option<String>,
    output: Option<Value>,
}

impl StepRow {
    fn into_record(self) -> StepRecord {
        StepRecord {
            id: Some(self.id as i64),
            correlation_id: self.correlation_id,
            step_name: self.step_name,
            run_id: self.run_id,
            started_at: self.started_at,
            completed_at: self.completed_at,
            status: self.status.as_deref().map(StepStatus::parse),
            output: self.output,
        }
    }
}
