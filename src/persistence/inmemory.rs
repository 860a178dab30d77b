//! In-memory workflow repository
//!
//! Useful for tests or when no database is configured. Data does not
//! survive process restarts.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    slip_snapshot, StepRecord, StepStatus, WorkflowInstance, WorkflowRepository, WorkflowStatus,
};
use crate::contracts::RoutingSlip;

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<String, WorkflowInstance>,
    next_step_id: i64,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create_workflow(
        &self,
        correlation_id: &str,
        routing_slip: &RoutingSlip,
        payload: &HashMap<String, Value>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workflows.insert(
            correlation_id.to_string(),
            WorkflowInstance {
                correlation_id: correlation_id.to_string(),
                routing_slip: slip_snapshot(routing_slip)?,
                payload: payload.clone(),
                status: WorkflowStatus::InProgress,
                steps: Vec::new(),
            },
        );
        Ok(())
    }

    async fn update_routing_slip(
        &self,
        correlation_id: &str,
        routing_slip: &RoutingSlip,
    ) -> Result<()> {
        let snapshot = slip_snapshot(routing_slip)?;
        let mut inner = self.inner.lock().await;
        if let Some(workflow) = inner.workflows.get_mut(correlation_id) {
            workflow.routing_slip = snapshot;
        }
        Ok(())
    }

    async fn update_payload(
        &self,
        correlation_id: &str,
        payload: &HashMap<String, Value>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(workflow) = inner.workflows.get_mut(correlation_id) {
            workflow.payload = payload.clone();
        }
        Ok(())
    }

    async fn mark_step_started(
        &self,
        correlation_id: &str,
        step_name: &str,
        run_id: i32,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.next_step_id += 1;
        let id = inner.next_step_id;
        let Some(workflow) = inner.workflows.get_mut(correlation_id) else {
            return Ok(());
        };
        // Duplicate starts for the same run are ignored.
        if workflow
            .steps
            .iter()
            .any(|step| step.step_name == step_name && step.run_id == run_id)
        {
            return Ok(());
        }
        workflow.steps.push(StepRecord {
            id: Some(id),
            correlation_id: correlation_id.to_string(),
            step_name: step_name.to_string(),
            run_id,
            started_at: Some(Utc::now()),
            completed_at: None,
            status: Some(StepStatus::Started),
            output: None,
        });
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
        let mut inner = self.inner.lock().await;
        let Some(workflow) = inner.workflows.get_mut(correlation_id) else {
            return Ok(());
        };
        let open = workflow.steps.iter_mut().find(|step| {
            step.step_name == step_name && step.run_id == run_id && step.completed_at.is_none()
        });
        if let Some(step) = open {
            step.completed_at = Some(Utc::now());
            step.status = Some(status);
            step.output = output;
        }
        Ok(())
    }

    async fn mark_workflow_completed(
        &self,
        correlation_id: &str,
        status: WorkflowStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(workflow) = inner.workflows.get_mut(correlation_id) {
            workflow.status = status;
        }
        Ok(())
    }

    async fn get_workflow(&self, correlation_id: &str) -> Result<Option<WorkflowInstance>> {
        let inner = self.inner.lock().await;
        Ok(inner.workflows.get(correlation_id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowInstance>> {
        let inner = self.inner.lock().await;
        Ok(inner.workflows.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ActivitySpec;
    use serde_json::json;

    fn slip() -> RoutingSlip {
        RoutingSlip::new(vec![ActivitySpec::new("a", "p")])
    }

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let repository = InMemoryWorkflowRepository::new();
        let mut payload = HashMap::new();
        payload.insert("k".to_string(), json!("v"));

        repository.create_workflow("c1", &slip(), &payload).await.unwrap();

        let workflow = repository.get_workflow("c1").await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::InProgress);
        assert_eq!(workflow.payload["k"], json!("v"));
        assert!(workflow.steps.is_empty());
        assert!(repository.get_workflow("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_step_start_is_idempotent() {
        let repository = InMemoryWorkflowRepository::new();
        repository
            .create_workflow("c1", &slip(), &HashMap::new())
            .await
            .unwrap();

        repository.mark_step_started("c1", "a", 1).await.unwrap();
        repository.mark_step_started("c1", "a", 1).await.unwrap();

        let workflow = repository.get_workflow("c1").await.unwrap().unwrap();
        assert_eq!(workflow.steps.len(), 1);

        // A different run id is a distinct record.
        repository.mark_step_started("c1", "a", 2).await.unwrap();
        let workflow = repository.get_workflow("c1").await.unwrap().unwrap();
        assert_eq!(workflow.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_step_completion_closes_open_record_once() {
        let repository = InMemoryWorkflowRepository::new();
        repository
            .create_workflow("c1", &slip(), &HashMap::new())
            .await
            .unwrap();
        repository.mark_step_started("c1", "a", 1).await.unwrap();

        repository
            .mark_step_completed("c1", "a", StepStatus::Completed, Some(json!({"result": 1})), 1)
            .await
            .unwrap();

        let workflow = repository.get_workflow("c1").await.unwrap().unwrap();
        let first_completion = workflow.steps[0].completed_at;
        assert_eq!(workflow.steps[0].status, Some(StepStatus::Completed));

        // Re-asserting the terminal state leaves the record unchanged.
        repository
            .mark_step_completed("c1", "a", StepStatus::Completed, Some(json!({"result": 1})), 1)
            .await
            .unwrap();
        let workflow = repository.get_workflow("c1").await.unwrap().unwrap();
        assert_eq!(workflow.steps[0].completed_at, first_completion);
    }

    #[tokio::test]
    async fn test_workflow_status_transition() {
        let repository = InMemoryWorkflowRepository::new();
        repository
            .create_workflow("c1", &slip(), &HashMap::new())
            .await
            .unwrap();

        repository
            .mark_workflow_completed("c1", WorkflowStatus::Completed)
            .await
            .unwrap();
        let workflow = repository.get_workflow("c1").await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_workflows() {
        let repository = InMemoryWorkflowRepository::new();
        repository
            .create_workflow("c1", &slip(), &HashMap::new())
            .await
            .unwrap();
        repository
            .create_workflow("c2", &slip(), &HashMap::new())
            .await
            .unwrap();

        let workflows = repository.list_workflows().await.unwrap();
        assert_eq!(workflows.len(), 2);
    }
}
