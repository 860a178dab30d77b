//! Workflow dispatcher
//!
//! Assembles an ordered itinerary plus a catalog of activities that stay
//! reachable from inside the workflow, then launches the whole thing as a
//! single envelope on the first step's topic.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::contracts::{
    ActivitySpec, PaigeantMessage, RoutingSlip, DEFAULT_ITINERARY_EDIT_LIMIT,
};
use crate::deps::{self, HydratedDeps};
use crate::error::PaigeantError;
use crate::persistence::WorkflowRepository;
use crate::transport::Transport;

/// Service responsible for dispatching new workflows.
pub struct WorkflowDispatcher {
    itinerary: Vec<ActivitySpec>,
    activity_registry: HashMap<String, ActivitySpec>,
    itinerary_edit_limit: u32,
}

impl WorkflowDispatcher {
    pub fn new() -> Self {
        Self {
            itinerary: Vec::new(),
            activity_registry: HashMap::new(),
            itinerary_edit_limit: DEFAULT_ITINERARY_EDIT_LIMIT,
        }
    }

    /// Override the per-workflow insertion budget carried on the envelope.
    pub fn with_itinerary_edit_limit(mut self, limit: u32) -> Self {
        self.itinerary_edit_limit = limit;
        self
    }

    fn create_activity(
        &self,
        agent_name: &str,
        prompt: &str,
        deps: &HydratedDeps,
    ) -> Result<ActivitySpec> {
        let serialized = deps::serialize(deps)?;
        Ok(ActivitySpec {
            agent_name: agent_name.to_string(),
            prompt: prompt.to_string(),
            deps: Some(serialized),
            arguments: HashMap::new(),
        })
    }

    /// Append an activity to the itinerary (and to the insertion catalog).
    pub fn add_activity(
        &mut self,
        agent_name: &str,
        prompt: &str,
        deps: &HydratedDeps,
    ) -> Result<ActivitySpec> {
        let activity = self.create_activity(agent_name, prompt, deps)?;
        self.activity_registry
            .insert(activity.agent_name.clone(), activity.clone());
        self.itinerary.push(activity.clone());
        Ok(activity)
    }

    /// Make an activity insertable mid-flight without scheduling it upfront.
    pub fn register_activity(
        &mut self,
        agent_name: &str,
        prompt: &str,
        deps: &HydratedDeps,
    ) -> Result<ActivitySpec> {
        let activity = self.create_activity(agent_name, prompt, deps)?;
        self.activity_registry
            .insert(activity.agent_name.clone(), activity.clone());
        Ok(activity)
    }

    /// Dispatch the current itinerary over `transport`.
    ///
    /// Creates the workflow row, then publishes the envelope on the first
    /// step's topic. Returns the correlation identifier for tracking.
    pub async fn dispatch_workflow(
        &self,
        transport: &dyn Transport,
        variables: HashMap<String, Value>,
        obo_token: Option<String>,
        repository: &dyn WorkflowRepository,
    ) -> Result<String> {
        let Some(first_step) = self.itinerary.first().cloned() else {
            return Err(PaigeantError::EmptyItinerary.into());
        };

        let correlation_id = Uuid::new_v4().to_string();
        let routing_slip = RoutingSlip::new(self.itinerary.clone());

        let mut message = PaigeantMessage::new(correlation_id.clone(), routing_slip.clone());
        message.trace_id = Some(correlation_id.clone());
        message.obo_token = obo_token;
        message.payload = variables;
        message.activity_registry = self.activity_registry.clone();
        message.itinerary_edit_limit = self.itinerary_edit_limit;

        repository
            .create_workflow(&correlation_id, &routing_slip, &message.payload)
            .await?;
        transport.publish(&first_step.agent_name, &message).await?;

        info!(
            correlation_id,
            first_step = %first_step.agent_name,
            steps = self.itinerary.len(),
            "dispatched workflow"
        );
        Ok(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowRepository, WorkflowStatus};
    use crate::transport::InMemoryTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_dispatch_creates_row_and_publishes() {
        let transport = InMemoryTransport::new();
        let repository = InMemoryWorkflowRepository::new();

        let mut dispatcher = WorkflowDispatcher::new();
        dispatcher
            .add_activity("writer", "write a haiku", &HydratedDeps::None)
            .unwrap();
        dispatcher
            .add_activity("critic", "review it", &HydratedDeps::None)
            .unwrap();

        let mut variables = HashMap::new();
        variables.insert("topic".to_string(), json!("autumn"));

        let correlation_id = dispatcher
            .dispatch_workflow(&transport, variables, Some("token".into()), &repository)
            .await
            .unwrap();

        let workflow = repository
            .get_workflow(&correlation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workflow.status, WorkflowStatus::InProgress);

        assert_eq!(transport.pending("writer").await, 1);
        assert_eq!(transport.pending("critic").await, 0);

        let delivery = transport.receive("writer", None).await.unwrap().unwrap();
        let message = delivery.message;
        assert_eq!(message.correlation_id, correlation_id);
        assert_eq!(message.trace_id.as_deref(), Some(correlation_id.as_str()));
        assert_eq!(message.obo_token.as_deref(), Some("token"));
        assert_eq!(message.payload["topic"], json!("autumn"));
        assert_eq!(message.routing_slip.itinerary.len(), 2);
        // Itinerary members are reachable from the insertion catalog too.
        assert!(message.activity_registry.contains_key("writer"));
        assert!(message.activity_registry.contains_key("critic"));
    }

    #[tokio::test]
    async fn test_registered_activity_stays_off_the_itinerary() {
        let transport = InMemoryTransport::new();
        let repository = InMemoryWorkflowRepository::new();

        let mut dispatcher = WorkflowDispatcher::new();
        dispatcher
            .add_activity("writer", "write", &HydratedDeps::None)
            .unwrap();
        dispatcher
            .register_activity("translator", "translate", &HydratedDeps::None)
            .unwrap();

        dispatcher
            .dispatch_workflow(&transport, HashMap::new(), None, &repository)
            .await
            .unwrap();

        let delivery = transport.receive("writer", None).await.unwrap().unwrap();
        assert_eq!(delivery.message.routing_slip.itinerary.len(), 1);
        assert!(delivery.message.activity_registry.contains_key("translator"));
        assert_eq!(transport.pending("translator").await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_with_empty_itinerary_fails() {
        let transport = InMemoryTransport::new();
        let repository = InMemoryWorkflowRepository::new();

        let dispatcher = WorkflowDispatcher::new();
        let err = dispatcher
            .dispatch_workflow(&transport, HashMap::new(), None, &repository)
            .await
            .unwrap_err();

        let err = err.downcast::<PaigeantError>().unwrap();
        assert!(matches!(err, PaigeantError::EmptyItinerary));
        assert!(repository.list_workflows().await.unwrap().is_empty());
    }
}
