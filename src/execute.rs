//! Activity executor: the per-topic worker loop
//!
//! Subscribes to one topic (the worker's agent name) and, for each delivery:
//! rehydrates dependencies, overlays workflow context, invokes the local
//! agent, persists the outcome, advances the routing slip and forwards the
//! envelope, then acks. Persistence is idempotent, so redelivery after a
//! crash anywhere before the ack is safe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::contracts::{ActivitySpec, PaigeantMessage, PreviousOutput, WorkflowDependencies};
use crate::deps::{self, DependencyRegistry, HydratedDeps};
use crate::error::PaigeantError;
use crate::persistence::{StepStatus, WorkflowRepository};
use crate::transport::{subscribe, Transport};

/// Step executions record under this run id unless retries are being tracked.
const FIRST_RUN_ID: i32 = 1;

// ═══════════════════════════════════════════════════════════════════════════
// Agent seams
// ═══════════════════════════════════════════════════════════════════════════

/// What an agent returns from one activity run.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    /// The step's result, recorded into the envelope payload.
    pub output: Value,
    /// Follow-up steps to insert after this one, drawn from the envelope's
    /// activity registry.
    pub added_activities: Vec<ActivitySpec>,
}

impl AgentOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            added_activities: Vec::new(),
        }
    }

    pub fn with_added_activities(mut self, added: Vec<ActivitySpec>) -> Self {
        self.added_activities = added;
        self
    }
}

/// A local agent implementation the executor can invoke.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    async fn run(&self, prompt: &str, deps: HydratedDeps) -> Result<AgentOutput>;
}

/// Locates the local agent implementation for an agent name.
pub trait AgentResolver: Send + Sync {
    fn resolve(&self, agent_name: &str) -> Option<Arc<dyn AgentHandle>>;
}

/// Map-backed resolver for in-process workers.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentHandle>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent_name: impl Into<String>, agent: Arc<dyn AgentHandle>) {
        self.agents.insert(agent_name.into(), agent);
    }
}

impl AgentResolver for AgentRegistry {
    fn resolve(&self, agent_name: &str) -> Option<Arc<dyn AgentHandle>> {
        self.agents.get(agent_name).cloned()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Executor
// ═══════════════════════════════════════════════════════════════════════════

/// Whether a delivery was processed or discarded.
enum Disposition {
    Handled,
    Rejected,
}

/// Executes workflow activities by listening to transport messages.
pub struct ActivityExecutor {
    transport: Arc<dyn Transport>,
    agent_name: String,
    repository: Arc<dyn WorkflowRepository>,
    resolver: Arc<dyn AgentResolver>,
    deps_registry: DependencyRegistry,
    fallback_module: Option<String>,
}

impl ActivityExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        agent_name: impl Into<String>,
        repository: Arc<dyn WorkflowRepository>,
        resolver: Arc<dyn AgentResolver>,
    ) -> Self {
        Self {
            transport,
            agent_name: agent_name.into(),
            repository,
            resolver,
            deps_registry: DependencyRegistry::default(),
            fallback_module: None,
        }
    }

    /// Replace the dependency allow-list used for rehydration.
    pub fn with_dependency_registry(mut self, registry: DependencyRegistry) -> Self {
        self.deps_registry = registry;
        self
    }

    /// Module substituted when a dependency was recorded under `__main__`.
    pub fn with_fallback_module(mut self, module: impl Into<String>) -> Self {
        self.fallback_module = Some(module.into());
        self
    }

    /// Consume the worker's topic until `lifespan` elapses (forever if none).
    ///
    /// An in-progress delivery always finishes before the loop exits. Agent
    /// failures propagate out with the delivery un-acked, leaving redelivery
    /// to the transport.
    pub async fn run(&self, lifespan: Option<Duration>) -> Result<()> {
        let mut subscription = subscribe(self.transport.as_ref(), &self.agent_name, lifespan);

        while let Some(mut delivery) = subscription.next().await? {
            match self.process(&mut delivery.message).await {
                Ok(Disposition::Handled) => self.transport.ack(&delivery).await?,
                Ok(Disposition::Rejected) => self.transport.nack(&delivery, false).await?,
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// One delivery:
    /// `Received → Hydrated → Started → (succeeded | failed) → Persisted →
    /// (Forwarded | Terminal)`. The caller acks afterwards.
    async fn process(&self, message: &mut PaigeantMessage) -> Result<Disposition> {
        let Some(activity) = message.routing_slip.next_step().cloned() else {
            warn!(
                agent = %self.agent_name,
                correlation_id = %message.correlation_id,
                "delivery with an exhausted itinerary"
            );
            return Ok(Disposition::Rejected);
        };

        if activity.agent_name != self.agent_name {
            warn!(
                agent = %self.agent_name,
                routed_to = %activity.agent_name,
                correlation_id = %message.correlation_id,
                "delivery routed to the wrong topic"
            );
            return Ok(Disposition::Rejected);
        }

        let agent = self
            .resolver
            .resolve(&self.agent_name)
            .ok_or_else(|| PaigeantError::AgentNotFound(self.agent_name.clone()))?;

        let raw_deps = self.hydrate_deps(&activity, message);

        self.repository
            .mark_step_started(&message.correlation_id, &activity.agent_name, FIRST_RUN_ID)
            .await?;

        let full_deps = add_workflow_dependencies(&self.agent_name, raw_deps, message);

        let outcome = match agent.run(&activity.prompt, full_deps).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.repository
                    .mark_step_completed(
                        &message.correlation_id,
                        &activity.agent_name,
                        StepStatus::Failed,
                        Some(json!({ "error": error.to_string() })),
                        FIRST_RUN_ID,
                    )
                    .await?;
                return Err(error);
            }
        };

        self.insert_follow_ups(message, outcome.added_activities);

        message
            .payload
            .insert(self.agent_name.clone(), outcome.output.clone());
        self.repository
            .update_payload(&message.correlation_id, &message.payload)
            .await?;
        self.repository
            .mark_step_completed(
                &message.correlation_id,
                &activity.agent_name,
                StepStatus::Completed,
                Some(json!({ "result": outcome.output })),
                FIRST_RUN_ID,
            )
            .await?;

        info!(
            agent = %self.agent_name,
            correlation_id = %message.correlation_id,
            "activity completed"
        );

        message
            .forward_to_next_step(self.transport.as_ref(), self.repository.as_ref())
            .await?;
        self.repository
            .update_routing_slip(&message.correlation_id, &message.routing_slip)
            .await?;

        Ok(Disposition::Handled)
    }

    /// Rehydration failures are soft: log and run the agent without deps.
    fn hydrate_deps(&self, activity: &ActivitySpec, message: &PaigeantMessage) -> HydratedDeps {
        let Some(serialized) = &activity.deps else {
            return HydratedDeps::None;
        };

        match deps::deserialize(serialized, &self.deps_registry, self.fallback_module.as_deref()) {
            Ok(deps) => deps,
            Err(error) => {
                warn!(
                    agent = %self.agent_name,
                    correlation_id = %message.correlation_id,
                    %error,
                    "failed to deserialize deps, continuing without them"
                );
                HydratedDeps::None
            }
        }
    }

    /// Keep only follow-ups named in the envelope's activity registry, then
    /// insert them after the current step within the edit budget.
    fn insert_follow_ups(&self, message: &mut PaigeantMessage, added: Vec<ActivitySpec>) {
        if added.is_empty() {
            return;
        }

        let mut accepted = Vec::new();
        for activity in added {
            if message.activity_registry.contains_key(&activity.agent_name) {
                accepted.push(activity);
            } else {
                warn!(
                    agent = %self.agent_name,
                    follow_up = %activity.agent_name,
                    "skipping follow-up not present in the activity registry"
                );
            }
        }

        let inserted = message
            .routing_slip
            .insert_activities(accepted, message.itinerary_edit_limit);
        if inserted > 0 {
            info!(
                agent = %self.agent_name,
                correlation_id = %message.correlation_id,
                inserted,
                "inserted follow-up activities"
            );
        }
    }
}

/// Combine deserialized dependencies with workflow context.
///
/// The previous step's output and the insertion catalog are computed fresh
/// from the envelope on every delivery. Null deps become a fresh
/// workflow-deps value once a previous output exists; deps of an unrelated
/// type are left alone.
fn add_workflow_dependencies(
    agent_name: &str,
    deps: HydratedDeps,
    message: &PaigeantMessage,
) -> HydratedDeps {
    let previous_output = message.routing_slip.previous_step().and_then(|previous| {
        message
            .payload
            .get(&previous.agent_name)
            .map(|output| PreviousOutput {
                agent_name: previous.agent_name.clone(),
                output: output.clone(),
            })
    });

    let Some(previous_output) = previous_output else {
        // Nothing ran before this step; only the catalog is worth injecting.
        if let HydratedDeps::Workflow(mut workflow) = deps {
            workflow.activity_registry = message.activity_registry.clone();
            return HydratedDeps::Workflow(workflow);
        }
        return deps;
    };

    match deps {
        HydratedDeps::None => HydratedDeps::Workflow(WorkflowDependencies {
            previous_output: Some(previous_output),
            activity_registry: message.activity_registry.clone(),
            extra: serde_json::Map::new(),
        }),
        HydratedDeps::Workflow(mut workflow) => {
            workflow.previous_output = Some(previous_output);
            workflow.activity_registry = message.activity_registry.clone();
            HydratedDeps::Workflow(workflow)
        }
        other => {
            warn!(
                agent = %agent_name,
                "deps are not workflow-shaped, previous outputs will not be available"
            );
            other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::RoutingSlip;
    use crate::deps::CustomDeps;

    fn message_with_history() -> PaigeantMessage {
        let mut slip = RoutingSlip::new(vec![ActivitySpec::new("b", "p2")]);
        slip.executed.push(ActivitySpec::new("a", "p1"));
        let mut message = PaigeantMessage::new("c1", slip);
        message.payload.insert("a".into(), json!("first result"));
        message
            .activity_registry
            .insert("f".into(), ActivitySpec::new("f", "pf"));
        message
    }

    #[test]
    fn test_overlay_builds_fresh_workflow_deps() {
        let message = message_with_history();
        let deps = add_workflow_dependencies("b", HydratedDeps::None, &message);

        let workflow = deps.as_workflow().unwrap();
        let previous = workflow.previous_output.as_ref().unwrap();
        assert_eq!(previous.agent_name, "a");
        assert_eq!(previous.output, json!("first result"));
        assert!(workflow.activity_registry.contains_key("f"));
    }

    #[test]
    fn test_overlay_augments_existing_workflow_deps() {
        let message = message_with_history();
        let mut workflow = WorkflowDependencies::default();
        workflow.extra.insert("city".into(), json!("Berlin"));

        let deps = add_workflow_dependencies("b", HydratedDeps::Workflow(workflow), &message);

        let workflow = deps.as_workflow().unwrap();
        assert_eq!(workflow.extra["city"], json!("Berlin"));
        assert_eq!(
            workflow.previous_output.as_ref().unwrap().agent_name,
            "a"
        );
    }

    #[test]
    fn test_overlay_leaves_foreign_deps_alone() {
        let message = message_with_history();
        let custom = HydratedDeps::Custom(CustomDeps {
            type_name: "WeatherDeps".into(),
            module: "myapp.deps".into(),
            value: json!({"city": "Kiel"}),
        });

        let deps = add_workflow_dependencies("b", custom.clone(), &message);
        assert_eq!(deps, custom);
    }

    #[test]
    fn test_overlay_without_previous_output() {
        // First delivery: dispatch variables may sit in the payload, but no
        // step has executed yet.
        let mut message =
            PaigeantMessage::new("c1", RoutingSlip::new(vec![ActivitySpec::new("a", "p")]));
        message.payload.insert("seed".into(), json!("variable"));
        message
            .activity_registry
            .insert("f".into(), ActivitySpec::new("f", "pf"));

        let deps = add_workflow_dependencies("a", HydratedDeps::None, &message);
        assert!(deps.is_none());

        let deps = add_workflow_dependencies(
            "a",
            HydratedDeps::Workflow(WorkflowDependencies::default()),
            &message,
        );
        let workflow = deps.as_workflow().unwrap();
        assert!(workflow.previous_output.is_none());
        assert!(workflow.activity_registry.contains_key("f"));
    }
}
