//! Core message contracts for the workflow system
//!
//! Everything that crosses the wire lives here: the routing slip, the
//! activity specs it orders, and the envelope that carries slip + payload
//! from topic to topic. Envelopes serialize as JSON (`spec_version = "1.0"`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::persistence::{WorkflowRepository, WorkflowStatus};
use crate::transport::Transport;

/// Wire format version stamped on every envelope.
pub const SPEC_VERSION: &str = "1.0";

/// Default per-workflow budget for mid-flight itinerary insertions.
pub const DEFAULT_ITINERARY_EDIT_LIMIT: u32 = 3;

// ═══════════════════════════════════════════════════════════════════════════
// Dependencies on the wire
// ═══════════════════════════════════════════════════════════════════════════

/// Transport form of a step's input object.
///
/// `data` holds the serialized value (structured or plain string), `type`
/// and `module` name the shape so a worker in a foreign process can
/// reconstruct a typed instance. A null `data` means "no deps".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SerializedDeps {
    pub data: Option<Value>,
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    pub module: Option<String>,
}

/// Defines one step in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivitySpec {
    /// Topic selector: messages for this step are published on this name.
    pub agent_name: String,
    /// Opaque instruction handed to the agent.
    pub prompt: String,
    /// Additional dependencies for the activity.
    #[serde(default)]
    pub deps: Option<SerializedDeps>,
    /// Reserved free-form arguments, serialized but never read by the core.
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

impl ActivitySpec {
    pub fn new(agent_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            deps: None,
            arguments: HashMap::new(),
        }
    }

    pub fn with_deps(mut self, deps: SerializedDeps) -> Self {
        self.deps = Some(deps);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Routing slip
// ═══════════════════════════════════════════════════════════════════════════

/// Describes remaining, executed and compensating activities.
///
/// The head of `itinerary` is the step currently being executed. Completed
/// steps move to `executed` in order. `compensations` is reserved and never
/// populated by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoutingSlip {
    #[serde(default)]
    pub itinerary: Vec<ActivitySpec>,
    #[serde(default)]
    pub executed: Vec<ActivitySpec>,
    #[serde(default)]
    pub compensations: Vec<ActivitySpec>,
    /// How many steps have been inserted mid-flight over this slip's lifetime.
    #[serde(default)]
    pub inserted_steps: u32,
}

impl RoutingSlip {
    pub fn new(itinerary: Vec<ActivitySpec>) -> Self {
        Self {
            itinerary,
            ..Default::default()
        }
    }

    /// The next step to execute, if any.
    pub fn next_step(&self) -> Option<&ActivitySpec> {
        self.itinerary.first()
    }

    /// The most recently completed step, if any.
    pub fn previous_step(&self) -> Option<&ActivitySpec> {
        self.executed.last()
    }

    /// True when all activities have been executed.
    pub fn is_finished(&self) -> bool {
        self.itinerary.is_empty()
    }

    /// Move `step` from the head of the itinerary to the executed list.
    ///
    /// A no-op when `step` is not the current head, so that redelivered
    /// messages which already advanced the slip are tolerated.
    pub fn mark_complete(&mut self, step: &ActivitySpec) {
        if self.itinerary.first() == Some(step) {
            let completed = self.itinerary.remove(0);
            self.executed.push(completed);
        }
    }

    /// Insert follow-up steps immediately after the current head.
    ///
    /// Insertion happens at position 1, not 0, so the head stays the step the
    /// running worker is executing and its `mark_complete` still matches.
    /// At most `limit - inserted_steps` entries are taken; the rest are
    /// silently dropped. Returns the number actually inserted.
    pub fn insert_activities(&mut self, new_steps: Vec<ActivitySpec>, limit: u32) -> usize {
        let budget = limit.saturating_sub(self.inserted_steps) as usize;
        let mut inserted = 0;
        for step in new_steps.into_iter().take(budget) {
            let position = (1 + inserted).min(self.itinerary.len());
            self.itinerary.insert(position, step);
            inserted += 1;
        }
        self.inserted_steps += inserted as u32;
        inserted
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Workflow context surfaced to agents
// ═══════════════════════════════════════════════════════════════════════════

/// Output of the immediately preceding executed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviousOutput {
    pub agent_name: String,
    pub output: Value,
}

/// Dependency shape the executor knows how to overlay with workflow context.
///
/// `previous_output` and `activity_registry` are computed fresh per delivery
/// from the envelope; any extra user fields ride along untouched in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDependencies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_output: Option<PreviousOutput>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub activity_registry: HashMap<String, ActivitySpec>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════

/// Envelope exchanged over the bus: metadata, routing slip and payload.
///
/// Exactly one worker owns an envelope at a time (between receive and ack),
/// so none of the mutators take a lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaigeantMessage {
    /// Unique per publication; re-minted on every forward.
    pub message_id: String,
    /// Stable identifier for one workflow instance.
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Opaque on-behalf-of delegation credential, propagated unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obo_token: Option<String>,
    /// Reserved for a future integrity layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub routing_slip: RoutingSlip,
    /// Outputs keyed by agent name, populated as steps complete.
    #[serde(default)]
    pub payload: HashMap<String, Value>,
    pub spec_version: String,
    /// Catalog of activities a running worker may insert after itself.
    /// Read-only after dispatch.
    #[serde(default)]
    pub activity_registry: HashMap<String, ActivitySpec>,
    /// Per-workflow budget enforced by `RoutingSlip::insert_activities`.
    #[serde(default = "default_edit_limit")]
    pub itinerary_edit_limit: u32,
}

fn default_edit_limit() -> u32 {
    DEFAULT_ITINERARY_EDIT_LIMIT
}

impl PaigeantMessage {
    pub fn new(correlation_id: impl Into<String>, routing_slip: RoutingSlip) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            trace_id: None,
            timestamp: Utc::now(),
            obo_token: None,
            signature: None,
            routing_slip,
            payload: HashMap::new(),
            spec_version: SPEC_VERSION.to_string(),
            activity_registry: HashMap::new(),
            itinerary_edit_limit: DEFAULT_ITINERARY_EDIT_LIMIT,
        }
    }

    /// Serialize the envelope to its JSON wire form.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize an envelope from its JSON wire form.
    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Advance the slip and publish to the next activity's topic, if any.
    ///
    /// Popping the current head is the local commit point. When the itinerary
    /// drains, the workflow is marked completed in the repository instead of
    /// publishing. A publish failure after the pop leaves the delivery
    /// un-acked; redelivery is safe because `mark_complete` no-ops on a
    /// non-matching head and step persistence is idempotent.
    pub async fn forward_to_next_step(
        &mut self,
        transport: &dyn Transport,
        repository: &dyn WorkflowRepository,
    ) -> anyhow::Result<()> {
        let Some(current) = self.routing_slip.next_step().cloned() else {
            return Ok(());
        };

        self.routing_slip.mark_complete(&current);

        match self.routing_slip.next_step().cloned() {
            Some(next) => {
                self.message_id = Uuid::new_v4().to_string();
                transport.publish(&next.agent_name, self).await?;
            }
            None => {
                repository
                    .mark_workflow_completed(&self.correlation_id, WorkflowStatus::Completed)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str) -> ActivitySpec {
        ActivitySpec::new(name, format!("prompt for {name}"))
    }

    #[test]
    fn test_routing_slip_operations() {
        let activity1 = spec("agent1").with_deps(SerializedDeps {
            data: Some(json!({"key": "value"})),
            type_name: Some("dict".into()),
            module: Some("builtins".into()),
        });
        let activity2 = spec("agent2");

        let mut slip = RoutingSlip::new(vec![activity1.clone(), activity2]);

        assert_eq!(slip.next_step().unwrap().agent_name, "agent1");
        assert!(!slip.is_finished());

        slip.mark_complete(&activity1);
        assert_eq!(slip.itinerary.len(), 1);
        assert_eq!(slip.executed.len(), 1);
        assert_eq!(slip.executed[0].agent_name, "agent1");
        assert_eq!(slip.previous_step().unwrap().agent_name, "agent1");
        assert_eq!(slip.next_step().unwrap().agent_name, "agent2");
    }

    #[test]
    fn test_empty_routing_slip() {
        let slip = RoutingSlip::default();
        assert!(slip.next_step().is_none());
        assert!(slip.previous_step().is_none());
        assert!(slip.is_finished());
    }

    #[test]
    fn test_mark_complete_ignores_non_head() {
        let a = spec("a");
        let b = spec("b");
        let mut slip = RoutingSlip::new(vec![a.clone(), b.clone()]);

        // Completing a step that is not the head must not advance the slip.
        slip.mark_complete(&b);
        assert_eq!(slip.itinerary.len(), 2);
        assert!(slip.executed.is_empty());

        // Retried completion of an already-popped head is a no-op too.
        slip.mark_complete(&a);
        slip.mark_complete(&a);
        assert_eq!(slip.itinerary.len(), 1);
        assert_eq!(slip.executed.len(), 1);
    }

    #[test]
    fn test_insert_activities_after_head() {
        let mut slip = RoutingSlip::new(vec![spec("a1"), spec("c")]);
        let inserted = slip.insert_activities(vec![spec("a2")], 2);

        assert_eq!(inserted, 1);
        assert_eq!(slip.inserted_steps, 1);
        // Head unchanged, insertion lands at position 1.
        assert_eq!(slip.itinerary[0].agent_name, "a1");
        assert_eq!(slip.itinerary[1].agent_name, "a2");
        assert_eq!(slip.itinerary[2].agent_name, "c");
    }

    #[test]
    fn test_insert_activities_capped_at_limit() {
        let mut slip = RoutingSlip::new(vec![spec("a1")]);
        let inserted = slip.insert_activities(vec![spec("a2"), spec("a3")], 1);

        assert_eq!(inserted, 1);
        assert_eq!(slip.inserted_steps, 1);
        assert_eq!(slip.itinerary.len(), 2);
        assert_eq!(slip.itinerary[1].agent_name, "a2");

        // Budget is cumulative across the slip's lifetime.
        let inserted = slip.insert_activities(vec![spec("a4")], 1);
        assert_eq!(inserted, 0);
        assert_eq!(slip.inserted_steps, 1);
    }

    #[test]
    fn test_insert_preserves_relative_order() {
        let mut slip = RoutingSlip::new(vec![spec("head"), spec("tail")]);
        slip.insert_activities(vec![spec("f1"), spec("f2")], 5);

        let names: Vec<_> = slip.itinerary.iter().map(|s| s.agent_name.as_str()).collect();
        assert_eq!(names, ["head", "f1", "f2", "tail"]);
    }

    #[test]
    fn test_envelope_json_round_trip() {
        let mut message = PaigeantMessage::new(
            "corr-1",
            RoutingSlip::new(vec![spec("a"), spec("b")]),
        );
        message.trace_id = Some("corr-1".into());
        message.obo_token = Some("token".into());
        message
            .payload
            .insert("seed".into(), json!({"k": "v"}));
        message
            .activity_registry
            .insert("f".into(), spec("f"));

        let json = message.to_json().unwrap();
        let back = PaigeantMessage::from_json(&json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_envelope_decodes_without_optional_fields() {
        let wire = json!({
            "message_id": "m1",
            "correlation_id": "c1",
            "timestamp": "2025-01-01T00:00:00Z",
            "routing_slip": {"itinerary": [], "executed": [], "compensations": [], "inserted_steps": 0},
            "payload": {},
            "spec_version": "1.0",
            "activity_registry": {}
        });

        let message = PaigeantMessage::from_json(&wire.to_string()).unwrap();
        assert!(message.trace_id.is_none());
        assert!(message.obo_token.is_none());
        assert!(message.signature.is_none());
        assert_eq!(message.itinerary_edit_limit, DEFAULT_ITINERARY_EDIT_LIMIT);
    }

    #[tokio::test]
    async fn test_forward_publishes_to_next_topic() {
        use crate::persistence::InMemoryWorkflowRepository;
        use crate::transport::InMemoryTransport;

        let transport = InMemoryTransport::new();
        let repository = InMemoryWorkflowRepository::new();

        let mut message =
            PaigeantMessage::new("c1", RoutingSlip::new(vec![spec("a"), spec("b")]));
        let original_id = message.message_id.clone();
        message
            .forward_to_next_step(&transport, &repository)
            .await
            .unwrap();

        assert_eq!(message.routing_slip.executed.len(), 1);
        assert_eq!(transport.pending("b").await, 1);
        assert_eq!(transport.pending("a").await, 0);
        // Each publication carries a fresh message id.
        assert_ne!(message.message_id, original_id);
    }

    #[tokio::test]
    async fn test_forward_on_last_step_completes_workflow() {
        use crate::persistence::InMemoryWorkflowRepository;
        use crate::transport::InMemoryTransport;

        let transport = InMemoryTransport::new();
        let repository = InMemoryWorkflowRepository::new();

        let slip = RoutingSlip::new(vec![spec("a")]);
        repository
            .create_workflow("c1", &slip, &HashMap::new())
            .await
            .unwrap();

        let mut message = PaigeantMessage::new("c1", slip);
        message
            .forward_to_next_step(&transport, &repository)
            .await
            .unwrap();

        assert!(message.routing_slip.is_finished());
        let workflow = repository.get_workflow("c1").await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
    }
}
