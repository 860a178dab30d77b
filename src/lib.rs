//! Paigeant - durable routing-slip workflow orchestrator
//!
//! A workflow is an ordered list of activities, each addressed to a logical
//! agent. The dispatcher publishes the whole list as one envelope; each
//! worker runs its step, appends its output, advances the routing slip and
//! re-publishes to the next topic, mirroring progress into a repository.

pub mod config;
pub mod contracts;
pub mod deps;
pub mod dispatch;
pub mod error;
pub mod execute;
pub mod handlers;
pub mod persistence;
pub mod transport;

pub use contracts::{
    ActivitySpec, PaigeantMessage, PreviousOutput, RoutingSlip, SerializedDeps,
    WorkflowDependencies, DEFAULT_ITINERARY_EDIT_LIMIT, SPEC_VERSION,
};
pub use dispatch::WorkflowDispatcher;
pub use error::PaigeantError;
pub use execute::{ActivityExecutor, AgentHandle, AgentOutput, AgentRegistry, AgentResolver};
