//! Error types callers are expected to match on.

use thiserror::Error;

/// Orchestrator errors surfaced at the public seams.
///
/// Operational code threads `anyhow::Result` and wraps these where a caller
/// needs to distinguish the condition (factories, dispatch validation).
#[derive(Error, Debug)]
pub enum PaigeantError {
    /// Dispatching a workflow whose itinerary has no steps.
    #[error("cannot dispatch a workflow with an empty itinerary")]
    EmptyItinerary,

    /// Transport backend name not recognized by the factory.
    #[error("unsupported transport backend: {0}")]
    UnsupportedTransport(String),

    /// Database URL scheme not recognized by the factory.
    #[error("unsupported database backend: {0}")]
    UnsupportedDatabase(String),

    /// The worker's resolver has no local agent under this name.
    #[error("agent '{0}' is not registered with this worker")]
    AgentNotFound(String),

    /// Dependency metadata names a type outside the allow-list.
    #[error("no dependency type registered for {module}.{type_name}")]
    UnknownDependencyType { module: String, type_name: String },

    /// Serialized dependency carried no type/module metadata.
    #[error("missing dependency type or module metadata")]
    MissingDependencyMetadata,
}
