//! Dependency codec for moving typed step inputs between processes
//!
//! On the wire a dependency is a `(data, type, module)` tuple. At the
//! receiver, the `(module, type)` pair resolves through a static allow-list
//! of registered constructors rather than reflection, so a foreign envelope
//! can never name its way to an arbitrary type.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::contracts::{SerializedDeps, WorkflowDependencies};
use crate::error::PaigeantError;

/// Module recorded for plain strings.
pub const BUILTINS_MODULE: &str = "builtins";
/// Type name recorded for plain strings.
pub const STR_TYPE: &str = "str";
/// Module under which the workflow-deps shape is registered.
pub const WORKFLOW_DEPS_MODULE: &str = "paigeant.contracts";
/// Type name under which the workflow-deps shape is registered.
pub const WORKFLOW_DEPS_TYPE: &str = "WorkflowDependencies";

/// A dependency value in its in-process form.
#[derive(Debug, Clone, PartialEq)]
pub enum HydratedDeps {
    /// No dependencies.
    None,
    /// A bare string.
    Text(String),
    /// The workflow-deps shape the executor overlays with context.
    Workflow(WorkflowDependencies),
    /// A registered user type, carried as validated structured data.
    Custom(CustomDeps),
}

/// A registered non-core dependency, validated against its constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomDeps {
    pub type_name: String,
    pub module: String,
    pub value: Value,
}

impl HydratedDeps {
    pub fn is_none(&self) -> bool {
        matches!(self, HydratedDeps::None)
    }

    /// Borrow the workflow-deps shape if that is what this value is.
    pub fn as_workflow(&self) -> Option<&WorkflowDependencies> {
        match self {
            HydratedDeps::Workflow(deps) => Some(deps),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Serialization
// ═══════════════════════════════════════════════════════════════════════════

/// Serialize a dependency for transmission over the message bus.
pub fn serialize(deps: &HydratedDeps) -> Result<SerializedDeps> {
    match deps {
        HydratedDeps::None => Ok(SerializedDeps::default()),
        HydratedDeps::Text(text) => Ok(SerializedDeps {
            data: Some(Value::String(text.clone())),
            type_name: Some(STR_TYPE.to_string()),
            module: Some(BUILTINS_MODULE.to_string()),
        }),
        HydratedDeps::Workflow(workflow) => Ok(SerializedDeps {
            data: Some(
                serde_json::to_value(workflow)
                    .context("failed to serialize workflow dependencies")?,
            ),
            type_name: Some(WORKFLOW_DEPS_TYPE.to_string()),
            module: Some(WORKFLOW_DEPS_MODULE.to_string()),
        }),
        HydratedDeps::Custom(custom) => Ok(SerializedDeps {
            data: Some(custom.value.clone()),
            type_name: Some(custom.type_name.clone()),
            module: Some(custom.module.clone()),
        }),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Allow-list registry
// ═══════════════════════════════════════════════════════════════════════════

type Constructor = Arc<dyn Fn(&Value) -> Result<HydratedDeps> + Send + Sync>;

/// Static allow-list of dependency types a worker will reconstruct.
///
/// Keyed by `(module, type)`. The default registry admits only the
/// workflow-deps shape; custom types must be registered explicitly.
#[derive(Clone)]
pub struct DependencyRegistry {
    constructors: HashMap<(String, String), Constructor>,
}

impl Default for DependencyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register_constructor(WORKFLOW_DEPS_MODULE, WORKFLOW_DEPS_TYPE, |data| {
            let workflow: WorkflowDependencies = serde_json::from_value(data.clone())
                .context("workflow dependencies did not match the expected shape")?;
            Ok(HydratedDeps::Workflow(workflow))
        });
        registry
    }
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom dependency type. The recorded value must parse as
    /// `T`; it is then handed to the agent as validated structured data.
    pub fn register<T>(&mut self, module: &str, type_name: &str)
    where
        T: DeserializeOwned + 'static,
    {
        let owned_module = module.to_string();
        let owned_type = type_name.to_string();
        self.register_constructor(module, type_name, move |data| {
            let _typed: T = serde_json::from_value(data.clone()).with_context(|| {
                format!("data did not match registered type {owned_module}.{owned_type}")
            })?;
            Ok(HydratedDeps::Custom(CustomDeps {
                type_name: owned_type.clone(),
                module: owned_module.clone(),
                value: data.clone(),
            }))
        });
    }

    /// Register a raw constructor for `(module, type)`.
    pub fn register_constructor<F>(&mut self, module: &str, type_name: &str, constructor: F)
    where
        F: Fn(&Value) -> Result<HydratedDeps> + Send + Sync + 'static,
    {
        self.constructors.insert(
            (module.to_string(), type_name.to_string()),
            Arc::new(constructor),
        );
    }

    fn lookup(&self, module: &str, type_name: &str) -> Option<&Constructor> {
        self.constructors
            .get(&(module.to_string(), type_name.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Deserialization
// ═══════════════════════════════════════════════════════════════════════════

/// Reconstruct a dependency from serialized data and metadata.
///
/// `fallback_module` substitutes for a recorded module of `__main__`, letting
/// a worker resolve types that were defined in the dispatcher's entry module.
/// Failures here are treated as soft by the executor: it logs and proceeds
/// with no deps.
pub fn deserialize(
    deps: &SerializedDeps,
    registry: &DependencyRegistry,
    fallback_module: Option<&str>,
) -> Result<HydratedDeps> {
    let Some(data) = &deps.data else {
        return Ok(HydratedDeps::None);
    };

    if deps.type_name.as_deref() == Some(STR_TYPE) {
        if let Value::String(text) = data {
            return Ok(HydratedDeps::Text(text.clone()));
        }
    }

    let (Some(type_name), Some(module)) = (&deps.type_name, &deps.module) else {
        return Err(PaigeantError::MissingDependencyMetadata.into());
    };

    let module = match (module.as_str(), fallback_module) {
        ("__main__" | "main", Some(fallback)) => fallback,
        _ => module.as_str(),
    };

    let constructor =
        registry
            .lookup(module, type_name)
            .ok_or_else(|| PaigeantError::UnknownDependencyType {
                module: module.to_string(),
                type_name: type_name.clone(),
            })?;

    constructor(data).with_context(|| {
        format!("failed to reconstruct dependency '{type_name}' from module '{module}'")
    })
}
