// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node definitions: instances, the computation capability, and the registry
//! of node types.
//!
//! A [`Node`] is plain data (ports, options, opaque state) and stays
//! serde-clean; its computation is resolved at run time by looking up its
//! type tag in the [`NodeRegistry`], which maps tags to [`NodeDefinition`]
//! factories carrying a shared [`Calculate`] capability.

use crate::port::{Port, PortDirection, PortId};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// A node instance in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique instance ID
    pub id: NodeId,
    /// Node type tag, resolved through the node registry
    pub type_tag: String,
    /// Display name (can be customized)
    pub name: String,
    /// Input ports, in declaration order
    pub inputs: Vec<Port>,
    /// Output ports, in declaration order
    pub outputs: Vec<Port>,
    /// Named options persisted alongside the node
    pub options: IndexMap<String, Value>,
    /// Opaque custom state persisted alongside the node
    pub state: Option<Value>,
}

impl Node {
    /// Get a port by ID, searching inputs then outputs
    pub fn port(&self, port_id: PortId) -> Option<&Port> {
        self.inputs
            .iter()
            .find(|p| p.id == port_id)
            .or_else(|| self.outputs.iter().find(|p| p.id == port_id))
    }

    /// Get an input port by name
    pub fn input_named(&self, name: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Get an output port by name
    pub fn output_named(&self, name: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Get all ports, inputs first
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.inputs.iter().chain(self.outputs.iter())
    }

    pub(crate) fn port_mut(&mut self, port_id: PortId) -> Option<&mut Port> {
        self.inputs
            .iter_mut()
            .find(|p| p.id == port_id)
            .or_else(|| self.outputs.iter_mut().find(|p| p.id == port_id))
    }

    pub(crate) fn output_named_mut(&mut self, name: &str) -> Option<&mut Port> {
        self.outputs.iter_mut().find(|p| p.name == name)
    }
}

/// Output values of a computation, keyed by output port name
pub type PortValues = IndexMap<String, Value>;

/// Everything a computation may read: input values keyed by input port name
/// (value-only interfaces included), plus the node's options and custom state.
#[derive(Debug, Clone)]
pub struct CalculationInputs {
    /// Input port values, keyed by port name
    pub inputs: IndexMap<String, Value>,
    /// Node options
    pub options: IndexMap<String, Value>,
    /// Opaque node state
    pub state: Option<Value>,
}

impl CalculationInputs {
    /// Get an input value by port name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Get an input value as an `f64`, failing with a descriptive error
    pub fn number(&self, name: &str) -> Result<f64, ComputeError> {
        self.get(name)
            .and_then(Value::as_f64)
            .ok_or_else(|| ComputeError::new(format!("input '{name}' is not a number")))
    }
}

/// Error raised by a node's own computation logic.
///
/// These are per-node failures: the engine records them against the node and
/// skips its dependents without aborting independent branches.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ComputeError {
    /// Human-readable failure description
    pub message: String,
}

impl ComputeError {
    /// Create a new computation error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The uniform computation capability implemented by every node type.
///
/// Implementations may suspend cooperatively; the engine awaits each node's
/// future before any dependent becomes eligible to run. Synchronous nodes can
/// use [`CalculateFn`] instead of implementing this by hand.
pub trait Calculate: Send + Sync {
    /// Compute output values from the given inputs.
    fn calculate(&self, inputs: CalculationInputs) -> BoxFuture<'static, Result<PortValues, ComputeError>>;
}

/// Adapter turning a synchronous closure into a [`Calculate`] capability.
pub struct CalculateFn<F>(
    /// The wrapped computation
    pub F,
);

impl<F> Calculate for CalculateFn<F>
where
    F: Fn(CalculationInputs) -> Result<PortValues, ComputeError> + Send + Sync,
{
    fn calculate(&self, inputs: CalculationInputs) -> BoxFuture<'static, Result<PortValues, ComputeError>> {
        let result = (self.0)(inputs);
        Box::pin(std::future::ready(result))
    }
}

/// Declaration of one port in a [`NodeDefinition`]
#[derive(Debug, Clone)]
pub struct PortSpec {
    /// Port name
    pub name: String,
    /// Interface type tag
    pub type_tag: String,
    /// Whether instantiated ports accept connections
    pub connectable: bool,
    /// Initial value for instantiated ports
    pub default: Value,
}

impl PortSpec {
    /// Create a new connectable port spec with a null default
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            connectable: true,
            default: Value::Null,
        }
    }

    /// Set the initial value
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    /// Mark instantiated ports as value-only (never connectable)
    pub fn value_only(mut self) -> Self {
        self.connectable = false;
        self
    }

    fn build(&self, direction: PortDirection) -> Port {
        let port = match direction {
            PortDirection::Input => Port::input(&self.name, &self.type_tag),
            PortDirection::Output => Port::output(&self.name, &self.type_tag),
        };
        let port = port.with_value(self.default.clone());
        if self.connectable {
            port
        } else {
            port.value_only()
        }
    }
}

/// Node type definition: a registered factory producing [`Node`] instances
/// plus the shared computation capability for that type.
#[derive(Clone)]
pub struct NodeDefinition {
    /// Unique type tag
    pub type_tag: String,
    /// Display name for instances
    pub name: String,
    /// Input port declarations
    pub inputs: Vec<PortSpec>,
    /// Output port declarations
    pub outputs: Vec<PortSpec>,
    /// Computation shared by all instances of this type
    pub calculate: Arc<dyn Calculate>,
}

impl NodeDefinition {
    /// Create a definition with no ports
    pub fn new(
        type_tag: impl Into<String>,
        name: impl Into<String>,
        calculate: Arc<dyn Calculate>,
    ) -> Self {
        Self {
            type_tag: type_tag.into(),
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            calculate,
        }
    }

    /// Add an input port declaration
    pub fn with_input(mut self, spec: PortSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    /// Add an output port declaration
    pub fn with_output(mut self, spec: PortSpec) -> Self {
        self.outputs.push(spec);
        self
    }
}

impl std::fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("type_tag", &self.type_tag)
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Registry of available node types
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    /// Registered definitions by type tag
    definitions: IndexMap<String, NodeDefinition>,
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node definition, overwriting any prior definition with the
    /// same type tag
    pub fn register(&mut self, definition: NodeDefinition) {
        self.definitions
            .insert(definition.type_tag.clone(), definition);
    }

    /// Get a definition by type tag
    pub fn get(&self, type_tag: &str) -> Option<&NodeDefinition> {
        self.definitions.get(type_tag)
    }

    /// Get all registered definitions
    pub fn definitions(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.definitions.values()
    }

    /// Resolve the computation capability for a type tag
    pub fn calculate_for(&self, type_tag: &str) -> Option<Arc<dyn Calculate>> {
        self.definitions
            .get(type_tag)
            .map(|d| Arc::clone(&d.calculate))
    }

    /// Build a fresh node instance (new node and port ids, default values)
    /// from a registered definition
    pub fn instantiate(&self, type_tag: &str) -> Option<Node> {
        let definition = self.get(type_tag)?;
        Some(Node {
            id: NodeId::new(),
            type_tag: definition.type_tag.clone(),
            name: definition.name.clone(),
            inputs: definition
                .inputs
                .iter()
                .map(|s| s.build(PortDirection::Input))
                .collect(),
            outputs: definition
                .outputs
                .iter()
                .map(|s| s.build(PortDirection::Output))
                .collect(),
            options: IndexMap::new(),
            state: None,
        })
    }
}
