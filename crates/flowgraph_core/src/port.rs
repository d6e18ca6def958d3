// SPDX-License-Identifier: MIT OR Apache-2.0
//! Port (interface) definitions: typed value slots on nodes.

use crate::hooks::{Hook, SequentialHook};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortId(pub Uuid);

impl PortId {
    /// Create a new random port ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PortId {
    fn default() -> Self {
        Self::new()
    }
}

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    /// Input port
    Input,
    /// Output port
    Output,
}

/// Outcome of [`Port::set_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The (possibly transformed) value was stored.
    Stored,
    /// A `before_set` tap vetoed the change; the stored value is untouched.
    Vetoed,
}

/// A typed value slot on a node.
///
/// Ports carry the type tag used by the
/// [`TypeRegistry`](crate::types::TypeRegistry) for conversions, the current
/// value, and a connection count maintained by the owning
/// [`Graph`](crate::graph::Graph). A port with `connectable == false` is a
/// value-only interface that never participates in connections (an option-like
/// input edited directly by the host).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    /// Unique port ID
    pub id: PortId,
    /// Port name, unique among the ports on one side of a node
    pub name: String,
    /// Port direction
    pub direction: PortDirection,
    /// Interface type tag, resolved through the type registry
    pub type_tag: String,
    /// Whether this port may participate in connections
    pub connectable: bool,
    /// Current value
    value: Value,
    /// Number of live connections touching this port
    connection_count: u32,
    /// Middleware chain run before a value is stored; taps may transform or
    /// veto. Not fired for engine-computed writes.
    #[serde(skip)]
    pub before_set: SequentialHook<Value>,
    /// Notification fired after a value is stored, carrying the final value.
    #[serde(skip)]
    pub on_set: Hook<Value>,
}

impl Port {
    /// Create a new input port
    pub fn input(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            id: PortId::new(),
            name: name.into(),
            direction: PortDirection::Input,
            type_tag: type_tag.into(),
            connectable: true,
            value: Value::Null,
            connection_count: 0,
            before_set: SequentialHook::new(),
            on_set: Hook::new(),
        }
    }

    /// Create a new output port
    pub fn output(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            direction: PortDirection::Output,
            ..Self::input(name, type_tag)
        }
    }

    /// Set the initial value
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }

    /// Mark this port as a value-only interface (never connectable)
    pub fn value_only(mut self) -> Self {
        self.connectable = false;
        self
    }

    /// Current value of this port
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Number of live connections touching this port
    pub fn connection_count(&self) -> u32 {
        self.connection_count
    }

    /// Store a value through the hook pipeline: `before_set` taps may
    /// transform or veto, then `on_set` fires with the final value.
    ///
    /// Triggering recalculation is the engine's responsibility, not the
    /// port's.
    pub fn set_value(&mut self, value: Value) -> SetOutcome {
        match self.before_set.execute(value) {
            Some(final_value) => {
                self.value = final_value;
                self.on_set.emit(&self.value);
                SetOutcome::Stored
            }
            None => SetOutcome::Vetoed,
        }
    }

    /// Store a computed value directly, bypassing the hook pipeline. Used by
    /// the engine when writing node outputs and propagated values, and by the
    /// persistence loader.
    pub(crate) fn store_value(&mut self, value: Value) {
        self.value = value;
    }

    pub(crate) fn increment_connections(&mut self) {
        self.connection_count += 1;
    }

    pub(crate) fn decrement_connections(&mut self) {
        debug_assert!(self.connection_count > 0, "connection count underflow");
        self.connection_count = self.connection_count.saturating_sub(1);
    }
}
