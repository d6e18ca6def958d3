// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph container: owns nodes and connections and enforces the structural
//! invariants at its mutation operations.

use crate::connection::{Connection, ConnectionId};
use crate::hooks::Hook;
use crate::node::{Node, NodeId};
use crate::port::{Port, PortDirection, PortId, SetOutcome};
use indexmap::IndexMap;
use serde_json::Value;

/// Payload of the [`GraphEvents::value_changed`] hook
#[derive(Debug, Clone)]
pub struct ValueChange {
    /// Node owning the changed interface
    pub node: NodeId,
    /// The changed interface
    pub port: PortId,
    /// The stored (post-middleware) value
    pub value: Value,
}

/// Structural lifecycle hooks published for the presentation layer.
///
/// Consumers re-render from these; they must never be used to mutate the
/// graph from inside a tap.
#[derive(Debug, Clone, Default)]
pub struct GraphEvents {
    /// A node was inserted
    pub node_added: Hook<NodeId>,
    /// A node (and all its connections) was removed
    pub node_removed: Hook<NodeId>,
    /// A connection was created
    pub connection_added: Hook<ConnectionId>,
    /// A connection was destructed
    pub connection_removed: Hook<ConnectionId>,
    /// An interface was added to a live node
    pub interface_added: Hook<(NodeId, PortId)>,
    /// An interface was removed from a live node
    pub interface_removed: Hook<(NodeId, PortId)>,
    /// An interface value was stored through [`Graph::set_value`]
    pub value_changed: Hook<ValueChange>,
}

/// A dataflow graph owning nodes and connections.
///
/// The collections are private: every mutation goes through the operations
/// below, which validate invariants atomically (a rejected mutation leaves
/// the graph unchanged), maintain connection counts, bump the structure
/// version consumed by the engine's order cache, and fire lifecycle hooks.
#[derive(Debug)]
pub struct Graph {
    /// Graph name
    pub name: String,
    nodes: IndexMap<NodeId, Node>,
    connections: IndexMap<ConnectionId, Connection>,
    template_tag: Option<String>,
    version: u64,
    /// Structural lifecycle hooks
    pub events: GraphEvents,
}

impl Graph {
    /// Create a new empty graph
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: IndexMap::new(),
            connections: IndexMap::new(),
            template_tag: None,
            version: 0,
            events: GraphEvents::default(),
        }
    }

    /// Type tag of the template this graph was instantiated from, if any.
    /// `None` for root graphs.
    pub fn template_tag(&self) -> Option<&str> {
        self.template_tag.as_deref()
    }

    pub(crate) fn set_template_tag(&mut self, tag: impl Into<String>) {
        self.template_tag = Some(tag.into());
    }

    /// Structure version: bumped by every node/connection/interface mutation.
    /// Value changes do not bump it.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    /// Add a node to the graph. Rejects id collisions atomically.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, DuplicateIdError> {
        let id = node.id;
        if self.nodes.contains_key(&id) {
            return Err(DuplicateIdError(id));
        }
        self.nodes.insert(id, node);
        self.touch();
        self.events.node_added.emit(&id);
        Ok(id)
    }

    /// Remove a node, destructing every connection touching it first
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        if !self.nodes.contains_key(&node_id) {
            return None;
        }
        let touching: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.involves_node(node_id))
            .map(|c| c.id)
            .collect();
        for connection_id in touching {
            self.disconnect(connection_id);
        }
        let node = self.nodes.shift_remove(&node_id);
        self.touch();
        self.events.node_removed.emit(&node_id);
        node
    }

    /// Get a node by ID
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get all nodes, in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Get all node IDs
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Get the number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Find the node owning a port
    pub fn find_port(&self, port_id: PortId) -> Option<(NodeId, &Port)> {
        self.nodes
            .values()
            .find_map(|n| n.port(port_id).map(|p| (n.id, p)))
    }

    /// Create a connection from an output port to an input port on another
    /// node.
    ///
    /// Preconditions, checked before any mutation: both nodes and ports
    /// exist, the endpoints belong to different nodes, both ports are
    /// connectable, the source is an output and the destination an input, and
    /// the destination has no existing incoming connection.
    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: PortId,
        to_node: NodeId,
        to_port: PortId,
    ) -> Result<ConnectionId, InvalidConnectionError> {
        let source_node = self
            .nodes
            .get(&from_node)
            .ok_or(InvalidConnectionError::NodeNotFound(from_node))?;
        let target_node = self
            .nodes
            .get(&to_node)
            .ok_or(InvalidConnectionError::NodeNotFound(to_node))?;

        let source_port = source_node
            .port(from_port)
            .ok_or(InvalidConnectionError::PortNotFound(from_port))?;
        let target_port = target_node
            .port(to_port)
            .ok_or(InvalidConnectionError::PortNotFound(to_port))?;

        if from_node == to_node {
            return Err(InvalidConnectionError::SameNode);
        }
        if !source_port.connectable {
            return Err(InvalidConnectionError::NotConnectable(from_port));
        }
        if !target_port.connectable {
            return Err(InvalidConnectionError::NotConnectable(to_port));
        }
        if source_port.direction != PortDirection::Output
            || target_port.direction != PortDirection::Input
        {
            return Err(InvalidConnectionError::BadDirection);
        }
        // Fan-in is forbidden: one incoming connection per input.
        if self.connections.values().any(|c| c.to_port == to_port) {
            return Err(InvalidConnectionError::AlreadyConnected(to_port));
        }

        let connection = Connection::new(from_node, from_port, to_node, to_port);
        let id = connection.id;
        self.insert_connection(connection);
        Ok(id)
    }

    /// Insert a pre-built connection, incrementing endpoint counts. The
    /// caller has already validated (or restored) it.
    pub(crate) fn insert_connection(&mut self, connection: Connection) {
        let id = connection.id;
        if let Some(node) = self.nodes.get_mut(&connection.from_node) {
            if let Some(port) = node.port_mut(connection.from_port) {
                port.increment_connections();
            }
        }
        if let Some(node) = self.nodes.get_mut(&connection.to_node) {
            if let Some(port) = node.port_mut(connection.to_port) {
                port.increment_connections();
            }
        }
        self.connections.insert(id, connection);
        self.touch();
        self.events.connection_added.emit(&id);
    }

    /// Destruct a connection, decrementing both endpoint connection counts
    pub fn disconnect(&mut self, connection_id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.shift_remove(&connection_id)?;
        if let Some(node) = self.nodes.get_mut(&connection.from_node) {
            if let Some(port) = node.port_mut(connection.from_port) {
                port.decrement_connections();
            }
        }
        if let Some(node) = self.nodes.get_mut(&connection.to_node) {
            if let Some(port) = node.port_mut(connection.to_port) {
                port.decrement_connections();
            }
        }
        self.touch();
        self.events.connection_removed.emit(&connection_id);
        Some(connection)
    }

    /// Get a connection by ID
    pub fn connection(&self, connection_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&connection_id)
    }

    /// Get all connections
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Get connections leaving a specific port
    pub fn connections_from(&self, port_id: PortId) -> impl Iterator<Item = &Connection> {
        self.connections
            .values()
            .filter(move |c| c.from_port == port_id)
    }

    /// Get the connection entering a specific input port, if any
    pub fn connection_to(&self, port_id: PortId) -> Option<&Connection> {
        self.connections.values().find(|c| c.to_port == port_id)
    }

    /// Get connections involving a node
    pub fn connections_for_node(&self, node_id: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections
            .values()
            .filter(move |c| c.involves_node(node_id))
    }

    /// Get the number of connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Set an interface value through its hook pipeline, then fire
    /// [`GraphEvents::value_changed`] if the value was stored.
    ///
    /// Returns `None` when the node or port does not exist.
    pub fn set_value(&mut self, node_id: NodeId, port_id: PortId, value: Value) -> Option<SetOutcome> {
        let (outcome, stored) = {
            let node = self.nodes.get_mut(&node_id)?;
            let port = node.port_mut(port_id)?;
            let outcome = port.set_value(value);
            (outcome, port.value().clone())
        };
        if outcome == SetOutcome::Stored {
            self.events.value_changed.emit(&ValueChange {
                node: node_id,
                port: port_id,
                value: stored,
            });
        }
        Some(outcome)
    }

    /// Write a computed value directly, bypassing the port's hook pipeline
    /// and the `value_changed` event. Engine and loader use.
    pub(crate) fn store_value(&mut self, node_id: NodeId, port_id: PortId, value: Value) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            if let Some(port) = node.port_mut(port_id) {
                port.store_value(value);
            }
        }
    }

    /// Add an interface to a live node (dynamic port count)
    pub fn add_interface(&mut self, node_id: NodeId, port: Port) -> Option<PortId> {
        let port_id = port.id;
        {
            let node = self.nodes.get_mut(&node_id)?;
            match port.direction {
                PortDirection::Input => node.inputs.push(port),
                PortDirection::Output => node.outputs.push(port),
            }
        }
        self.touch();
        self.events.interface_added.emit(&(node_id, port_id));
        Some(port_id)
    }

    /// Remove an interface from a live node, destructing its live connections
    /// first
    pub fn remove_interface(&mut self, node_id: NodeId, port_id: PortId) -> Option<Port> {
        self.nodes.get(&node_id)?.port(port_id)?;

        let touching: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.involves_port(port_id))
            .map(|c| c.id)
            .collect();
        for connection_id in touching {
            self.disconnect(connection_id);
        }

        let port = {
            let node = self.nodes.get_mut(&node_id)?;
            if let Some(pos) = node.inputs.iter().position(|p| p.id == port_id) {
                Some(node.inputs.remove(pos))
            } else {
                node.outputs
                    .iter()
                    .position(|p| p.id == port_id)
                    .map(|pos| node.outputs.remove(pos))
            }
        }?;
        self.touch();
        self.events.interface_removed.emit(&(node_id, port_id));
        Some(port)
    }

    pub(crate) fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new("Untitled")
    }
}

/// A node insert collided with an existing node id
#[derive(Debug, Clone, thiserror::Error)]
#[error("duplicate node id: {0:?}")]
pub struct DuplicateIdError(pub NodeId);

/// Error when creating a connection; the graph is left unchanged
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidConnectionError {
    /// Node not found
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),

    /// Port not found
    #[error("port not found: {0:?}")]
    PortNotFound(PortId),

    /// Both endpoints belong to the same node
    #[error("cannot connect a node to itself")]
    SameNode,

    /// Endpoints are not an output feeding an input
    #[error("connection endpoints must be an output and an input")]
    BadDirection,

    /// A value-only interface was used as an endpoint
    #[error("interface does not accept connections: {0:?}")]
    NotConnectable(PortId),

    /// The destination input already has an incoming connection
    #[error("input already has an incoming connection: {0:?}")]
    AlreadyConnected(PortId),
}
