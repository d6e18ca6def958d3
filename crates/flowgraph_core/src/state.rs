// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted graph state: the schema exchanged with the persistence
//! collaborator, and the save/load round trip.
//!
//! Saving then loading reconstructs identical node, interface and connection
//! ids; stored values are used as-is (conversions are not re-applied on
//! load).

use crate::connection::{Connection, ConnectionId};
use crate::graph::{DuplicateIdError, Graph};
use crate::node::{NodeId, NodeRegistry};
use crate::port::PortId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Saved state of one interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceRecord {
    /// Interface name within its node
    pub name: String,
    /// Interface ID
    pub id: PortId,
    /// Stored value
    pub value: Value,
}

/// Saved state of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node type tag
    pub type_tag: String,
    /// Display name
    pub name: String,
    /// Node ID
    pub id: NodeId,
    /// Interfaces in declaration order, inputs first
    pub interfaces: Vec<InterfaceRecord>,
    /// Named options
    pub options: Vec<(String, Value)>,
    /// Opaque custom state
    pub state: Option<Value>,
}

/// Saved state of one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Connection ID
    pub id: ConnectionId,
    /// Source interface ID
    pub from: PortId,
    /// Destination interface ID
    pub to: PortId,
}

/// Serializable snapshot of a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphState {
    /// Graph name
    pub name: String,
    /// Template this graph was instantiated from, if any
    pub template_tag: Option<String>,
    /// Node records in insertion order
    pub nodes: Vec<NodeRecord>,
    /// Connection records in insertion order
    pub connections: Vec<ConnectionRecord>,
}

/// Snapshot a graph into its persisted state
pub fn save(graph: &Graph) -> GraphState {
    GraphState {
        name: graph.name.clone(),
        template_tag: graph.template_tag().map(str::to_string),
        nodes: graph
            .nodes()
            .map(|node| NodeRecord {
                type_tag: node.type_tag.clone(),
                name: node.name.clone(),
                id: node.id,
                interfaces: node
                    .ports()
                    .map(|port| InterfaceRecord {
                        name: port.name.clone(),
                        id: port.id,
                        value: port.value().clone(),
                    })
                    .collect(),
                options: node
                    .options
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                state: node.state.clone(),
            })
            .collect(),
        connections: graph
            .connections()
            .map(|connection| ConnectionRecord {
                id: connection.id,
                from: connection.from_port,
                to: connection.to_port,
            })
            .collect(),
    }
}

/// Rebuild a graph from its persisted state.
///
/// Each node's ports are resolved from its registry definition, then
/// overridden with the record's interface ids and raw values. Connection
/// records are restored with their saved ids; a repeated connection id is
/// rejected.
pub fn load(state: &GraphState, registry: &NodeRegistry) -> Result<Graph, LoadError> {
    let mut graph = Graph::new(state.name.clone());
    if let Some(tag) = &state.template_tag {
        graph.set_template_tag(tag.clone());
    }

    for record in &state.nodes {
        let mut node = registry
            .instantiate(&record.type_tag)
            .ok_or_else(|| LoadError::UnknownNodeType(record.type_tag.clone()))?;
        node.id = record.id;
        node.name = record.name.clone();
        node.options = record.options.iter().cloned().collect();
        node.state = record.state.clone();

        for interface in &record.interfaces {
            let port = node
                .inputs
                .iter_mut()
                .chain(node.outputs.iter_mut())
                .find(|p| p.name == interface.name)
                .ok_or_else(|| LoadError::UnknownInterface {
                    node: record.id,
                    name: interface.name.clone(),
                })?;
            port.id = interface.id;
            // Stored values are used as-is; no re-conversion on load.
            port.store_value(interface.value.clone());
        }

        graph.add_node(node)?;
    }

    for record in &state.connections {
        if graph.connection(record.id).is_some() {
            return Err(LoadError::DuplicateConnection(record.id));
        }
        let (from_node, _) = graph
            .find_port(record.from)
            .ok_or(LoadError::DanglingConnection(record.id))?;
        let (to_node, _) = graph
            .find_port(record.to)
            .ok_or(LoadError::DanglingConnection(record.id))?;
        graph.insert_connection(Connection {
            id: record.id,
            from_node,
            from_port: record.from,
            to_node,
            to_port: record.to,
        });
    }

    Ok(graph)
}

/// Error while rebuilding a graph from persisted state
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// A node record's type tag has no registered definition
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    /// A node record names an interface its definition does not declare
    #[error("node {node:?} has no interface named '{name}'")]
    UnknownInterface {
        /// The node being restored
        node: NodeId,
        /// The unresolved interface name
        name: String,
    },

    /// Two node records share an id
    #[error(transparent)]
    Duplicate(#[from] DuplicateIdError),

    /// A connection record references an interface no node record declares
    #[error("connection {0:?} references an unknown interface")]
    DanglingConnection(ConnectionId),

    /// Two connection records share an id
    #[error("duplicate connection id: {0:?}")]
    DuplicateConnection(ConnectionId),
}
