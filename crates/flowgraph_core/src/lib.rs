// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dataflow graph engine.
//!
//! Models a directed graph of computation nodes connected by typed ports,
//! determines a valid execution order, executes node computations in that
//! order (awaiting asynchronous ones), converts values across
//! type-mismatched connections, and supports reusable subgraph templates
//! guarded against recursive embedding.
//!
//! ## Architecture
//!
//! - [`port`] / [`connection`]: typed interfaces and the edges between them
//! - [`types`]: interface type registry with registered value conversions
//! - [`hooks`]: ordered listener pipelines for lifecycle notification
//! - [`node`]: node instances, the [`Calculate`](node::Calculate) capability,
//!   and the registry of node types
//! - [`graph`]: the container enforcing structural invariants
//! - [`engine`]: topological ordering, cycle detection, async execution
//! - [`template`]: subgraph blueprints and the recursion guard
//! - [`state`]: the persisted graph state schema and save/load

pub mod connection;
pub mod engine;
pub mod graph;
pub mod hooks;
pub mod node;
pub mod port;
pub mod state;
pub mod template;
pub mod types;

pub use connection::{Connection, ConnectionId};
pub use engine::{Engine, EngineError, EngineState, RunResult};
pub use graph::{DuplicateIdError, Graph, InvalidConnectionError};
pub use node::{Calculate, CalculateFn, Node, NodeDefinition, NodeId, NodeRegistry, PortSpec};
pub use port::{Port, PortDirection, PortId};
pub use template::{check_recursion, GraphTemplate, TemplateRegistry};
pub use types::TypeRegistry;
