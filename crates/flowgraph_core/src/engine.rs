// SPDX-License-Identifier: MIT OR Apache-2.0
//! Calculation engine: topological ordering, cycle detection, and async
//! execution of node computations over a graph.
//!
//! The engine's loop is the sole scheduler: it awaits each node's computation
//! before any dependent becomes eligible, so producer outputs are fully
//! visible before consumers run. Supersession policy is queue-and-coalesce:
//! [`Engine::request_run`] marks the engine dirty, an in-flight run stops
//! writing once superseded, and [`Engine::run_to_quiescence`] reruns until no
//! request is pending. A superseded run never overwrites results of a newer
//! one because every write is guarded by the run token check.

use crate::graph::Graph;
use crate::hooks::{Hook, Subscription};
use crate::node::{CalculationInputs, ComputeError, NodeId, NodeRegistry, PortValues};
use crate::port::PortId;
use crate::types::{NoConversionError, TypeRegistry};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run in progress
    Idle,
    /// Computing or validating the execution order
    Ordering,
    /// Executing node computations
    Executing,
    /// The last run aborted with a structural error
    Failed,
}

/// Computation lifecycle hooks published for the presentation layer
#[derive(Debug, Clone, Default)]
pub struct EngineEvents {
    /// A run started; carries the run token
    pub run_started: Hook<u64>,
    /// A node finished computing; carries (node, run token)
    pub node_computed: Hook<(NodeId, u64)>,
    /// A run finished; carries the run token
    pub run_finished: Hook<u64>,
    /// A run failed with a structural error; carries the run token
    pub run_failed: Hook<u64>,
}

/// Handle for requesting a recalculation from outside the engine (or from a
/// hook tap). Cloneable and cheap.
#[derive(Debug, Clone)]
pub struct RunRequest {
    counter: Arc<AtomicU64>,
}

impl RunRequest {
    /// Mark the engine dirty: the current run (if any) becomes stale and
    /// [`Engine::needs_run`] turns true.
    pub fn request(&self) {
        self.counter.fetch_add(1, AtomicOrdering::SeqCst);
    }
}

/// Per-node outcome recorded when a computation did not produce outputs
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeRunError {
    /// The node's own computation failed
    #[error(transparent)]
    Failed(#[from] ComputeError),

    /// An upstream dependency failed, so this node was not computed
    #[error("skipped: an upstream node failed")]
    Skipped,

    /// The node's type tag has no registered computation
    #[error("no registered computation for type '{0}'")]
    UnknownNodeType(String),
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Monotonically increasing run token
    pub token: u64,
    /// Output port values per computed node
    pub outputs: IndexMap<NodeId, PortValues>,
    /// Nodes that failed or were skipped
    pub errors: IndexMap<NodeId, NodeRunError>,
    /// The execution order used
    pub order: Vec<NodeId>,
}

impl RunResult {
    /// Get one output value by node and output port name
    pub fn output(&self, node: NodeId, name: &str) -> Option<&Value> {
        self.outputs.get(&node)?.get(name)
    }
}

/// Run-level failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The graph contains a connection cycle
    #[error(transparent)]
    Cyclic(#[from] CyclicGraphError),

    /// A value crossed a connection between unconvertible types. Results of
    /// already-executed nodes are retained in the graph.
    #[error(transparent)]
    NoConversion(#[from] NoConversionError),

    /// A newer run was requested; this run stopped before its next write
    #[error("run {token} was superseded by a newer request")]
    Superseded {
        /// Token of the abandoned run
        token: u64,
    },
}

/// Topological ordering is impossible; one implicated edge is reported
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("graph contains a cycle through connection {from:?} -> {to:?}")]
pub struct CyclicGraphError {
    /// Producer end of an edge on the cycle
    pub from: NodeId,
    /// Consumer end of an edge on the cycle
    pub to: NodeId,
}

struct OrderCache {
    version: u64,
    order: Vec<NodeId>,
}

/// The calculation engine.
///
/// Owns the cached execution order (invalidated by the graph's structure
/// version), the run token counter, and the computation lifecycle hooks.
pub struct Engine {
    state: EngineState,
    order_cache: Option<OrderCache>,
    run_counter: u64,
    pending: Arc<AtomicU64>,
    served: u64,
    auto_recalculate: Option<Subscription>,
    /// Computation lifecycle hooks
    pub events: EngineEvents,
}

impl Engine {
    /// Create a new idle engine
    pub fn new() -> Self {
        Self {
            state: EngineState::Idle,
            order_cache: None,
            run_counter: 0,
            pending: Arc::new(AtomicU64::new(0)),
            served: 0,
            auto_recalculate: None,
            events: EngineEvents::default(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The last computed execution order, for diagnostics
    pub fn last_order(&self) -> Option<&[NodeId]> {
        self.order_cache.as_ref().map(|c| c.order.as_slice())
    }

    /// Request a recalculation; see the module docs for the supersession
    /// policy
    pub fn request_run(&self) {
        self.pending.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// A cloneable handle for requesting recalculation from hook taps
    pub fn requester(&self) -> RunRequest {
        RunRequest {
            counter: Arc::clone(&self.pending),
        }
    }

    /// Whether a run has been requested since the last one started
    pub fn needs_run(&self) -> bool {
        self.pending.load(AtomicOrdering::SeqCst) > self.served
    }

    /// Toggle automatic recalculation: when enabled, every stored value
    /// change on `graph` requests a run. The request only marks the engine
    /// dirty; the host drives execution via [`run`](Self::run) or
    /// [`run_to_quiescence`](Self::run_to_quiescence).
    pub fn recalculate_on_change(&mut self, graph: &Graph, enabled: bool) {
        if enabled {
            let requester = self.requester();
            let subscription = graph
                .events
                .value_changed
                .subscribe(move |_| requester.request());
            if let Some(old) = self.auto_recalculate.replace(subscription) {
                old.unsubscribe();
            }
        } else if let Some(subscription) = self.auto_recalculate.take() {
            subscription.unsubscribe();
        }
    }

    /// Compute (or fetch from cache) the execution order for `graph`.
    ///
    /// The cache is keyed on the graph's structure version; any structural
    /// change invalidates it and forces recomputation here.
    pub fn order(&mut self, graph: &Graph) -> Result<&[NodeId], CyclicGraphError> {
        self.ensure_order(graph)?;
        Ok(self
            .order_cache
            .as_ref()
            .map(|c| c.order.as_slice())
            .unwrap_or_default())
    }

    fn ensure_order(&mut self, graph: &Graph) -> Result<(), CyclicGraphError> {
        if let Some(cache) = &self.order_cache {
            if cache.version == graph.version() {
                tracing::debug!("using cached execution order ({} nodes)", cache.order.len());
                return Ok(());
            }
        }
        tracing::debug!("computing execution order for graph version {}", graph.version());
        match compute_order(graph) {
            Ok(order) => {
                self.order_cache = Some(OrderCache {
                    version: graph.version(),
                    order,
                });
                Ok(())
            }
            Err(e) => {
                self.order_cache = None;
                Err(e)
            }
        }
    }

    /// Execute the graph: compute the order, run every node's computation in
    /// that order, and propagate outputs across connections (converting
    /// through `types` where endpoint tags differ).
    ///
    /// Per-node computation failures are recorded in the result and skip the
    /// node's transitive dependents without aborting independent branches.
    /// Structural failures (`Cyclic`, `NoConversion`) abort the run.
    pub async fn run(
        &mut self,
        graph: &mut Graph,
        registry: &NodeRegistry,
        types: &TypeRegistry,
    ) -> Result<RunResult, EngineError> {
        self.run_counter += 1;
        let token = self.run_counter;
        let observed = self.pending.load(AtomicOrdering::SeqCst);
        self.served = observed;

        self.state = EngineState::Ordering;
        let order = match self.ensure_order(graph) {
            Ok(()) => self
                .order_cache
                .as_ref()
                .map(|c| c.order.clone())
                .unwrap_or_default(),
            Err(e) => {
                self.state = EngineState::Failed;
                self.events.run_failed.emit(&token);
                return Err(e.into());
            }
        };

        self.state = EngineState::Executing;
        self.events.run_started.emit(&token);
        tracing::info!("run {token}: executing {} nodes", order.len());

        let mut outputs: IndexMap<NodeId, PortValues> = IndexMap::new();
        let mut errors: IndexMap<NodeId, NodeRunError> = IndexMap::new();

        for &node_id in &order {
            let upstream_failed = graph
                .connections()
                .any(|c| c.to_node == node_id && errors.contains_key(&c.from_node));
            if upstream_failed {
                errors.insert(node_id, NodeRunError::Skipped);
                continue;
            }

            let Some(node) = graph.node(node_id) else {
                continue;
            };
            let Some(calculate) = registry.calculate_for(&node.type_tag) else {
                tracing::warn!(
                    "run {token}: node {node_id:?} has unregistered type '{}'",
                    node.type_tag
                );
                errors.insert(node_id, NodeRunError::UnknownNodeType(node.type_tag.clone()));
                continue;
            };

            let inputs = CalculationInputs {
                inputs: node
                    .inputs
                    .iter()
                    .map(|p| (p.name.clone(), p.value().clone()))
                    .collect(),
                options: node.options.clone(),
                state: node.state.clone(),
            };

            let computed = calculate.calculate(inputs).await;

            // Token guard: once a newer run is requested, this run must not
            // write anything further.
            if self.pending.load(AtomicOrdering::SeqCst) != observed {
                self.state = EngineState::Idle;
                tracing::debug!("run {token}: superseded, abandoning");
                return Err(EngineError::Superseded { token });
            }

            let values = match computed {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!("run {token}: node {node_id:?} failed: {e}");
                    errors.insert(node_id, NodeRunError::Failed(e));
                    continue;
                }
            };

            self.write_outputs(graph, node_id, &values, types, token)?;

            self.events.node_computed.emit(&(node_id, token));
            outputs.insert(node_id, values);
        }

        self.state = EngineState::Idle;
        self.events.run_finished.emit(&token);
        tracing::info!(
            "run {token}: finished, {} computed, {} failed or skipped",
            outputs.len(),
            errors.len()
        );
        Ok(RunResult {
            token,
            outputs,
            errors,
            order,
        })
    }

    /// Run repeatedly until no recalculation request is pending, coalescing
    /// queued requests into a single rerun. The supersession policy's outer
    /// loop.
    pub async fn run_to_quiescence(
        &mut self,
        graph: &mut Graph,
        registry: &NodeRegistry,
        types: &TypeRegistry,
    ) -> Result<RunResult, EngineError> {
        loop {
            match self.run(graph, registry, types).await {
                Err(EngineError::Superseded { .. }) => continue,
                Ok(_) if self.needs_run() => continue,
                other => return other,
            }
        }
    }

    /// Store computed output values on the node's ports and propagate them
    /// across outgoing connections, converting where endpoint tags differ.
    fn write_outputs(
        &mut self,
        graph: &mut Graph,
        node_id: NodeId,
        values: &PortValues,
        types: &TypeRegistry,
        token: u64,
    ) -> Result<(), EngineError> {
        if let Some(node) = graph.node_mut(node_id) {
            for (name, value) in values {
                match node.output_named_mut(name) {
                    Some(port) => port.store_value(value.clone()),
                    None => {
                        tracing::warn!(
                            "run {token}: node {node_id:?} produced unknown output '{name}'"
                        );
                    }
                }
            }
        }

        let mut writes: Vec<(NodeId, PortId, Value)> = Vec::new();
        if let Some(node) = graph.node(node_id) {
            for port in &node.outputs {
                for connection in graph.connections_from(port.id) {
                    let Some(dest) = graph
                        .node(connection.to_node)
                        .and_then(|n| n.port(connection.to_port))
                    else {
                        continue;
                    };
                    let converted = match types.convert(
                        &port.type_tag,
                        &dest.type_tag,
                        port.value().clone(),
                    ) {
                        Ok(value) => value,
                        Err(e) => {
                            self.state = EngineState::Failed;
                            self.events.run_failed.emit(&token);
                            return Err(e.into());
                        }
                    };
                    writes.push((connection.to_node, connection.to_port, converted));
                }
            }
        }
        for (to_node, to_port, value) in writes {
            graph.store_value(to_node, to_port, value);
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn compute_order(graph: &Graph) -> Result<Vec<NodeId>, CyclicGraphError> {
    let mut visited = HashSet::new();
    let mut in_progress = HashSet::new();
    let mut order = Vec::new();

    for node_id in graph.node_ids() {
        if !visited.contains(&node_id) {
            visit(graph, node_id, &mut visited, &mut in_progress, &mut order)?;
        }
    }
    Ok(order)
}

// Depth-first: visit every producer of a node before pushing the node, so
// the resulting order places producers before consumers.
fn visit(
    graph: &Graph,
    node_id: NodeId,
    visited: &mut HashSet<NodeId>,
    in_progress: &mut HashSet<NodeId>,
    order: &mut Vec<NodeId>,
) -> Result<(), CyclicGraphError> {
    if visited.contains(&node_id) {
        return Ok(());
    }
    in_progress.insert(node_id);

    for connection in graph.connections() {
        if connection.to_node != node_id {
            continue;
        }
        if in_progress.contains(&connection.from_node) {
            return Err(CyclicGraphError {
                from: connection.from_node,
                to: node_id,
            });
        }
        visit(graph, connection.from_node, visited, in_progress, order)?;
    }

    in_progress.remove(&node_id);
    visited.insert(node_id);
    order.push(node_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{CalculateFn, Node, NodeDefinition, PortSpec};
    use crate::port::Port;
    use serde_json::json;

    fn chain_node(name: &str) -> Node {
        Node {
            id: NodeId::new(),
            type_tag: "chain".to_string(),
            name: name.to_string(),
            inputs: vec![Port::input("in", "number")],
            outputs: vec![Port::output("out", "number")],
            options: IndexMap::new(),
            state: None,
        }
    }

    fn registry_with_chain() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register(
            NodeDefinition::new(
                "chain",
                "Chain",
                Arc::new(CalculateFn(|inputs: CalculationInputs| {
                    let mut out = PortValues::new();
                    out.insert("out".to_string(), inputs.get("in").cloned().unwrap_or(json!(0)));
                    Ok(out)
                })),
            )
            .with_input(PortSpec::new("in", "number"))
            .with_output(PortSpec::new("out", "number")),
        );
        registry
    }

    #[test]
    fn test_order_places_producers_first() {
        let mut graph = Graph::new("g");
        let a = graph.add_node(chain_node("a")).unwrap();
        let b = graph.add_node(chain_node("b")).unwrap();
        let c = graph.add_node(chain_node("c")).unwrap();
        // Insert edges against insertion order: c -> b -> a.
        let c_out = graph.node(c).unwrap().outputs[0].id;
        let b_in = graph.node(b).unwrap().inputs[0].id;
        let b_out = graph.node(b).unwrap().outputs[0].id;
        let a_in = graph.node(a).unwrap().inputs[0].id;
        graph.connect(c, c_out, b, b_in).unwrap();
        graph.connect(b, b_out, a, a_in).unwrap();

        let mut engine = Engine::new();
        let order = engine.order(&graph).unwrap().to_vec();

        let index = |id| order.iter().position(|&n| n == id).unwrap();
        for conn in graph.connections() {
            assert!(index(conn.from_node) < index(conn.to_node));
        }
    }

    #[test]
    fn test_cycle_reports_implicated_edge() {
        let mut graph = Graph::new("g");
        let x = graph.add_node(chain_node("x")).unwrap();
        let y = graph.add_node(chain_node("y")).unwrap();
        let x_out = graph.node(x).unwrap().outputs[0].id;
        let x_in = graph.node(x).unwrap().inputs[0].id;
        let y_out = graph.node(y).unwrap().outputs[0].id;
        let y_in = graph.node(y).unwrap().inputs[0].id;
        graph.connect(x, x_out, y, y_in).unwrap();
        graph.connect(y, y_out, x, x_in).unwrap();

        let mut engine = Engine::new();
        let err = engine.order(&graph).unwrap_err();
        assert!(err.from == x || err.from == y);
        assert!(graph
            .connections()
            .any(|c| c.from_node == err.from && c.to_node == err.to));
    }

    #[test]
    fn test_order_cache_invalidated_by_structural_change() {
        let mut graph = Graph::new("g");
        let a = graph.add_node(chain_node("a")).unwrap();
        let mut engine = Engine::new();
        assert_eq!(engine.order(&graph).unwrap().len(), 1);

        let b = graph.add_node(chain_node("b")).unwrap();
        let order = engine.order(&graph).unwrap();
        assert_eq!(order.len(), 2);
        assert!(order.contains(&a) && order.contains(&b));
    }

    #[tokio::test]
    async fn test_run_failure_enters_failed_state_on_cycle() {
        let mut graph = Graph::new("g");
        let x = graph.add_node(chain_node("x")).unwrap();
        let y = graph.add_node(chain_node("y")).unwrap();
        let x_out = graph.node(x).unwrap().outputs[0].id;
        let x_in = graph.node(x).unwrap().inputs[0].id;
        let y_out = graph.node(y).unwrap().outputs[0].id;
        let y_in = graph.node(y).unwrap().inputs[0].id;
        graph.connect(x, x_out, y, y_in).unwrap();
        graph.connect(y, y_out, x, x_in).unwrap();

        let mut engine = Engine::new();
        let registry = registry_with_chain();
        let types = TypeRegistry::new();
        let err = engine.run(&mut graph, &registry, &types).await.unwrap_err();
        assert!(matches!(err, EngineError::Cyclic(_)));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_unknown_node_type_recorded_per_node() {
        let mut graph = Graph::new("g");
        let a = graph.add_node(chain_node("a")).unwrap();
        let mut engine = Engine::new();
        let registry = NodeRegistry::new();
        let types = TypeRegistry::new();

        let result = engine.run(&mut graph, &registry, &types).await.unwrap();
        assert!(matches!(
            result.errors.get(&a),
            Some(NodeRunError::UnknownNodeType(tag)) if tag == "chain"
        ));
    }
}
