// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph templates: reusable subgraph blueprints instantiable as ordinary
//! nodes, with a recursion guard preventing self-embedding.

use crate::engine::Engine;
use crate::graph::{DuplicateIdError, Graph};
use crate::node::{
    Calculate, CalculationInputs, ComputeError, NodeDefinition, NodeId, NodeRegistry, PortSpec,
    PortValues,
};
use crate::port::PortId;
use crate::state::{self, GraphState, LoadError};
use crate::types::TypeRegistry;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// One designated interface of a template: the name exposed on the subgraph
/// node, and the inner port it maps to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInterface {
    /// Name exposed on the subgraph node
    pub name: String,
    /// The inner node's port this interface feeds or reads
    pub inner_port: PortId,
}

/// A serializable, named blueprint of a graph, instantiable as a node inside
/// another graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphTemplate {
    /// Type tag under which subgraph nodes of this template register
    pub type_tag: String,
    /// Display name
    pub name: String,
    /// The blueprint body
    pub body: GraphState,
    /// Designated inputs: fed with the subgraph node's input values
    pub inputs: Vec<TemplateInterface>,
    /// Designated outputs: read back as the subgraph node's output values
    pub outputs: Vec<TemplateInterface>,
}

/// Registry of templates by type tag
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: IndexMap<String, GraphTemplate>,
}

impl TemplateRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, overwriting any prior template with the same tag
    pub fn register(&mut self, template: GraphTemplate) {
        self.templates.insert(template.type_tag.clone(), template);
    }

    /// Get a template by tag
    pub fn get(&self, type_tag: &str) -> Option<&GraphTemplate> {
        self.templates.get(type_tag)
    }

    /// Get all registered templates
    pub fn templates(&self) -> impl Iterator<Item = &GraphTemplate> {
        self.templates.values()
    }
}

/// Whether instantiating `candidate_tag` inside `graph` would create a
/// self-embedding cycle.
///
/// A root graph (no owning template) can never recurse. A candidate equal to
/// the graph's own template tag is a direct self-reference. Otherwise every
/// subgraph node the candidate's body directly contains is checked
/// transitively. The visited set bounds the walk by the finite registry even
/// if a malformed template embeds itself.
pub fn check_recursion(templates: &TemplateRegistry, graph: &Graph, candidate_tag: &str) -> bool {
    let Some(owner_tag) = graph.template_tag() else {
        return false;
    };
    let mut visited = HashSet::new();
    check_recursion_inner(templates, owner_tag, candidate_tag, &mut visited)
}

fn check_recursion_inner<'a>(
    templates: &'a TemplateRegistry,
    owner_tag: &str,
    candidate_tag: &'a str,
    visited: &mut HashSet<&'a str>,
) -> bool {
    if candidate_tag == owner_tag {
        return true;
    }
    if !visited.insert(candidate_tag) {
        return false;
    }
    let Some(template) = templates.get(candidate_tag) else {
        return false;
    };
    template
        .body
        .nodes
        .iter()
        .filter(|record| templates.get(&record.type_tag).is_some())
        .any(|record| check_recursion_inner(templates, owner_tag, &record.type_tag, visited))
}

/// Computation of a subgraph node: builds a fresh inner graph from the
/// blueprint, feeds the designated inputs, runs a nested engine over it, and
/// reads out the designated outputs.
struct SubgraphCalculate {
    template: GraphTemplate,
    registry: NodeRegistry,
    types: TypeRegistry,
}

impl Calculate for SubgraphCalculate {
    fn calculate(&self, inputs: CalculationInputs) -> BoxFuture<'static, Result<PortValues, ComputeError>> {
        let template = self.template.clone();
        let registry = self.registry.clone();
        let types = self.types.clone();

        Box::pin(async move {
            let mut graph = state::load(&template.body, &registry)
                .map_err(|e| ComputeError::new(format!("subgraph load failed: {e}")))?;
            graph.set_template_tag(template.type_tag.clone());

            for interface in &template.inputs {
                let Some(value) = inputs.get(&interface.name) else {
                    continue;
                };
                let Some((node_id, _)) = graph.find_port(interface.inner_port) else {
                    return Err(ComputeError::new(format!(
                        "subgraph input '{}' does not resolve to a port",
                        interface.name
                    )));
                };
                graph.store_value(node_id, interface.inner_port, value.clone());
            }

            let mut engine = Engine::new();
            let result = engine
                .run(&mut graph, &registry, &types)
                .await
                .map_err(|e| ComputeError::new(format!("subgraph run failed: {e}")))?;
            if let Some((node_id, error)) = result.errors.first() {
                return Err(ComputeError::new(format!(
                    "subgraph node {node_id:?} failed: {error}"
                )));
            }

            let mut outputs = PortValues::new();
            for interface in &template.outputs {
                let value = graph
                    .find_port(interface.inner_port)
                    .map(|(_, port)| port.value().clone())
                    .ok_or_else(|| {
                        ComputeError::new(format!(
                            "subgraph output '{}' does not resolve to a port",
                            interface.name
                        ))
                    })?;
                outputs.insert(interface.name.clone(), value);
            }
            Ok(outputs)
        })
    }
}

/// Register a subgraph node definition for `template_tag` into `registry`.
///
/// The definition's ports mirror the template's designated inputs/outputs,
/// typed after the inner ports they map to. The subgraph computation
/// snapshots `registry` and `types`, so templates nested inside this one must
/// already be registered.
pub fn register_template(
    registry: &mut NodeRegistry,
    templates: &TemplateRegistry,
    types: &TypeRegistry,
    template_tag: &str,
) -> Result<(), TemplateError> {
    let template = templates
        .get(template_tag)
        .ok_or_else(|| TemplateError::UnknownTemplate(template_tag.to_string()))?;

    let mut definition = NodeDefinition::new(
        template.type_tag.clone(),
        template.name.clone(),
        Arc::new(SubgraphCalculate {
            template: template.clone(),
            registry: registry.clone(),
            types: types.clone(),
        }),
    );
    for interface in &template.inputs {
        let spec = interface_spec(template, registry, interface)?;
        definition = definition.with_input(spec);
    }
    for interface in &template.outputs {
        let spec = interface_spec(template, registry, interface)?;
        definition = definition.with_output(spec);
    }

    registry.register(definition);
    Ok(())
}

// Resolve a designated interface to a port spec by finding the inner node
// record that declares it and reading the type tag off the node definition.
fn interface_spec(
    template: &GraphTemplate,
    registry: &NodeRegistry,
    interface: &TemplateInterface,
) -> Result<PortSpec, TemplateError> {
    for record in &template.body.nodes {
        let Some(entry) = record.interfaces.iter().find(|i| i.id == interface.inner_port) else {
            continue;
        };
        let Some(definition) = registry.get(&record.type_tag) else {
            continue;
        };
        let type_tag = definition
            .inputs
            .iter()
            .chain(definition.outputs.iter())
            .find(|spec| spec.name == entry.name)
            .map(|spec| spec.type_tag.clone())
            .ok_or_else(|| TemplateError::BadInterface(interface.name.clone()))?;
        return Ok(PortSpec::new(interface.name.clone(), type_tag)
            .with_default(entry.value.clone()));
    }
    Err(TemplateError::BadInterface(interface.name.clone()))
}

/// Instantiate a template as a subgraph node inside `graph`, guarded against
/// self-embedding.
///
/// The subgraph node definition must already be registered via
/// [`register_template`].
pub fn instantiate_template(
    graph: &mut Graph,
    templates: &TemplateRegistry,
    registry: &NodeRegistry,
    template_tag: &str,
) -> Result<NodeId, TemplateError> {
    if check_recursion(templates, graph, template_tag) {
        return Err(RecursiveTemplateError {
            tag: template_tag.to_string(),
        }
        .into());
    }
    let node = registry
        .instantiate(template_tag)
        .ok_or_else(|| TemplateError::UnknownTemplate(template_tag.to_string()))?;
    Ok(graph.add_node(node)?)
}

/// A template would be embedded, directly or transitively, inside a graph
/// derived from itself
#[derive(Debug, Clone, thiserror::Error)]
#[error("template '{tag}' would recursively embed itself")]
pub struct RecursiveTemplateError {
    /// The offending template tag
    pub tag: String,
}

/// Error working with templates
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    /// Instantiation would self-embed
    #[error(transparent)]
    Recursive(#[from] RecursiveTemplateError),

    /// No template registered under the tag
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// A designated interface does not resolve to a port in the body
    #[error("template interface '{0}' does not resolve to a port in the body")]
    BadInterface(String),

    /// The generated subgraph node collided with an existing id
    #[error(transparent)]
    Duplicate(#[from] DuplicateIdError),

    /// The template body failed to load
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Convenience: build a template from a live graph, designating interfaces by
/// `(exposed name, inner port)` pairs.
pub fn template_from_graph(
    type_tag: impl Into<String>,
    name: impl Into<String>,
    graph: &Graph,
    inputs: Vec<(String, PortId)>,
    outputs: Vec<(String, PortId)>,
) -> GraphTemplate {
    GraphTemplate {
        type_tag: type_tag.into(),
        name: name.into(),
        body: state::save(graph),
        inputs: inputs
            .into_iter()
            .map(|(name, inner_port)| TemplateInterface { name, inner_port })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(name, inner_port)| TemplateInterface { name, inner_port })
            .collect(),
    }
}

/// Mark a graph as instantiated from a template (used when editing a
/// template's body as a live graph).
pub fn mark_graph_template(graph: &mut Graph, template_tag: impl Into<String>) {
    graph.set_template_tag(template_tag);
}
