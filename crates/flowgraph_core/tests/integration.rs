// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end engine scenarios: execution, conversion, failure isolation,
//! supersession, and subgraph templates.

use flowgraph_core::engine::{Engine, EngineError, NodeRunError};
use flowgraph_core::node::{
    CalculateFn, CalculationInputs, ComputeError, NodeDefinition, NodeRegistry, PortSpec,
    PortValues,
};
use flowgraph_core::state;
use flowgraph_core::template::{self, TemplateRegistry};
use flowgraph_core::{Calculate, Graph, TypeRegistry};
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;

fn outputs_of(pairs: &[(&str, serde_json::Value)]) -> PortValues {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}

struct AsyncDouble;

impl Calculate for AsyncDouble {
    fn calculate(&self, inputs: CalculationInputs) -> BoxFuture<'static, Result<PortValues, ComputeError>> {
        Box::pin(async move {
            // Suspend cooperatively before producing the result.
            tokio::task::yield_now().await;
            let x = inputs.number("x")?;
            Ok(outputs_of(&[("y", json!(x * 2.0))]))
        })
    }
}

fn test_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register(
        NodeDefinition::new(
            "add",
            "Add",
            Arc::new(CalculateFn(|inputs: CalculationInputs| {
                let sum = inputs.number("a")? + inputs.number("b")?;
                Ok(outputs_of(&[("sum", json!(sum))]))
            })),
        )
        .with_input(PortSpec::new("a", "number").with_default(json!(0)))
        .with_input(PortSpec::new("b", "number").with_default(json!(0)))
        .with_output(PortSpec::new("sum", "number")),
    );
    registry.register(
        NodeDefinition::new("double", "Double", Arc::new(AsyncDouble))
            .with_input(PortSpec::new("x", "number").with_default(json!(0)))
            .with_output(PortSpec::new("y", "number")),
    );
    registry.register(
        NodeDefinition::new(
            "stringify",
            "Stringify",
            Arc::new(CalculateFn(|inputs: CalculationInputs| {
                let text = inputs
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(outputs_of(&[("text", json!(text))]))
            })),
        )
        .with_input(PortSpec::new("text", "string"))
        .with_output(PortSpec::new("text", "string")),
    );
    registry.register(
        NodeDefinition::new(
            "fail",
            "Fail",
            Arc::new(CalculateFn(|_: CalculationInputs| {
                Err(ComputeError::new("intentional failure"))
            })),
        )
        .with_input(PortSpec::new("in", "number"))
        .with_output(PortSpec::new("out", "number")),
    );
    registry
}

fn number_types() -> TypeRegistry {
    let mut types = TypeRegistry::new();
    types.add_type("number", [80, 200, 80]);
    types.add_type("string", [200, 180, 150]);
    types
}

#[tokio::test]
async fn add_then_double_computes_ten() {
    let registry = test_registry();
    let types = number_types();
    let mut graph = Graph::new("math");

    let add = graph.add_node(registry.instantiate("add").unwrap()).unwrap();
    let double = graph
        .add_node(registry.instantiate("double").unwrap())
        .unwrap();

    let a = graph.node(add).unwrap().input_named("a").unwrap().id;
    let b = graph.node(add).unwrap().input_named("b").unwrap().id;
    let sum = graph.node(add).unwrap().output_named("sum").unwrap().id;
    let x = graph.node(double).unwrap().input_named("x").unwrap().id;
    graph.connect(add, sum, double, x).unwrap();
    graph.set_value(add, a, json!(2)).unwrap();
    graph.set_value(add, b, json!(3)).unwrap();

    let mut engine = Engine::new();
    let result = engine.run(&mut graph, &registry, &types).await.unwrap();

    assert_eq!(result.output(double, "y"), Some(&json!(10.0)));
    assert!(result.errors.is_empty());
    // Diagnostics expose the order that was used.
    let order = engine.last_order().unwrap();
    assert!(order.iter().position(|&n| n == add) < order.iter().position(|&n| n == double));
}

#[tokio::test]
async fn values_convert_across_mismatched_connection() {
    let registry = test_registry();
    let mut types = number_types();
    types
        .add_conversion("number", "string", |v| json!(v.to_string()))
        .unwrap();

    let mut graph = Graph::new("convert");
    let add = graph.add_node(registry.instantiate("add").unwrap()).unwrap();
    let stringify = graph
        .add_node(registry.instantiate("stringify").unwrap())
        .unwrap();

    let a = graph.node(add).unwrap().input_named("a").unwrap().id;
    let sum = graph.node(add).unwrap().output_named("sum").unwrap().id;
    let text_in = graph
        .node(stringify)
        .unwrap()
        .input_named("text")
        .unwrap()
        .id;
    graph.connect(add, sum, stringify, text_in).unwrap();
    graph.set_value(add, a, json!(4)).unwrap();

    let mut engine = Engine::new();
    let result = engine.run(&mut graph, &registry, &types).await.unwrap();

    assert_eq!(result.output(stringify, "text"), Some(&json!("4.0")));
}

#[tokio::test]
async fn unconvertible_connection_aborts_but_keeps_partial_results() {
    let registry = test_registry();
    let types = number_types(); // no number -> string conversion registered

    let mut graph = Graph::new("convert");
    let add = graph.add_node(registry.instantiate("add").unwrap()).unwrap();
    let stringify = graph
        .add_node(registry.instantiate("stringify").unwrap())
        .unwrap();

    let sum = graph.node(add).unwrap().output_named("sum").unwrap().id;
    let text_in = graph
        .node(stringify)
        .unwrap()
        .input_named("text")
        .unwrap()
        .id;
    graph.connect(add, sum, stringify, text_in).unwrap();

    let mut engine = Engine::new();
    let err = engine.run(&mut graph, &registry, &types).await.unwrap_err();
    assert!(matches!(err, EngineError::NoConversion(_)));

    // The Add node had already executed; its output is retained.
    assert_eq!(
        graph.node(add).unwrap().output_named("sum").unwrap().value(),
        &json!(0.0)
    );
}

#[tokio::test]
async fn failed_node_skips_dependents_but_not_siblings() {
    let registry = test_registry();
    let types = number_types();
    let mut graph = Graph::new("branches");

    let fail = graph.add_node(registry.instantiate("fail").unwrap()).unwrap();
    let downstream = graph
        .add_node(registry.instantiate("double").unwrap())
        .unwrap();
    let independent = graph
        .add_node(registry.instantiate("add").unwrap())
        .unwrap();

    let fail_out = graph.node(fail).unwrap().output_named("out").unwrap().id;
    let x = graph.node(downstream).unwrap().input_named("x").unwrap().id;
    graph.connect(fail, fail_out, downstream, x).unwrap();

    let mut engine = Engine::new();
    let result = engine.run(&mut graph, &registry, &types).await.unwrap();

    assert!(matches!(
        result.errors.get(&fail),
        Some(NodeRunError::Failed(_))
    ));
    assert!(matches!(
        result.errors.get(&downstream),
        Some(NodeRunError::Skipped)
    ));
    assert!(result.outputs.contains_key(&independent));
}

#[tokio::test]
async fn superseded_run_stops_writing_and_quiescence_reruns() {
    let registry = test_registry();
    let types = number_types();
    let mut graph = Graph::new("supersede");
    let add = graph.add_node(registry.instantiate("add").unwrap()).unwrap();

    let mut engine = Engine::new();

    // A request arriving mid-run supersedes it before its next write.
    let requester = engine.requester();
    let sub = engine.events.node_computed.subscribe(move |_| {
        requester.request();
    });
    // The tap fires after the write of the first computed node; with a single
    // node the run completes but stays dirty.
    let result = engine.run(&mut graph, &registry, &types).await.unwrap();
    assert_eq!(result.token, 1);
    assert!(engine.needs_run());
    sub.unsubscribe();

    // Quiescence loops until no request is pending; the final result carries
    // a newer token.
    let result = engine
        .run_to_quiescence(&mut graph, &registry, &types)
        .await
        .unwrap();
    assert!(result.token > 1);
    assert!(!engine.needs_run());
    assert!(result.outputs.contains_key(&add));
}

#[tokio::test]
async fn mid_run_request_abandons_before_next_write() {
    let registry = test_registry();
    let types = number_types();
    let mut graph = Graph::new("supersede");

    // Two-node chain: a request fired after the first node computes must
    // abandon the run before the second node's write.
    let add = graph.add_node(registry.instantiate("add").unwrap()).unwrap();
    let double = graph
        .add_node(registry.instantiate("double").unwrap())
        .unwrap();
    let a = graph.node(add).unwrap().input_named("a").unwrap().id;
    let b = graph.node(add).unwrap().input_named("b").unwrap().id;
    let sum = graph.node(add).unwrap().output_named("sum").unwrap().id;
    let x = graph.node(double).unwrap().input_named("x").unwrap().id;
    graph.connect(add, sum, double, x).unwrap();
    graph.set_value(add, a, json!(2)).unwrap();
    graph.set_value(add, b, json!(3)).unwrap();

    let mut engine = Engine::new();
    let requester = engine.requester();
    let sub = engine.events.node_computed.subscribe(move |_| {
        requester.request();
    });

    let err = engine.run(&mut graph, &registry, &types).await.unwrap_err();
    assert!(matches!(err, EngineError::Superseded { .. }));
    // The abandoned run never wrote the second node's output.
    assert_eq!(
        graph.node(double).unwrap().output_named("y").unwrap().value(),
        &json!(null)
    );

    sub.unsubscribe();
    let result = engine
        .run_to_quiescence(&mut graph, &registry, &types)
        .await
        .unwrap();
    assert_eq!(result.output(double, "y"), Some(&json!(10.0)));
}

#[tokio::test]
async fn recalculate_on_change_marks_engine_dirty() {
    let registry = test_registry();
    let types = number_types();
    let mut graph = Graph::new("auto");
    let add = graph.add_node(registry.instantiate("add").unwrap()).unwrap();
    let a = graph.node(add).unwrap().input_named("a").unwrap().id;

    let mut engine = Engine::new();
    engine.recalculate_on_change(&graph, true);
    assert!(!engine.needs_run());

    graph.set_value(add, a, json!(5)).unwrap();
    assert!(engine.needs_run());

    let result = engine
        .run_to_quiescence(&mut graph, &registry, &types)
        .await
        .unwrap();
    assert_eq!(result.output(add, "sum"), Some(&json!(5.0)));

    // Disabling stops marking.
    engine.recalculate_on_change(&graph, false);
    graph.set_value(add, a, json!(6)).unwrap();
    assert!(!engine.needs_run());
}

#[tokio::test]
async fn subgraph_template_computes_like_a_node() {
    let registry_base = test_registry();
    let types = number_types();

    // Template body: a single Add node; expose its a/b inputs and sum output.
    let mut body = Graph::new("adder body");
    let inner_add = body
        .add_node(registry_base.instantiate("add").unwrap())
        .unwrap();
    let inner_a = body.node(inner_add).unwrap().input_named("a").unwrap().id;
    let inner_b = body.node(inner_add).unwrap().input_named("b").unwrap().id;
    let inner_sum = body
        .node(inner_add)
        .unwrap()
        .output_named("sum")
        .unwrap()
        .id;

    let tmpl = template::template_from_graph(
        "adder",
        "Adder",
        &body,
        vec![("a".to_string(), inner_a), ("b".to_string(), inner_b)],
        vec![("sum".to_string(), inner_sum)],
    );
    let mut templates = TemplateRegistry::new();
    templates.register(tmpl);

    let mut registry = registry_base.clone();
    template::register_template(&mut registry, &templates, &types, "adder").unwrap();

    // Use the subgraph node in a root graph, feeding its output onward.
    let mut graph = Graph::new("root");
    let adder = template::instantiate_template(&mut graph, &templates, &registry, "adder").unwrap();
    let double = graph
        .add_node(registry.instantiate("double").unwrap())
        .unwrap();

    let a = graph.node(adder).unwrap().input_named("a").unwrap().id;
    let b = graph.node(adder).unwrap().input_named("b").unwrap().id;
    let sum = graph.node(adder).unwrap().output_named("sum").unwrap().id;
    let x = graph.node(double).unwrap().input_named("x").unwrap().id;
    graph.connect(adder, sum, double, x).unwrap();
    graph.set_value(adder, a, json!(2)).unwrap();
    graph.set_value(adder, b, json!(3)).unwrap();

    let mut engine = Engine::new();
    let result = engine.run(&mut graph, &registry, &types).await.unwrap();

    assert_eq!(result.output(adder, "sum"), Some(&json!(5.0)));
    assert_eq!(result.output(double, "y"), Some(&json!(10.0)));
}

#[tokio::test]
async fn saved_graph_runs_identically_after_load() {
    let registry = test_registry();
    let types = number_types();
    let mut graph = Graph::new("persisted");

    let add = graph.add_node(registry.instantiate("add").unwrap()).unwrap();
    let double = graph
        .add_node(registry.instantiate("double").unwrap())
        .unwrap();
    let a = graph.node(add).unwrap().input_named("a").unwrap().id;
    let b = graph.node(add).unwrap().input_named("b").unwrap().id;
    let sum = graph.node(add).unwrap().output_named("sum").unwrap().id;
    let x = graph.node(double).unwrap().input_named("x").unwrap().id;
    let conn = graph.connect(add, sum, double, x).unwrap();
    graph.set_value(add, a, json!(2)).unwrap();
    graph.set_value(add, b, json!(3)).unwrap();

    let saved = state::save(&graph);
    let mut restored = state::load(&saved, &registry).unwrap();

    assert_eq!(restored.node(add).unwrap().input_named("a").unwrap().id, a);
    assert!(restored.connection(conn).is_some());

    let mut engine = Engine::new();
    let result = engine.run(&mut restored, &registry, &types).await.unwrap();
    assert_eq!(result.output(double, "y"), Some(&json!(10.0)));
}
