//! Tests for Mermaid graph rendering.

use nanoflow::error::Result;
use nanoflow::{Flow, Node, NodeLogic, NodeOptions, visualize};
use serde_json::Value;

struct Step;

impl NodeLogic for Step {
    fn exec(&self, _prep: &Value) -> Result<Value> {
        Ok(Value::Null)
    }
}

fn named(name: &str) -> Node {
    Node::with_options(
        Step,
        NodeOptions {
            name: Some(name.to_string()),
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn linear_graph_renders_nodes_and_labelled_edges() {
    let a = named("Extract");
    let b = named("Transform");
    let c = named("Load");
    a.then("default", &b);
    b.then("default", &c);

    let diagram = visualize::mermaid(&Flow::new(&a));

    assert!(diagram.starts_with("flowchart TD"));
    assert!(diagram.contains("n0[\"Extract\"]"));
    assert!(diagram.contains("[\"Transform\"]"));
    assert!(diagram.contains("[\"Load\"]"));
    assert!(diagram.contains("-->|default|"));
}

#[test]
fn branches_keep_their_action_labels() {
    let a = named("Check");
    let b = named("Happy");
    let c = named("Fallback");
    a.then("ok", &b).then("*", &c);

    let diagram = visualize::mermaid(&Flow::new(&a));

    assert!(diagram.contains("-->|ok|"));
    assert!(diagram.contains("-->|*|"));
}

#[test]
fn cycles_are_walked_once() {
    let a = named("Ping");
    let b = named("Pong");
    a.then("default", &b);
    b.then("default", &a);

    let diagram = visualize::mermaid(&Flow::new(&a));

    assert_eq!(diagram.matches("[\"Ping\"]").count(), 1);
    assert_eq!(diagram.matches("[\"Pong\"]").count(), 1);
    // Both directions of the cycle appear as edges.
    assert_eq!(diagram.matches("-->|default|").count(), 2);
}

#[test]
fn shared_successor_gets_a_single_definition() {
    let a = named("Start");
    let b = named("Left");
    let c = named("Right");
    let d = named("Join");
    a.then("left", &b).then("right", &c);
    b.then("default", &d);
    c.then("default", &d);

    let diagram = visualize::mermaid(&Flow::new(&a));

    assert_eq!(diagram.matches("[\"Join\"]").count(), 1);
    assert_eq!(diagram.matches("-->|default|").count(), 2);
}
