//! Mermaid flowchart generation for wired node graphs.

use std::collections::{HashMap, VecDeque};

use crate::flow::Flow;
use crate::node::Node;

/// Render the flow's wired graph as a Mermaid `flowchart TD` document.
///
/// Nodes are labelled with their display names and edges with their action
/// strings. Cycles and shared successors are handled by walking each node
/// once; output is deterministic for a given graph.
pub fn mermaid(flow: &Flow) -> String {
    let mut ids: HashMap<usize, String> = HashMap::new();
    let mut order: Vec<Node> = Vec::new();

    let mut queue = VecDeque::new();
    queue.push_back(flow.start().clone());
    while let Some(node) = queue.pop_front() {
        if ids.contains_key(&node.ptr_id()) {
            continue;
        }
        ids.insert(node.ptr_id(), format!("n{}", order.len()));
        for (_, next) in node.successors() {
            if !ids.contains_key(&next.ptr_id()) {
                queue.push_back(next);
            }
        }
        order.push(node);
    }

    let mut lines = vec!["flowchart TD".to_string()];
    for node in &order {
        if let Some(id) = ids.get(&node.ptr_id()) {
            lines.push(format!("    {id}[\"{}\"]", node.name()));
        }
    }
    for node in &order {
        let Some(from) = ids.get(&node.ptr_id()) else {
            continue;
        };
        for (action, next) in node.successors() {
            if let Some(to) = ids.get(&next.ptr_id()) {
                lines.push(format!("    {from} -->|{action}| {to}"));
            }
        }
    }
    lines.join("\n")
}
