//! Serialized form of the call graph.
//!
//! Nodes are stored as a flat vec sorted by name; edges reference nodes by
//! index position. Sorting makes the encoding independent of the order in
//! which rechecks inserted nodes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{CallGraph, EdgeKind, GraphNode};

#[derive(Serialize, Deserialize)]
pub(super) struct SerializableGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<(u32, u32, EdgeKind)>,
}

impl From<CallGraph> for SerializableGraph {
    fn from(graph: CallGraph) -> Self {
        let nodes: Vec<GraphNode> = graph.nodes().into_iter().cloned().collect();
        let position: HashMap<&str, u32> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.name.as_str(), i as u32))
            .collect();

        let edges = graph
            .edges()
            .into_iter()
            .filter_map(|(from, to, kind)| {
                Some((*position.get(from.as_str())?, *position.get(to.as_str())?, kind))
            })
            .collect();

        SerializableGraph { nodes, edges }
    }
}

impl From<SerializableGraph> for CallGraph {
    fn from(sg: SerializableGraph) -> Self {
        let mut graph = CallGraph::new();
        for node in &sg.nodes {
            graph.add_node(&node.name, &node.module, node.kind);
        }
        for (src, dst, kind) in sg.edges {
            let (Some(from), Some(to)) = (sg.nodes.get(src as usize), sg.nodes.get(dst as usize))
            else {
                continue;
            };
            graph.add_edge(&from.name, &to.name, kind);
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;

    #[test]
    fn test_bincode_preserves_graph() {
        let mut graph = CallGraph::new();
        graph.add_node("m", "m", NodeKind::Module);
        graph.add_node("m.run", "m", NodeKind::Function);
        graph.add_node("m.Base", "m", NodeKind::Class);
        graph.add_node("m.Base.go", "m", NodeKind::Method);
        graph.add_node("m.Child", "m", NodeKind::Class);
        graph.add_node("m.Child.go", "m", NodeKind::Method);
        graph.add_edge("m", "m.run", EdgeKind::Calls);
        graph.add_edge("m.Child", "m.Base", EdgeKind::Inherits);
        graph.add_edge("m.Child.go", "m.Base.go", EdgeKind::Overrides);

        let bytes = bincode::serialize(&graph).unwrap();
        let loaded: CallGraph = bincode::deserialize(&bytes).unwrap();

        assert_eq!(loaded, graph);
        assert_eq!(loaded.overridden("m.Child.go"), vec!["m.Base.go"]);
        assert_eq!(loaded.callers("m.run"), vec!["m"]);
    }

    #[test]
    fn test_encoding_is_order_independent() {
        let mut first = CallGraph::new();
        first.add_node("x.a", "x", NodeKind::Function);
        first.add_node("x.b", "x", NodeKind::Function);
        first.add_edge("x.a", "x.b", EdgeKind::Calls);

        let mut second = CallGraph::new();
        second.add_node("x.b", "x", NodeKind::Function);
        second.add_node("x.a", "x", NodeKind::Function);
        second.add_edge("x.a", "x.b", EdgeKind::Calls);

        assert_eq!(
            bincode::serialize(&first).unwrap(),
            bincode::serialize(&second).unwrap()
        );
    }
}
