//! Call and inheritance graph.
//!
//! Nodes are modules, classes, functions and methods, keyed by qualified
//! name. Edges record calls, class inheritance and method overrides. The
//! graph is rebuilt per module during rechecks, so nodes carry the module
//! that owns them.

mod persistence;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use persistence::SerializableGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Module,
    Class,
    Function,
    Method,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    Calls,
    Inherits,
    Overrides,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EdgeKind::Calls => "calls",
            EdgeKind::Inherits => "inherits",
            EdgeKind::Overrides => "overrides",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Qualified name (`pkg.mod.Class.method`).
    pub name: String,
    /// Module that defines this node.
    pub module: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "SerializableGraph", from = "SerializableGraph")]
pub struct CallGraph {
    graph: StableDiGraph<GraphNode, EdgeKind>,
    index: HashMap<String, NodeIndex>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, returning the existing one if the name is taken.
    pub fn add_node(&mut self, name: &str, module: &str, kind: NodeKind) -> NodeIndex {
        if let Some(idx) = self.index.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(GraphNode {
            name: name.to_string(),
            module: module.to_string(),
            kind,
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.index.get(name).and_then(|idx| self.graph.node_weight(*idx))
    }

    /// Connect two existing nodes. Duplicate edges are ignored.
    pub fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) -> bool {
        let (Some(&src), Some(&dst)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        let exists = self
            .graph
            .edges_directed(src, Direction::Outgoing)
            .any(|e| e.target() == dst && *e.weight() == kind);
        if !exists {
            self.graph.add_edge(src, dst, kind);
        }
        !exists
    }

    /// Drop every node owned by `module`, along with all edges touching them.
    pub fn remove_module(&mut self, module: &str) {
        let owned: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| self.graph[*idx].module == module)
            .collect();
        for idx in owned {
            if let Some(node) = self.graph.remove_node(idx) {
                self.index.remove(&node.name);
            }
        }
    }

    /// Drop the outgoing edges of every node owned by `module`.
    pub fn clear_outgoing(&mut self, module: &str) {
        let edges: Vec<_> = self
            .graph
            .node_indices()
            .filter(|idx| self.graph[*idx].module == module)
            .flat_map(|idx| {
                self.graph
                    .edges_directed(idx, Direction::Outgoing)
                    .map(|e| e.id())
                    .collect::<Vec<_>>()
            })
            .collect();
        for edge in edges {
            self.graph.remove_edge(edge);
        }
    }

    /// Functions and classes that `name` calls.
    pub fn callees(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, EdgeKind::Calls, Direction::Outgoing)
    }

    /// Functions and modules that call `name`.
    pub fn callers(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, EdgeKind::Calls, Direction::Incoming)
    }

    /// Methods overridden by `name`.
    pub fn overridden(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, EdgeKind::Overrides, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, kind: EdgeKind, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .graph
            .edges_directed(idx, direction)
            .filter(|e| *e.weight() == kind)
            .map(|e| {
                let other = match direction {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                self.graph[other].name.as_str()
            })
            .collect();
        names.sort_unstable();
        names
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Nodes sorted by name.
    pub fn nodes(&self) -> Vec<&GraphNode> {
        let mut nodes: Vec<&GraphNode> = self.graph.node_weights().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Edges as `(from, to, kind)`, sorted.
    pub fn edges(&self) -> Vec<(String, String, EdgeKind)> {
        let mut edges: Vec<(String, String, EdgeKind)> = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (src, dst) = self.graph.edge_endpoints(e)?;
                Some((
                    self.graph[src].name.clone(),
                    self.graph[dst].name.clone(),
                    self.graph[e],
                ))
            })
            .collect();
        edges.sort();
        edges
    }
}

/// Graphs are equal when they hold the same named nodes and edges,
/// regardless of insertion order.
impl PartialEq for CallGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes() == other.nodes() && self.edges() == other.edges()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CallGraph {
        let mut graph = CallGraph::new();
        graph.add_node("a", "a", NodeKind::Module);
        graph.add_node("a.main", "a", NodeKind::Function);
        graph.add_node("b.helper", "b", NodeKind::Function);
        graph.add_node("b.Base", "b", NodeKind::Class);
        graph.add_node("a.Child", "a", NodeKind::Class);
        graph.add_edge("a", "a.main", EdgeKind::Calls);
        graph.add_edge("a.main", "b.helper", EdgeKind::Calls);
        graph.add_edge("a.Child", "b.Base", EdgeKind::Inherits);
        graph
    }

    #[test]
    fn test_callers_and_callees() {
        let graph = sample();
        assert_eq!(graph.callees("a.main"), vec!["b.helper"]);
        assert_eq!(graph.callers("b.helper"), vec!["a.main"]);
        assert_eq!(graph.callers("a.main"), vec!["a"]);
        assert!(graph.callees("missing").is_empty());
    }

    #[test]
    fn test_duplicate_edges_ignored() {
        let mut graph = sample();
        assert!(!graph.add_edge("a.main", "b.helper", EdgeKind::Calls));
        assert_eq!(graph.edge_count(), 3);
        assert!(!graph.add_edge("a.main", "nowhere", EdgeKind::Calls));
    }

    #[test]
    fn test_remove_module_drops_incoming_edges() {
        let mut graph = sample();
        graph.remove_module("b");
        assert!(graph.node("b.helper").is_none());
        assert!(graph.callees("a.main").is_empty());
        assert_eq!(graph.edge_count(), 1);

        // Names can be re-added after removal.
        graph.add_node("b.helper", "b", NodeKind::Function);
        assert!(graph.add_edge("a.main", "b.helper", EdgeKind::Calls));
    }

    #[test]
    fn test_clear_outgoing_keeps_nodes() {
        let mut graph = sample();
        graph.clear_outgoing("a");
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.node_count(), 5);
    }

    #[test]
    fn test_equality_ignores_insertion_order() {
        let mut other = CallGraph::new();
        other.add_node("a.Child", "a", NodeKind::Class);
        other.add_node("b.Base", "b", NodeKind::Class);
        other.add_node("b.helper", "b", NodeKind::Function);
        other.add_node("a.main", "a", NodeKind::Function);
        other.add_node("a", "a", NodeKind::Module);
        other.add_edge("a.Child", "b.Base", EdgeKind::Inherits);
        other.add_edge("a.main", "b.helper", EdgeKind::Calls);
        other.add_edge("a", "a.main", EdgeKind::Calls);
        assert_eq!(sample(), other);

        other.add_edge("a", "b.helper", EdgeKind::Calls);
        assert_ne!(sample(), other);
    }
}
