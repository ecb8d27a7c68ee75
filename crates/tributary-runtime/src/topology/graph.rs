//! Directed operator graph
//!
//! Nodes are never removed; the compiler rewrites a graph by adding
//! repartition nodes and moving edges. Edges keep insertion order, and a
//! moved edge goes to the back, so traversal order is a pure function of
//! the sequence of rewrites.

use crate::grouping::GroupFields;
use crate::operator::OperatorKind;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Index, IndexMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeIndex(pub usize);

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: OperatorKind,
    /// Zero until declared by the builder or assigned by the compiler.
    pub parallelism: u32,
    pub id: u32,
}

impl Node {
    pub fn name(&self) -> String {
        format!("{}_{}", self.kind.tag(), self.id)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = self.kind.description();
        if description.is_empty() {
            write!(f, "{}", self.name())
        } else {
            write!(f, "{}({})", self.name(), description)
        }
    }
}

/// Edge between two operators. `selector` limits the tuple names that
/// flow along it; grouped edges carry the key fields of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEdge {
    pub source: NodeIndex,
    pub target: NodeIndex,
    pub selector: Option<Vec<String>>,
    pub group_fields: Option<GroupFields>,
}

impl StreamEdge {
    pub fn new(source: NodeIndex, target: NodeIndex, selector: Option<Vec<String>>) -> Self {
        Self {
            source,
            target,
            selector,
            group_fields: None,
        }
    }

    pub fn grouped(mut self, group_fields: GroupFields) -> Self {
        self.group_fields = Some(group_fields);
        self
    }

    pub fn is_grouped(&self) -> bool {
        self.group_fields.is_some()
    }

    /// Same selector and grouping between other endpoints.
    pub fn redirect(&self, source: NodeIndex, target: NodeIndex) -> Self {
        Self {
            source,
            target,
            ..self.clone()
        }
    }
}

impl fmt::Display for StreamEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group_fields {
            Some(group_fields) => write!(f, "GS[{}]", group_fields)?,
            None => write!(f, "S")?,
        }
        if let Some(selector) = &self.selector {
            write!(f, "({})", selector.join(", "))?;
        }
        Ok(())
    }
}

/// Union of two selectors, first-seen order. An absent selector passes
/// every tuple, so it absorbs the other.
pub fn merge_selector(a: Option<&[String]>, b: Option<&[String]>) -> Option<Vec<String>> {
    let (a, b) = (a?, b?);
    let mut merged: Vec<String> = Vec::with_capacity(a.len() + b.len());
    for name in a.iter().chain(b) {
        if !merged.contains(name) {
            merged.push(name.clone());
        }
    }
    Some(merged)
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<StreamEdge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node whose id is its insertion index until the compiler
    /// renumbers it.
    pub fn add_node(&mut self, kind: OperatorKind, parallelism: u32) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parallelism,
            id: index.0 as u32,
        });
        index
    }

    /// Adds a copy of `node` that keeps its id and so its name.
    pub fn duplicate_node(&mut self, node: NodeIndex) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(self.nodes[node.0].clone());
        index
    }

    pub fn contains(&self, node: NodeIndex) -> bool {
        node.0 < self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> {
        (0..self.nodes.len()).map(NodeIndex)
    }

    pub fn name(&self, node: NodeIndex) -> String {
        self.nodes[node.0].name()
    }

    pub fn edges(&self) -> &[StreamEdge] {
        &self.edges
    }

    /// Adds `edge` unless its endpoints are already connected. Returns
    /// whether it was added.
    pub fn add_edge(&mut self, edge: StreamEdge) -> bool {
        if self.find_edge(edge.source, edge.target).is_some() {
            return false;
        }
        self.edges.push(edge);
        true
    }

    pub fn find_edge(&self, source: NodeIndex, target: NodeIndex) -> Option<&StreamEdge> {
        self.edges
            .iter()
            .find(|e| e.source == source && e.target == target)
    }

    pub fn find_edge_mut(&mut self, source: NodeIndex, target: NodeIndex) -> Option<&mut StreamEdge> {
        self.edges
            .iter_mut()
            .find(|e| e.source == source && e.target == target)
    }

    pub fn remove_edge(&mut self, source: NodeIndex, target: NodeIndex) -> Option<StreamEdge> {
        let pos = self
            .edges
            .iter()
            .position(|e| e.source == source && e.target == target)?;
        Some(self.edges.remove(pos))
    }

    pub fn outgoing(&self, node: NodeIndex) -> impl Iterator<Item = &StreamEdge> {
        self.edges.iter().filter(move |e| e.source == node)
    }

    pub fn incoming(&self, node: NodeIndex) -> impl Iterator<Item = &StreamEdge> {
        self.edges.iter().filter(move |e| e.target == node)
    }

    pub fn out_degree(&self, node: NodeIndex) -> usize {
        self.outgoing(node).count()
    }

    pub fn in_degree(&self, node: NodeIndex) -> usize {
        self.incoming(node).count()
    }

    /// Breadth-first order over the whole graph: from the first node, then
    /// from each node not yet reached, in insertion order.
    pub fn bfs(&self) -> Vec<NodeIndex> {
        let mut seen = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        for start in self.node_indices() {
            if !seen[start.0] {
                self.bfs_into(start, &mut seen, &mut order);
            }
        }
        order
    }

    /// Nodes reachable from `start`, breadth-first, `start` included.
    pub fn bfs_from(&self, start: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        self.bfs_into(start, &mut seen, &mut order);
        order
    }

    fn bfs_into(&self, start: NodeIndex, seen: &mut [bool], order: &mut Vec<NodeIndex>) {
        let mut queue = VecDeque::new();
        seen[start.0] = true;
        queue.push_back(start);
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for edge in self.outgoing(node) {
                if !seen[edge.target.0] {
                    seen[edge.target.0] = true;
                    queue.push_back(edge.target);
                }
            }
        }
    }

    /// Kahn's algorithm, ties broken by insertion order. `None` when the
    /// graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<NodeIndex>> {
        let mut in_degree: Vec<usize> = self.node_indices().map(|n| self.in_degree(n)).collect();
        let mut queue: VecDeque<NodeIndex> = self
            .node_indices()
            .filter(|n| in_degree[n.0] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for edge in self.outgoing(node) {
                in_degree[edge.target.0] -= 1;
                if in_degree[edge.target.0] == 0 {
                    queue.push_back(edge.target);
                }
            }
        }
        (order.len() == self.nodes.len()).then_some(order)
    }
}

impl Index<NodeIndex> for Graph {
    type Output = Node;

    fn index(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.0]
    }
}

impl IndexMut<NodeIndex> for Graph {
    fn index_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index.0]
    }
}
