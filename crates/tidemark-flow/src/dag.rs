//! Directed acyclic graph used to order assets parent-before-child.
//!
//! **Note:** This module is internal to `tidemark-flow`.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// A directed graph with deterministic topological layering.
///
/// Edges point from parent to child. Ties are broken by insertion order so the
/// same inputs always yield the same ordering.
#[derive(Debug, Clone)]
pub(crate) struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
    /// Position of each node in insertion order, for tie-breaking.
    position: HashMap<NodeIndex, usize>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates a new empty DAG.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
            position: HashMap::new(),
        }
    }

    /// Adds a node, returning the existing index if already present.
    pub(crate) fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        self.position.insert(idx, self.position.len());
        idx
    }

    /// Adds a directed edge from `parent` to `child`. Duplicate edges collapse.
    ///
    /// # Errors
    ///
    /// Returns an error if either node index is invalid.
    pub(crate) fn add_edge(&mut self, parent: NodeIndex, child: NodeIndex) -> Result<()> {
        for idx in [parent, child] {
            self.graph
                .node_weight(idx)
                .ok_or_else(|| Error::DagNodeNotFound {
                    node: format!("index {}", idx.index()),
                })?;
        }
        self.graph.update_edge(parent, child, ());
        Ok(())
    }

    /// Decomposes the graph into layers: every node appears in a later layer
    /// than all of its parents. Nodes within a layer keep insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] naming every node that could not be
    /// placed, rather than silently dropping them.
    pub(crate) fn layers(&self) -> Result<Vec<Vec<T>>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, 0usize))
            .collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut current: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(idx, _)| *idx)
            .collect();
        self.sort_by_position(&mut current);

        let mut layers = Vec::new();
        let mut placed = 0usize;

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();

            for &idx in &current {
                for child in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    if let Some(deg) = in_degree.get_mut(&child) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            next.push(child);
                        }
                    }
                }
            }

            layers.push(self.values(&current)?);
            self.sort_by_position(&mut next);
            current = next;
        }

        if placed != self.graph.node_count() {
            let mut blocked: Vec<NodeIndex> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(idx, _)| *idx)
                .collect();
            self.sort_by_position(&mut blocked);
            let cycle = self
                .values(&blocked)?
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(Error::CycleDetected { cycle });
        }

        Ok(layers)
    }

    /// Returns all nodes in topological order (layers flattened).
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] if the graph contains a cycle.
    pub(crate) fn toposort(&self) -> Result<Vec<T>> {
        Ok(self.layers()?.into_iter().flatten().collect())
    }

    fn sort_by_position(&self, nodes: &mut [NodeIndex]) {
        nodes.sort_by_key(|idx| self.position.get(idx).copied().unwrap_or(usize::MAX));
    }

    fn values(&self, nodes: &[NodeIndex]) -> Result<Vec<T>> {
        nodes
            .iter()
            .map(|&idx| {
                self.graph
                    .node_weight(idx)
                    .cloned()
                    .ok_or_else(|| Error::DagNodeNotFound {
                        node: format!("index {}", idx.index()),
                    })
            })
            .collect()
    }
}

impl<T> Default for Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}
