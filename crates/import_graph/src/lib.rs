//! Processed build-dependency graph.
//!
//! Nodes are [`PackageId`] handles; edges run from a build-dependency to
//! its dependent, so that a topological walk gives build order. The walk is
//! seeded by reverse lexicographic package name so that, for a fixed input,
//! the emitted order is deterministic.

use std::collections::HashMap;

use import_package::{PackageArena, PackageId};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Directed;
use petgraph::algo::tarjan_scc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("one or more cycles detected in the build graph: {}", .loops.join(", "))]
    CyclesDetected { loops: Vec<String> },
}

/// The build-dependency graph accumulated by the import loop.
#[derive(Default)]
pub struct ProcessedGraph {
    graph: Graph<PackageId, (), Directed>,
    index_of: HashMap<PackageId, NodeIndex>,
}

impl ProcessedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node if it isn't already present; idempotent.
    pub fn add_node(&mut self, id: PackageId) -> NodeIndex {
        if let Some(&idx) = self.index_of.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(id);
        self.index_of.insert(id, idx);
        idx
    }

    pub fn contains(&self, id: PackageId) -> bool {
        self.index_of.contains_key(&id)
    }

    /// Adds an edge `from -> to` (from a dependency to its dependent),
    /// creating either endpoint if missing.
    pub fn add_edge(&mut self, from: PackageId, to: PackageId) {
        let a = self.add_node(from);
        let b = self.add_node(to);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = PackageId> + '_ {
        self.index_of.keys().copied()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Find a package handle matching the identity triple among graph
    /// nodes, mirroring the emitter's need to resolve a dependency name
    /// back to the node carrying its resolved `version_in_use`.
    pub fn find(&self, arena: &PackageArena, kind: &str, name: &str, version: &str) -> Option<PackageId> {
        self.nodes()
            .find(|&id| arena.get(id).is_some_and(|p| p.matches(kind, name, version)))
    }

    /// Topologically sort the graph into build order, seeded by reverse
    /// lexicographic package name for determinism among ties. Fails with
    /// [`GraphError::CyclesDetected`], listing every strongly-connected
    /// component of size greater than one, if the graph isn't a DAG.
    pub fn topological_build_order(&self, arena: &PackageArena) -> Result<Vec<PackageId>, GraphError> {
        let name_of = |idx: NodeIndex| -> String {
            let id = self.graph[idx];
            arena.get(id).map(|p| p.name.clone()).unwrap_or_default()
        };

        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.get_mut(&edge.target()).unwrap() += 1;
        }

        let mut ready: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&idx, _)| idx)
            .collect();
        ready.sort_by(|a, b| name_of(*a).cmp(&name_of(*b)));

        let mut order = Vec::new();
        while let Some(idx) = ready.pop() {
            order.push(self.graph[idx]);

            let mut newly_ready = Vec::new();
            for edge in self.graph.edges(idx) {
                let target = edge.target();
                let degree = in_degree.get_mut(&target).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(target);
                }
            }
            ready.extend(newly_ready);
            ready.sort_by(|a, b| name_of(*a).cmp(&name_of(*b)));
        }

        if order.len() != self.graph.node_count() {
            let loops: Vec<String> = tarjan_scc(&self.graph)
                .into_iter()
                .filter(|scc| scc.len() > 1)
                .map(|scc| scc.iter().map(|&idx| name_of(idx)).collect::<Vec<_>>().join("->"))
                .collect();
            return Err(GraphError::CyclesDetected { loops });
        }

        Ok(order)
    }
}
