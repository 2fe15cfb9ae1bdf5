//! インスタンス類似度グラフ：構築ポリシーとグラフコンテナ。

pub mod builder;
pub(crate) mod knn;
pub mod similarity;

use petgraph::{
    Direction,
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
};

pub use builder::{EdgeSet, GraphBuilder, GraphPolicy};
pub use similarity::cosine_similarity;

/// 伝播前に追加する自己ループの重み
pub const SELF_LOOP_WEIGHT: f32 = 1.0;

/// A directed, weighted edge between two instances of the same bag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub src: usize,
    pub dst: usize,
    pub weight: f32,
}

impl Edge {
    #[must_use]
    pub fn new(src: usize, dst: usize, weight: f32) -> Self {
        Self { src, dst, weight }
    }
}

/// Graph over a bag's instances; node `i` is the bag's `i`-th feature row.
#[derive(Debug, Clone, Default)]
pub struct InstanceGraph {
    graph: DiGraph<(), f32>,
}

impl InstanceGraph {
    /// A graph with `node_count` nodes and no edges.
    #[must_use]
    pub fn with_nodes(node_count: usize) -> Self {
        let mut graph = DiGraph::with_capacity(node_count, 0);
        for _ in 0..node_count {
            graph.add_node(());
        }
        Self { graph }
    }

    /// Builds a graph from an edge list.
    ///
    /// # Errors
    /// Returns the first edge whose endpoint is outside `0..node_count`.
    pub fn from_edges(
        node_count: usize,
        edges: impl IntoIterator<Item = Edge>,
    ) -> Result<Self, Edge> {
        let mut graph = Self::with_nodes(node_count);
        for edge in edges {
            if edge.src >= node_count || edge.dst >= node_count {
                return Err(edge);
            }
            graph.push(edge);
        }
        Ok(graph)
    }

    pub(crate) fn push(&mut self, edge: Edge) {
        self.graph.add_edge(
            NodeIndex::new(edge.src),
            NodeIndex::new(edge.dst),
            edge.weight,
        );
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.graph.edge_references().map(|edge| Edge {
            src: edge.source().index(),
            dst: edge.target().index(),
            weight: *edge.weight(),
        })
    }

    #[must_use]
    pub fn out_degree(&self, node: usize) -> usize {
        self.graph
            .edges_directed(NodeIndex::new(node), Direction::Outgoing)
            .count()
    }

    #[must_use]
    pub fn in_degree(&self, node: usize) -> usize {
        self.graph
            .edges_directed(NodeIndex::new(node), Direction::Incoming)
            .count()
    }

    #[must_use]
    pub fn has_self_loop(&self, node: usize) -> bool {
        let index = NodeIndex::new(node);
        self.graph.find_edge(index, index).is_some()
    }

    /// Copy of the graph where every node has a self-loop.
    ///
    /// Existing self-loops keep their weight; missing ones get [`SELF_LOOP_WEIGHT`].
    #[must_use]
    pub fn with_self_loops(&self) -> Self {
        let mut looped = self.clone();
        for node in 0..looped.node_count() {
            if !looped.has_self_loop(node) {
                looped.push(Edge::new(node, node, SELF_LOOP_WEIGHT));
            }
        }
        looped
    }

    /// Column-wise edge arrays `(src, dst, weight)` for tensor construction.
    #[must_use]
    pub fn edge_arrays(&self) -> (Vec<u32>, Vec<u32>, Vec<f32>) {
        let mut src = Vec::with_capacity(self.edge_count());
        let mut dst = Vec::with_capacity(self.edge_count());
        let mut weight = Vec::with_capacity(self.edge_count());
        for edge in self.edges() {
            src.push(edge.src as u32);
            dst.push(edge.dst as u32);
            weight.push(edge.weight);
        }
        (src, dst, weight)
    }
}
