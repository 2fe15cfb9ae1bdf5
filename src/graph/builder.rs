//! Similarity-graph construction over a bag's instances.
//!
//! Three policies are supported:
//!
//! - **Full**: every ordered pair `(i, j)`, `i != j`, weighted by cosine similarity.
//! - **Knn**: exact Euclidean candidate search (capped), re-ranked by cosine similarity,
//!   one graph per rung of the `k` ladder.
//! - **RandomPartial**: per node, up to `samples` neighbors drawn with replacement and
//!   deduplicated. Neighbor count is variable; only meant for very large bags.

use std::collections::BTreeSet;
use std::fmt;

use ndarray::{Array1, ArrayView2};
use rand::{Rng, rngs::StdRng};
use rayon::prelude::*;
use tracing::{debug, info};

use super::knn::NeighborIndex;
use super::similarity::{cosine_with_norms, row_norms};
use super::{Edge, InstanceGraph};
use crate::util::error::{MilError, MilResult};
use crate::util::rng;

/// Default `k` ladder for the kNN policy.
pub const DEFAULT_KNN_LADDER: [usize; 5] = [2, 4, 8, 16, 32];
/// Default number of Euclidean candidates retrieved per node before re-ranking.
/// The largest ladder rung raises it when bigger.
pub const DEFAULT_CANDIDATE_CAP: usize = 32;
/// Default number of draws per node for the random-partial policy.
pub const DEFAULT_PARTIAL_SAMPLES: usize = 100;

/// Graph construction policy, selected once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphPolicy {
    Full,
    Knn {
        ladder: Vec<usize>,
        candidate_cap: usize,
    },
    RandomPartial {
        samples: usize,
    },
}

impl GraphPolicy {
    #[must_use]
    pub fn knn_default() -> Self {
        Self::Knn {
            ladder: DEFAULT_KNN_LADDER.to_vec(),
            candidate_cap: DEFAULT_CANDIDATE_CAP,
        }
    }

    /// Edge sets this policy writes for every bag.
    #[must_use]
    pub fn edge_sets(&self) -> Vec<EdgeSet> {
        match self {
            Self::Full => vec![EdgeSet::Full],
            Self::Knn { ladder, .. } => ladder.iter().map(|&k| EdgeSet::Knn(k)).collect(),
            Self::RandomPartial { .. } => vec![EdgeSet::Partial],
        }
    }
}

/// Identifies one persisted edge list of a bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeSet {
    Full,
    Knn(usize),
    Partial,
}

impl EdgeSet {
    /// Directory (sibling of the feature directory) holding this edge set.
    #[must_use]
    pub fn dir_name(self) -> String {
        match self {
            Self::Full => "edges".to_string(),
            Self::Knn(k) => format!("edges_{k}"),
            Self::Partial => "edges_partial".to_string(),
        }
    }
}

impl fmt::Display for EdgeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// Builds instance graphs for bags, one bag at a time.
#[derive(Debug)]
pub struct GraphBuilder {
    policy: GraphPolicy,
    rng: StdRng,
}

impl GraphBuilder {
    /// `seed` only affects the random-partial policy.
    #[must_use]
    pub fn new(policy: GraphPolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: rng::stream(seed, 0x6772_6170_68),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &GraphPolicy {
        &self.policy
    }

    /// Builds every edge set of the configured policy for one bag.
    ///
    /// # Errors
    /// Returns [`MilError::Data`] when the bag has no instances or zero-width features.
    pub fn build(
        &mut self,
        bag_id: &str,
        features: ArrayView2<'_, f32>,
    ) -> MilResult<Vec<(EdgeSet, InstanceGraph)>> {
        if features.nrows() == 0 {
            return Err(MilError::data(bag_id, "feature matrix has no instances"));
        }
        if features.ncols() == 0 {
            return Err(MilError::data(bag_id, "feature vectors have zero dimensions"));
        }

        let graphs = match &self.policy {
            GraphPolicy::Full => vec![(EdgeSet::Full, full_graph(features))],
            GraphPolicy::Knn {
                ladder,
                candidate_cap,
            } => knn_graphs(features, ladder, *candidate_cap),
            GraphPolicy::RandomPartial { samples } => vec![(
                EdgeSet::Partial,
                random_partial_graph(features, *samples, &mut self.rng),
            )],
        };

        for (set, graph) in &graphs {
            debug!(
                bag_id = %bag_id,
                edge_set = %set,
                nodes = graph.node_count(),
                edges = graph.edge_count(),
                "graph built"
            );
        }
        Ok(graphs)
    }
}

/// All ordered pairs; `N * (N - 1)` edges.
#[must_use]
pub fn full_graph(features: ArrayView2<'_, f32>) -> InstanceGraph {
    let n = features.nrows();
    let norms = row_norms(features);
    let mut graph = InstanceGraph::with_nodes(n);

    let rows: Vec<Vec<(usize, f32)>> = (0..n)
        .into_par_iter()
        .map(|a| {
            ((a + 1)..n)
                .map(|b| (b, pair_similarity(features, &norms, a, b)))
                .collect()
        })
        .collect();

    for (a, pairs) in rows.into_iter().enumerate() {
        for (b, weight) in pairs {
            // undirected: both directions carry the same weight
            graph.push(Edge::new(a, b, weight));
            graph.push(Edge::new(b, a, weight));
        }
    }
    graph
}

/// One kNN graph per ladder rung. Each node keeps its `min(k, N - 1)` most similar
/// candidates; ties in similarity go to the lower node index.
///
/// At least `max(ladder)` candidates are retrieved per node, whatever `candidate_cap` says.
#[must_use]
pub fn knn_graphs(
    features: ArrayView2<'_, f32>,
    ladder: &[usize],
    candidate_cap: usize,
) -> Vec<(EdgeSet, InstanceGraph)> {
    let n = features.nrows();
    let norms = row_norms(features);
    let index = NeighborIndex::fit(features);
    let widest = ladder.iter().copied().max().unwrap_or(0);
    let candidate_count = candidate_cap.max(widest).min(n.saturating_sub(1));

    let ranked: Vec<Vec<(usize, f32)>> = (0..n)
        .into_par_iter()
        .map(|node| {
            let mut candidates: Vec<(usize, f32)> = index
                .nearest(node, candidate_count)
                .into_iter()
                .map(|other| (other, pair_similarity(features, &norms, node, other)))
                .collect();
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            candidates
        })
        .collect();

    ladder
        .iter()
        .map(|&k| {
            let mut graph = InstanceGraph::with_nodes(n);
            for (node, candidates) in ranked.iter().enumerate() {
                for &(other, weight) in candidates.iter().take(k) {
                    graph.push(Edge::new(node, other, weight));
                }
            }
            (EdgeSet::Knn(k), graph)
        })
        .collect()
}

/// Directed edges to a random, deduplicated subset of other nodes.
pub fn random_partial_graph(
    features: ArrayView2<'_, f32>,
    samples: usize,
    rng: &mut impl Rng,
) -> InstanceGraph {
    let n = features.nrows();
    let norms = row_norms(features);
    let mut graph = InstanceGraph::with_nodes(n);
    if n < 2 {
        return graph;
    }

    for node in 0..n {
        let drawn: BTreeSet<usize> = (0..samples)
            .map(|_| {
                // draw among the other n - 1 nodes
                let other = rng.random_range(0..n - 1);
                if other >= node { other + 1 } else { other }
            })
            .collect();
        for other in drawn {
            graph.push(Edge::new(
                node,
                other,
                pair_similarity(features, &norms, node, other),
            ));
        }
    }

    info!(
        nodes = n,
        edges = graph.edge_count(),
        samples,
        "random partial graph built"
    );
    graph
}

fn pair_similarity(features: ArrayView2<'_, f32>, norms: &Array1<f32>, a: usize, b: usize) -> f32 {
    cosine_with_norms(features.row(a), features.row(b), norms[a], norms[b])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, arr2};
    use rand::SeedableRng;
    use rstest::rstest;

    fn spread_features(n: usize, dim: usize) -> Array2<f32> {
        Array2::from_shape_fn((n, dim), |(i, j)| ((i * 7 + j * 3) % 11) as f32 - 5.0 + i as f32 * 0.01)
    }

    #[test]
    fn single_instance_bag_has_no_edges() {
        let features = arr2(&[[1.0_f32, 0.0, 0.0]]);
        assert_eq!(full_graph(features.view()).edge_count(), 0);
        for (set, graph) in knn_graphs(features.view(), &[4], DEFAULT_CANDIDATE_CAP) {
            assert_eq!(set, EdgeSet::Knn(4));
            assert_eq!(graph.node_count(), 1);
            assert_eq!(graph.edge_count(), 0);
        }
    }

    #[test]
    fn identical_instances_are_mutual_nearest_neighbors() {
        let features = arr2(&[[1.0_f32, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        let graphs = knn_graphs(features.view(), &[2], DEFAULT_CANDIDATE_CAP);
        let (_, graph) = &graphs[0];
        let edges: Vec<Edge> = graph.edges().collect();

        let first_of = |node: usize| {
            edges
                .iter()
                .find(|edge| edge.src == node)
                .copied()
                .expect("node has neighbors")
        };
        assert_eq!(first_of(0).dst, 1);
        assert!((first_of(0).weight - 1.0).abs() < 1e-6);
        assert_eq!(first_of(1).dst, 0);

        let from_two: Vec<Edge> = edges.iter().filter(|e| e.src == 2).copied().collect();
        assert_eq!(
            from_two.iter().map(|e| e.dst).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(from_two.iter().all(|e| e.weight.abs() < 1e-6));
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(6)]
    #[case(40)]
    fn knn_out_degree_is_clamped(#[case] n: usize) {
        let features = spread_features(n, 4);
        let ladder = DEFAULT_KNN_LADDER.to_vec();
        for (set, graph) in knn_graphs(features.view(), &ladder, DEFAULT_CANDIDATE_CAP) {
            let EdgeSet::Knn(k) = set else {
                panic!("unexpected edge set {set}");
            };
            for node in 0..n {
                assert_eq!(graph.out_degree(node), k.min(n - 1), "k={k} node={node}");
                assert!(!graph.has_self_loop(node));
            }
        }
    }

    #[test]
    fn full_graph_has_both_directions() {
        let features = spread_features(5, 3);
        let graph = full_graph(features.view());
        assert_eq!(graph.edge_count(), 5 * 4);

        let edges: Vec<Edge> = graph.edges().collect();
        for edge in &edges {
            let reverse = edges
                .iter()
                .find(|other| other.src == edge.dst && other.dst == edge.src)
                .expect("reverse edge present");
            assert_eq!(reverse.weight, edge.weight);
            assert!((-1.0..=1.0).contains(&edge.weight));
        }
    }

    #[test]
    fn random_partial_degree_is_bounded_and_loop_free() {
        let features = spread_features(30, 4);
        let mut rng = StdRng::seed_from_u64(7);
        let graph = random_partial_graph(features.view(), 10, &mut rng);
        for node in 0..30 {
            let degree = graph.out_degree(node);
            assert!((1..=10).contains(&degree));
            assert!(!graph.has_self_loop(node));
        }
    }

    #[test]
    fn builder_rejects_empty_features() {
        let mut builder = GraphBuilder::new(GraphPolicy::Full, 0);
        let empty = Array2::<f32>::zeros((0, 8));
        let error = builder.build("empty", empty.view()).expect_err("no instances");
        assert!(matches!(error, MilError::Data { .. }));

        let zero_width = Array2::<f32>::zeros((3, 0));
        assert!(builder.build("narrow", zero_width.view()).is_err());
    }

    #[test]
    fn knn_policy_writes_one_graph_per_rung() {
        let features = spread_features(10, 4);
        let mut builder = GraphBuilder::new(GraphPolicy::knn_default(), 0);
        let graphs = builder.build("bag", features.view()).expect("graphs built");
        let sets: Vec<EdgeSet> = graphs.iter().map(|(set, _)| *set).collect();
        assert_eq!(
            sets,
            DEFAULT_KNN_LADDER.iter().map(|&k| EdgeSet::Knn(k)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn small_candidate_cap_does_not_shrink_the_degree() {
        let features = spread_features(40, 4);
        let graphs = knn_graphs(features.view(), &[4, 16], 8);
        for (set, graph) in &graphs {
            let EdgeSet::Knn(k) = *set else {
                panic!("unexpected edge set {set}");
            };
            for node in 0..40 {
                assert_eq!(graph.out_degree(node), k, "{set} node {node}");
            }
        }

        let mut builder = GraphBuilder::new(
            GraphPolicy::Knn {
                ladder: vec![16],
                candidate_cap: 2,
            },
            0,
        );
        let graphs = builder.build("bag", features.view()).expect("graphs built");
        assert_eq!(graphs[0].1.out_degree(0), 16);
    }
}
