//! Graph-convolution layers that diffuse instance features along graph edges.
//!
//! Message passing is expressed with `index_select` (gather source rows) and
//! `index_add` (scatter into destination rows), so it stays sparse in the edge count
//! and differentiable end to end.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder, linear, linear_no_bias};

use crate::graph::InstanceGraph;
use crate::util::error::{MilError, MilResult};

/// Negative slope of the LeakyReLU applied to attention logits.
const GAT_NEGATIVE_SLOPE: f64 = 0.2;

/// Graph-convolution variant. `SageConv` is recognized but not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvLayerType {
    GraphConv,
    GatConv,
    SageConv,
}

impl FromStr for ConvLayerType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "graphconv" | "gcn" => Ok(Self::GraphConv),
            "gatconv" | "gat" => Ok(Self::GatConv),
            "sageconv" | "sage" | "graphsage" => Ok(Self::SageConv),
            other => Err(format!(
                "unknown graph layer type '{other}' (expected GraphConv|GATConv|SAGEConv)"
            )),
        }
    }
}

impl fmt::Display for ConvLayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GraphConv => "GraphConv",
            Self::GatConv => "GATConv",
            Self::SageConv => "SAGEConv",
        })
    }
}

/// Edge index tensors of a graph with self-loops, plus per-edge normalization.
#[derive(Debug)]
pub struct GraphTensors {
    node_count: usize,
    src: Tensor,
    dst: Tensor,
    weight: Tensor,
    /// `1 / sqrt(deg_out(src) * deg_in(dst))` per edge, shape `(E, 1)`.
    norm: Tensor,
}

impl GraphTensors {
    /// Adds missing self-loops and uploads the edge arrays to `device`.
    ///
    /// # Errors
    /// Tensor allocation errors.
    pub fn new(graph: &InstanceGraph, device: &Device) -> MilResult<Self> {
        let looped = graph.with_self_loops();
        let node_count = looped.node_count();
        let (src, dst, weight) = looped.edge_arrays();
        let edge_count = src.len();

        let mut out_degree = vec![0_f32; node_count];
        let mut in_degree = vec![0_f32; node_count];
        for (&s, &d) in src.iter().zip(&dst) {
            out_degree[s as usize] += 1.0;
            in_degree[d as usize] += 1.0;
        }
        let norm: Vec<f32> = src
            .iter()
            .zip(&dst)
            .map(|(&s, &d)| (out_degree[s as usize] * in_degree[d as usize]).sqrt().recip())
            .collect();

        Ok(Self {
            node_count,
            src: Tensor::from_vec(src, edge_count, device)?,
            dst: Tensor::from_vec(dst, edge_count, device)?,
            weight: Tensor::from_vec(weight, (edge_count, 1), device)?,
            norm: Tensor::from_vec(norm, (edge_count, 1), device)?,
        })
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    fn dst_host(&self) -> MilResult<Vec<u32>> {
        Ok(self.dst.to_vec1::<u32>()?)
    }
}

/// Symmetric-normalized graph convolution followed by a learned K×K map.
#[derive(Debug)]
struct GraphConv {
    fc: Linear,
    use_edge_weights: bool,
}

impl GraphConv {
    fn new(dim: usize, use_edge_weights: bool, vb: VarBuilder<'_>) -> MilResult<Self> {
        Ok(Self {
            fc: linear(dim, dim, vb.pp("fc"))?,
            use_edge_weights,
        })
    }

    fn forward(&self, graph: &GraphTensors, features: &Tensor) -> MilResult<Tensor> {
        let (n, k) = features.dims2()?;
        let coefficient = if self.use_edge_weights {
            graph.norm.mul(&graph.weight)?
        } else {
            graph.norm.clone()
        };
        let messages = features
            .index_select(&graph.src, 0)?
            .broadcast_mul(&coefficient)?;
        let aggregated = Tensor::zeros((n, k), DType::F32, features.device())?.index_add(
            &graph.dst,
            &messages,
            0,
        )?;
        Ok(self.fc.forward(&aggregated)?)
    }
}

/// Multi-head graph attention; head outputs are concatenated back to K.
#[derive(Debug)]
struct GatConv {
    fc: Linear,
    attn_src: Tensor,
    attn_dst: Tensor,
    bias: Tensor,
    heads: usize,
    head_dim: usize,
    use_edge_weights: bool,
}

impl GatConv {
    fn new(dim: usize, heads: usize, use_edge_weights: bool, vb: VarBuilder<'_>) -> MilResult<Self> {
        let head_dim = dim / heads;
        #[allow(clippy::cast_precision_loss)]
        let bound = (6.0 / (head_dim as f64 + 1.0)).sqrt();
        let attention_init = || Init::Uniform {
            lo: -bound,
            up: bound,
        };
        Ok(Self {
            fc: linear_no_bias(dim, heads * head_dim, vb.pp("fc"))?,
            attn_src: vb.get_with_hints((1, heads, head_dim), "attn_src", attention_init())?,
            attn_dst: vb.get_with_hints((1, heads, head_dim), "attn_dst", attention_init())?,
            bias: vb.get_with_hints(heads * head_dim, "bias", Init::Const(0.0))?,
            heads,
            head_dim,
            use_edge_weights,
        })
    }

    fn forward(&self, graph: &GraphTensors, features: &Tensor) -> MilResult<Tensor> {
        let n = features.dim(0)?;
        let device = features.device();
        let projected = self
            .fc
            .forward(features)?
            .reshape((n, self.heads, self.head_dim))?;

        let score_src = projected.broadcast_mul(&self.attn_src)?.sum(2)?;
        let score_dst = projected.broadcast_mul(&self.attn_dst)?.sum(2)?;
        let logits = leaky_relu(
            &score_src
                .index_select(&graph.src, 0)?
                .add(&score_dst.index_select(&graph.dst, 0)?)?,
            GAT_NEGATIVE_SLOPE,
        )?;

        let mut alpha = edge_softmax(&logits, graph, self.heads, device)?;
        if self.use_edge_weights {
            alpha = alpha.broadcast_mul(&graph.weight)?;
        }

        let messages = projected
            .index_select(&graph.src, 0)?
            .broadcast_mul(&alpha.unsqueeze(2)?)?;
        let aggregated = Tensor::zeros((n, self.heads, self.head_dim), DType::F32, device)?
            .index_add(&graph.dst, &messages, 0)?;

        // flatten heads: (N, H, D) -> (N, H * D)
        Ok(aggregated
            .reshape((n, self.heads * self.head_dim))?
            .broadcast_add(&self.bias)?)
    }
}

/// Softmax of `(E, H)` edge logits over the incoming edges of each destination node.
fn edge_softmax(
    logits: &Tensor,
    graph: &GraphTensors,
    heads: usize,
    device: &Device,
) -> MilResult<Tensor> {
    let dst = graph.dst_host()?;
    let host = logits.to_vec2::<f32>()?;
    let mut max = vec![f32::NEG_INFINITY; graph.node_count * heads];
    for (row, &node) in host.iter().zip(&dst) {
        for (head, &value) in row.iter().enumerate() {
            let slot = &mut max[node as usize * heads + head];
            *slot = slot.max(value);
        }
    }

    // constant shift per destination; does not change the softmax or its gradient
    let shift = Tensor::from_vec(max, (graph.node_count, heads), device)?
        .index_select(&graph.dst, 0)?;
    let exp = logits.sub(&shift)?.exp()?;
    let denominator = Tensor::zeros((graph.node_count, heads), DType::F32, device)?
        .index_add(&graph.dst, &exp, 0)?
        .index_select(&graph.dst, 0)?;
    Ok(exp.div(&denominator)?)
}

fn leaky_relu(xs: &Tensor, negative_slope: f64) -> MilResult<Tensor> {
    let positive = xs.relu()?;
    let negative = xs.sub(&positive)?.affine(negative_slope, 0.0)?;
    Ok(positive.add(&negative)?)
}

#[derive(Debug)]
enum ConvLayer {
    Plain(GraphConv),
    Attention(GatConv),
}

/// Stack of graph-convolution layers; preserves node count and feature width.
#[derive(Debug)]
pub struct GraphPropagator {
    layers: Vec<ConvLayer>,
}

impl GraphPropagator {
    /// # Errors
    /// [`MilError::UnsupportedPolicy`] for `SageConv`; [`MilError::ShapeMismatch`] when
    /// `dim` is not divisible by `heads` for attention layers.
    pub fn new(
        layer_type: ConvLayerType,
        n_layers: usize,
        dim: usize,
        heads: usize,
        use_edge_weights: bool,
        vb: VarBuilder<'_>,
    ) -> MilResult<Self> {
        validate_layer(layer_type, dim, heads)?;
        let layers = (0..n_layers)
            .map(|index| {
                let vb = vb.pp(format!("layers.{index}"));
                Ok(match layer_type {
                    ConvLayerType::GraphConv => {
                        ConvLayer::Plain(GraphConv::new(dim, use_edge_weights, vb)?)
                    }
                    ConvLayerType::GatConv => {
                        ConvLayer::Attention(GatConv::new(dim, heads, use_edge_weights, vb)?)
                    }
                    ConvLayerType::SageConv => {
                        return Err(MilError::UnsupportedPolicy {
                            kind: "graph convolution",
                            name: layer_type.to_string(),
                        });
                    }
                })
            })
            .collect::<MilResult<Vec<_>>>()?;
        Ok(Self { layers })
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Applies every layer in order.
    ///
    /// # Errors
    /// [`MilError::ShapeMismatch`] when the feature rows do not match the graph's nodes.
    pub fn propagate(&self, graph: &GraphTensors, features: &Tensor) -> MilResult<Tensor> {
        let n = features.dim(0)?;
        if n != graph.node_count() {
            return Err(MilError::shape(
                "graph propagation nodes",
                graph.node_count(),
                n,
            ));
        }
        let mut hidden = features.clone();
        for layer in &self.layers {
            hidden = match layer {
                ConvLayer::Plain(conv) => conv.forward(graph, &hidden)?,
                ConvLayer::Attention(conv) => conv.forward(graph, &hidden)?,
            };
        }
        Ok(hidden)
    }
}

/// Rejects layer configurations before any parameter is allocated.
///
/// # Errors
/// See [`GraphPropagator::new`].
pub fn validate_layer(layer_type: ConvLayerType, dim: usize, heads: usize) -> MilResult<()> {
    match layer_type {
        ConvLayerType::SageConv => Err(MilError::UnsupportedPolicy {
            kind: "graph convolution",
            name: layer_type.to_string(),
        }),
        ConvLayerType::GatConv if heads == 0 || dim % heads != 0 => Err(MilError::shape(
            "attention heads",
            format!("a divisor of {dim}"),
            heads,
        )),
        ConvLayerType::GraphConv | ConvLayerType::GatConv => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;
    use candle_nn::VarMap;
    use std::collections::HashMap;

    fn chain_graph(n: usize) -> InstanceGraph {
        InstanceGraph::from_edges(
            n,
            (0..n.saturating_sub(1)).flat_map(|i| [Edge::new(i, i + 1, 0.5), Edge::new(i + 1, i, 0.5)]),
        )
        .expect("valid chain")
    }

    fn features(n: usize, k: usize) -> Tensor {
        Tensor::arange(0_f32, (n * k) as f32, &Device::Cpu)
            .and_then(|t| t.reshape((n, k)))
            .and_then(|t| t.affine(0.1, -0.3))
            .expect("features")
    }

    #[test]
    fn graph_tensors_add_self_loops_and_normalize() {
        let tensors = GraphTensors::new(&chain_graph(3), &Device::Cpu).expect("tensors");
        // 4 chain edges + 3 self-loops
        assert_eq!(tensors.src.dim(0).expect("dim"), 7);
        let norm = tensors.norm.flatten_all().and_then(|t| t.to_vec1::<f32>()).expect("norm");
        // edge 0 -> 1: deg_out(0) = 2, deg_in(1) = 3
        assert!((norm[0] - 1.0 / 6.0_f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn plain_and_attention_layers_preserve_shape() {
        for (layer_type, heads) in [(ConvLayerType::GraphConv, 1), (ConvLayerType::GatConv, 2)] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let propagator =
                GraphPropagator::new(layer_type, 2, 4, heads, false, vb).expect("propagator");
            let graph = GraphTensors::new(&chain_graph(5), &Device::Cpu).expect("tensors");

            let out = propagator.propagate(&graph, &features(5, 4)).expect("propagate");
            assert_eq!(out.dims(), &[5, 4], "{layer_type}");
            assert_eq!(propagator.depth(), 2);
        }
    }

    #[test]
    fn isolated_node_keeps_its_own_signal() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let propagator =
            GraphPropagator::new(ConvLayerType::GatConv, 1, 4, 1, false, vb).expect("propagator");
        let graph =
            GraphTensors::new(&InstanceGraph::with_nodes(1), &Device::Cpu).expect("tensors");

        let out = propagator.propagate(&graph, &features(1, 4)).expect("propagate");
        assert_eq!(out.dims(), &[1, 4]);
    }

    #[test]
    fn sage_is_rejected_and_heads_must_divide_width() {
        let error = validate_layer(ConvLayerType::SageConv, 512, 1).expect_err("sage");
        assert!(matches!(error, MilError::UnsupportedPolicy { .. }));

        let error = validate_layer(ConvLayerType::GatConv, 512, 3).expect_err("heads");
        assert!(matches!(error, MilError::ShapeMismatch { .. }));
        assert!(validate_layer(ConvLayerType::GatConv, 512, 4).is_ok());
    }

    #[test]
    fn mismatched_node_count_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let propagator =
            GraphPropagator::new(ConvLayerType::GraphConv, 1, 4, 1, false, vb).expect("propagator");
        let graph = GraphTensors::new(&chain_graph(3), &Device::Cpu).expect("tensors");

        assert!(propagator.propagate(&graph, &features(4, 4)).is_err());
    }

    #[test]
    fn layer_type_parses_common_spellings() {
        assert_eq!("GraphConv".parse::<ConvLayerType>(), Ok(ConvLayerType::GraphConv));
        assert_eq!("GATConv".parse::<ConvLayerType>(), Ok(ConvLayerType::GatConv));
        assert_eq!("SAGEConv".parse::<ConvLayerType>(), Ok(ConvLayerType::SageConv));
        assert!("ChebConv".parse::<ConvLayerType>().is_err());
    }

    /// Two nodes with a single half-weight edge `0 -> 1`; self-loops are added later.
    fn half_weight_pair() -> GraphTensors {
        let graph = InstanceGraph::from_edges(2, [Edge::new(0, 1, 0.5)]).expect("valid pair");
        GraphTensors::new(&graph, &Device::Cpu).expect("tensors")
    }

    fn fixed_params(entries: &[(&str, Tensor)]) -> VarBuilder<'static> {
        let tensors: HashMap<String, Tensor> = entries
            .iter()
            .map(|(name, tensor)| ((*name).to_string(), tensor.clone()))
            .collect();
        VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu)
    }

    fn identity() -> Tensor {
        Tensor::new(&[[1.0_f32, 0.0], [0.0, 1.0]], &Device::Cpu).expect("identity")
    }

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).expect("zeros")
    }

    fn pair_features() -> Tensor {
        Tensor::new(&[[1.0_f32, 2.0], [3.0, 4.0]], &Device::Cpu).expect("features")
    }

    fn assert_rows(actual: &Tensor, expected: [[f32; 2]; 2]) {
        let actual = actual.to_vec2::<f32>().expect("rows");
        for (row, expected_row) in actual.iter().zip(expected) {
            for (value, expected) in row.iter().zip(expected_row) {
                assert!((value - expected).abs() < 1e-5, "{actual:?} != {expected_row:?}");
            }
        }
    }

    #[test]
    fn graph_conv_scales_messages_by_edge_weight() {
        let graph = half_weight_pair();
        let conv = |use_edge_weights| {
            let vb = fixed_params(&[("fc.weight", identity()), ("fc.bias", zeros(&[2]))]);
            GraphConv::new(2, use_edge_weights, vb).expect("conv")
        };
        let features = pair_features();
        let root_half = std::f32::consts::FRAC_1_SQRT_2;

        // deg_out = [2, 1], deg_in = [1, 2]: node 0 only hears itself with norm 1/sqrt(2),
        // node 1 hears node 0 with norm 1/2 and itself with norm 1/sqrt(2)
        let plain = conv(false).forward(&graph, &features).expect("forward");
        assert_rows(
            &plain,
            [
                [root_half, 2.0 * root_half],
                [0.5 + 3.0 * root_half, 1.0 + 4.0 * root_half],
            ],
        );

        let weighted = conv(true).forward(&graph, &features).expect("forward");
        assert_rows(
            &weighted,
            [
                [root_half, 2.0 * root_half],
                [0.25 + 3.0 * root_half, 0.5 + 4.0 * root_half],
            ],
        );
    }

    #[test]
    fn gat_conv_rescales_attention_by_edge_weight() {
        let graph = half_weight_pair();
        let conv = |use_edge_weights| {
            let vb = fixed_params(&[
                ("fc.weight", identity()),
                ("attn_src", zeros(&[1, 1, 2])),
                ("attn_dst", zeros(&[1, 1, 2])),
                ("bias", zeros(&[2])),
            ]);
            GatConv::new(2, 1, use_edge_weights, vb).expect("conv")
        };
        let features = pair_features();

        // zero attention vectors give uniform weights over each node's incoming edges
        let plain = conv(false).forward(&graph, &features).expect("forward");
        assert_rows(&plain, [[1.0, 2.0], [2.0, 3.0]]);

        let weighted = conv(true).forward(&graph, &features).expect("forward");
        assert_rows(&weighted, [[1.0, 2.0], [1.75, 2.5]]);
    }
}
