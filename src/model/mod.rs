//! The MIL network: optional graph propagation, instance scoring and bag aggregation.

pub mod attention;
pub mod instance;
pub mod pool;
pub mod propagate;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

pub use attention::{AttentionAggregator, AttentionOptions, AttentionOutput, critical_instances};
pub use instance::InstanceClassifier;
pub use pool::GraphPoolAggregator;
pub use propagate::{ConvLayerType, GraphPropagator, GraphTensors};

use crate::graph::InstanceGraph;
use crate::store::Bag;
use crate::util::error::{MilError, MilResult};

/// Bag-level aggregation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorKind {
    /// Critical-instance attention.
    Dsmil,
    /// Gated global pooling over the graph.
    Graph,
}

impl FromStr for AggregatorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dsmil" => Ok(Self::Dsmil),
            "graph" | "globalattentionpooling" => Ok(Self::Graph),
            other => Err(format!("unknown aggregator '{other}' (expected dsmil|graph)")),
        }
    }
}

impl fmt::Display for AggregatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dsmil => "dsmil",
            Self::Graph => "graph",
        })
    }
}

/// Which features feed the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSource {
    Propagated,
    Raw,
}

impl FromStr for FeatureSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "propagated" => Ok(Self::Propagated),
            "raw" => Ok(Self::Raw),
            other => Err(format!("unknown feature source '{other}' (expected propagated|raw)")),
        }
    }
}

/// Architecture of a [`MilNet`]; checked once before any parameter is created.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub feature_dim: usize,
    pub num_classes: usize,
    pub layer_type: ConvLayerType,
    /// Zero disables propagation.
    pub n_layers: usize,
    pub gat_heads: usize,
    pub use_edge_weights: bool,
    pub aggregator: AggregatorKind,
    pub query_source: FeatureSource,
    pub attention: AttentionOptions,
}

impl ModelSpec {
    /// # Errors
    /// [`MilError::UnsupportedPolicy`] or [`MilError::ShapeMismatch`] for unusable settings.
    pub fn validate(&self) -> MilResult<()> {
        if self.feature_dim == 0 {
            return Err(MilError::shape("feature dimension", "a positive width", 0));
        }
        if self.num_classes == 0 {
            return Err(MilError::shape("class count", "at least one class", 0));
        }
        if self.n_layers > 0 {
            propagate::validate_layer(self.layer_type, self.feature_dim, self.gat_heads)?;
        }
        Ok(())
    }

    /// Whether a forward pass needs the bag's graph.
    #[must_use]
    pub fn requires_graph(&self) -> bool {
        self.n_layers > 0 || self.aggregator == AggregatorKind::Graph
    }
}

/// Requested device, parsed from `cpu` or `cuda:N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
}

impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| format!("unknown device '{other}' (expected cpu|cuda:N)")),
        }
    }
}

/// Device every tensor of a run lives on.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    device: Device,
}

impl ExecutionContext {
    #[must_use]
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
        }
    }

    /// # Errors
    /// Device initialization errors.
    pub fn new(spec: DeviceSpec) -> MilResult<Self> {
        match spec {
            DeviceSpec::Cpu => Ok(Self::cpu()),
            DeviceSpec::Cuda(ordinal) => Self::cuda_or_cpu(ordinal),
        }
    }

    /// CUDA device `ordinal` when the build and host support it, CPU otherwise.
    ///
    /// # Errors
    /// Device initialization errors.
    pub fn cuda_or_cpu(ordinal: usize) -> MilResult<Self> {
        let device = Device::cuda_if_available(ordinal)?;
        if device.is_cpu() {
            info!(ordinal, "cuda unavailable, running on cpu");
        }
        Ok(Self { device })
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[derive(Debug)]
enum Aggregator {
    Attention(AttentionAggregator),
    Pool(GraphPoolAggregator),
}

/// Result of one forward pass over a bag.
#[derive(Debug)]
pub struct ForwardOutput {
    /// N×C per-instance scores.
    pub instance_scores: Tensor,
    /// Bag logits, length C.
    pub bag_logits: Tensor,
    /// Set for the attention aggregator only.
    pub attention: Option<AttentionOutput>,
}

impl ForwardOutput {
    /// Max over instances of the per-instance scores, length C.
    ///
    /// # Errors
    /// Tensor errors.
    pub fn max_instance_logits(&self) -> MilResult<Tensor> {
        Ok(self.instance_scores.max(0)?)
    }
}

/// Owns every trainable parameter of the model.
pub struct MilNet {
    spec: ModelSpec,
    varmap: VarMap,
    device: Device,
    propagator: Option<GraphPropagator>,
    instance: InstanceClassifier,
    aggregator: Aggregator,
}

impl fmt::Debug for MilNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MilNet")
            .field("spec", &self.spec)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl MilNet {
    /// # Errors
    /// Validation errors from [`ModelSpec::validate`] and parameter allocation errors.
    pub fn new(spec: ModelSpec, context: &ExecutionContext) -> MilResult<Self> {
        spec.validate()?;
        let varmap = VarMap::new();
        let device = context.device().clone();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let propagator = if spec.n_layers > 0 {
            Some(GraphPropagator::new(
                spec.layer_type,
                spec.n_layers,
                spec.feature_dim,
                spec.gat_heads,
                spec.use_edge_weights,
                vb.pp("propagator"),
            )?)
        } else {
            None
        };
        let instance =
            InstanceClassifier::new(spec.feature_dim, spec.num_classes, vb.pp("instance"))?;
        let aggregator = match spec.aggregator {
            AggregatorKind::Dsmil => Aggregator::Attention(AttentionAggregator::new(
                spec.feature_dim,
                spec.num_classes,
                spec.attention,
                vb.pp("aggregator"),
            )?),
            AggregatorKind::Graph => Aggregator::Pool(GraphPoolAggregator::new(
                spec.feature_dim,
                spec.num_classes,
                vb.pp("aggregator"),
            )?),
        };

        debug!(
            layer_type = %spec.layer_type,
            n_layers = spec.n_layers,
            aggregator = %spec.aggregator,
            parameters = varmap.all_vars().len(),
            "model initialized"
        );
        Ok(Self {
            spec,
            varmap,
            device,
            propagator,
            instance,
            aggregator,
        })
    }

    #[must_use]
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Trainable variables, for the optimizer.
    #[must_use]
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Writes all parameters as safetensors.
    ///
    /// # Errors
    /// I/O or serialization errors.
    pub fn save(&self, path: &Path) -> MilResult<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrites parameters from a safetensors file written by [`MilNet::save`].
    ///
    /// # Errors
    /// Missing tensors or shape mismatches.
    pub fn load(&mut self, path: &Path) -> MilResult<()> {
        self.varmap.load(path)?;
        Ok(())
    }

    /// Runs propagation, instance scoring and aggregation for one bag.
    ///
    /// `graph` may be `None` only when [`ModelSpec::requires_graph`] is false.
    ///
    /// # Errors
    /// [`MilError::Data`] when the graph is missing or does not match the bag, shape
    /// errors when the bag's width differs from the model's.
    pub fn forward(
        &self,
        bag: &Bag,
        graph: Option<&InstanceGraph>,
        train: bool,
    ) -> MilResult<ForwardOutput> {
        if bag.feature_dim() != self.spec.feature_dim {
            return Err(MilError::shape(
                "bag features",
                self.spec.feature_dim,
                bag.feature_dim(),
            ));
        }
        let raw = self.features_tensor(bag)?;

        let graph_tensors = if self.spec.requires_graph() {
            let graph = graph.ok_or_else(|| MilError::data(bag.id(), "no graph for bag"))?;
            if graph.node_count() != bag.num_instances() {
                return Err(MilError::data(
                    bag.id(),
                    format!(
                        "graph has {} nodes but bag has {} instances",
                        graph.node_count(),
                        bag.num_instances()
                    ),
                ));
            }
            Some(GraphTensors::new(graph, &self.device)?)
        } else {
            None
        };

        let propagated = match (&self.propagator, &graph_tensors) {
            (Some(propagator), Some(tensors)) => propagator.propagate(tensors, &raw)?,
            _ => raw.clone(),
        };
        let instance_scores = self.instance.score(&propagated)?;
        let aggregator_input = match self.spec.query_source {
            FeatureSource::Propagated => &propagated,
            FeatureSource::Raw => &raw,
        };

        match &self.aggregator {
            Aggregator::Attention(aggregator) => {
                let out =
                    aggregator.aggregate(bag.id(), aggregator_input, &instance_scores, train)?;
                Ok(ForwardOutput {
                    instance_scores,
                    bag_logits: out.logits.clone(),
                    attention: Some(out),
                })
            }
            Aggregator::Pool(aggregator) => {
                let tensors = graph_tensors
                    .as_ref()
                    .ok_or_else(|| MilError::data(bag.id(), "no graph for bag"))?;
                let (bag_logits, _) =
                    aggregator.aggregate(bag.id(), tensors, aggregator_input)?;
                Ok(ForwardOutput {
                    instance_scores,
                    bag_logits,
                    attention: None,
                })
            }
        }
    }

    fn features_tensor(&self, bag: &Bag) -> MilResult<Tensor> {
        let values: Vec<f32> = bag.features().iter().copied().collect();
        Ok(Tensor::from_vec(
            values,
            (bag.num_instances(), bag.feature_dim()),
            &self.device,
        )?)
    }
}
