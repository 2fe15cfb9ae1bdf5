use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder, linear};

use super::propagate::GraphTensors;
use crate::util::error::{MilError, MilResult};

/// Gated global attention pooling over all nodes of a bag graph.
#[derive(Debug)]
pub struct GraphPoolAggregator {
    gate: Linear,
    head: Linear,
    feature_dim: usize,
}

impl GraphPoolAggregator {
    /// # Errors
    /// Parameter allocation errors.
    pub fn new(feature_dim: usize, num_classes: usize, vb: VarBuilder<'_>) -> MilResult<Self> {
        Ok(Self {
            gate: linear(feature_dim, 1, vb.pp("gate"))?,
            head: linear(feature_dim, num_classes, vb.pp("head"))?,
            feature_dim,
        })
    }

    /// Returns `(logits, pooled)` with shapes `(C,)` and `(K,)`.
    ///
    /// # Errors
    /// [`MilError::EmptyBag`] for zero nodes; [`MilError::ShapeMismatch`] when the
    /// features disagree with the graph or the configured width.
    pub fn aggregate(
        &self,
        bag_id: &str,
        graph: &GraphTensors,
        features: &Tensor,
    ) -> MilResult<(Tensor, Tensor)> {
        let (n, k) = features.dims2()?;
        if n == 0 {
            return Err(MilError::EmptyBag {
                bag_id: bag_id.to_string(),
            });
        }
        if k != self.feature_dim {
            return Err(MilError::shape("pooling features", self.feature_dim, k));
        }
        if n != graph.node_count() {
            return Err(MilError::shape("pooling nodes", graph.node_count(), n));
        }

        let gate = candle_nn::ops::softmax(&self.gate.forward(features)?, 0)?;
        let pooled = features.broadcast_mul(&gate)?.sum(0)?;
        let logits = self.head.forward(&pooled.unsqueeze(0)?)?.squeeze(0)?;
        Ok((logits, pooled))
    }
}
