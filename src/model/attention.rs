//! Critical-instance attention.
//!
//! Each class picks the instance the instance classifier scores highest, and every
//! instance is weighted by how similar its query vector is to that critical instance's
//! query. The resulting class-specific attention turns the bag into one K-dimensional row
//! per class, each reduced to a logit by its own weight vector.

use candle_core::{D, Tensor};
use candle_nn::{Dropout, Init, Linear, Module, ModuleT, VarBuilder, linear};

use crate::util::error::{MilError, MilResult};

/// Width of the query space.
pub const QUERY_DIM: usize = 128;

#[derive(Debug)]
enum QueryProjection {
    Linear(Linear),
    /// Linear, ReLU, Linear, Tanh.
    Nonlinear(Linear, Linear),
}

impl QueryProjection {
    fn forward(&self, xs: &Tensor) -> MilResult<Tensor> {
        Ok(match self {
            Self::Linear(fc) => fc.forward(xs)?,
            Self::Nonlinear(first, second) => {
                second.forward(&first.forward(xs)?.relu()?)?.tanh()?
            }
        })
    }
}

#[derive(Debug)]
enum ValueProjection {
    Identity,
    Passing { dropout: Dropout, fc: Linear },
}

impl ValueProjection {
    fn forward(&self, xs: &Tensor, train: bool) -> MilResult<Tensor> {
        Ok(match self {
            Self::Identity => xs.clone(),
            Self::Passing { dropout, fc } => fc.forward(&dropout.forward_t(xs, train)?)?.relu()?,
        })
    }
}

/// Options that shape the aggregator's projections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionOptions {
    /// Two-layer query projection with a tanh output instead of a single linear map.
    pub nonlinear_query: bool,
    /// Learned value projection instead of the identity.
    pub passing_value: bool,
    /// Dropout ahead of the value projection; only used with `passing_value`.
    pub value_dropout: f32,
}

impl Default for AttentionOptions {
    fn default() -> Self {
        Self {
            nonlinear_query: true,
            passing_value: false,
            value_dropout: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct AttentionOutput {
    /// Bag logits, length C.
    pub logits: Tensor,
    /// N×C, every column a distribution over instances.
    pub attention: Tensor,
    /// C×K bag representation.
    pub bag_repr: Tensor,
    /// Critical instance per class.
    pub critical: Vec<usize>,
}

#[derive(Debug)]
pub struct AttentionAggregator {
    query: QueryProjection,
    value: ValueProjection,
    head_weight: Tensor,
    head_bias: Tensor,
    feature_dim: usize,
    num_classes: usize,
}

impl AttentionAggregator {
    /// # Errors
    /// Parameter allocation errors.
    pub fn new(
        feature_dim: usize,
        num_classes: usize,
        options: AttentionOptions,
        vb: VarBuilder<'_>,
    ) -> MilResult<Self> {
        let query = if options.nonlinear_query {
            QueryProjection::Nonlinear(
                linear(feature_dim, QUERY_DIM, vb.pp("query.0"))?,
                linear(QUERY_DIM, QUERY_DIM, vb.pp("query.1"))?,
            )
        } else {
            QueryProjection::Linear(linear(feature_dim, QUERY_DIM, vb.pp("query.0"))?)
        };
        let value = if options.passing_value {
            ValueProjection::Passing {
                dropout: Dropout::new(options.value_dropout),
                fc: linear(feature_dim, feature_dim, vb.pp("value"))?,
            }
        } else {
            ValueProjection::Identity
        };

        #[allow(clippy::cast_precision_loss)]
        let bound = (feature_dim as f64).sqrt().recip();
        let head_init = || Init::Uniform {
            lo: -bound,
            up: bound,
        };
        Ok(Self {
            query,
            value,
            head_weight: vb.get_with_hints((num_classes, feature_dim), "head.weight", head_init())?,
            head_bias: vb.get_with_hints(num_classes, "head.bias", head_init())?,
            feature_dim,
            num_classes,
        })
    }

    /// Aggregates N×K features into bag logits, guided by N×C instance scores.
    ///
    /// # Errors
    /// [`MilError::EmptyBag`] for zero instances; [`MilError::ShapeMismatch`] when the
    /// features or scores disagree with the configured widths or with each other.
    pub fn aggregate(
        &self,
        bag_id: &str,
        features: &Tensor,
        scores: &Tensor,
        train: bool,
    ) -> MilResult<AttentionOutput> {
        let (n, k) = features.dims2()?;
        if n == 0 {
            return Err(MilError::EmptyBag {
                bag_id: bag_id.to_string(),
            });
        }
        if k != self.feature_dim {
            return Err(MilError::shape("attention features", self.feature_dim, k));
        }
        let (score_rows, classes) = scores.dims2()?;
        if score_rows != n || classes != self.num_classes {
            return Err(MilError::shape(
                "attention instance scores",
                format!("{n}x{}", self.num_classes),
                format!("{score_rows}x{classes}"),
            ));
        }

        let critical = critical_instances(&scores.to_vec2::<f32>()?);
        #[allow(clippy::cast_possible_truncation)]
        let critical_ids = Tensor::from_vec(
            critical.iter().map(|&index| index as u32).collect::<Vec<_>>(),
            critical.len(),
            features.device(),
        )?;

        let values = self.value.forward(features, train)?;
        let queries = self.query.forward(features)?;
        let critical_queries = self
            .query
            .forward(&features.index_select(&critical_ids, 0)?)?;

        #[allow(clippy::cast_precision_loss)]
        let scale = (QUERY_DIM as f64).sqrt().recip();
        let raw = queries
            .matmul(&critical_queries.t()?.contiguous()?)?
            .affine(scale, 0.0)?;
        let attention = candle_nn::ops::softmax(&raw, 0)?;

        let bag_repr = attention.t()?.contiguous()?.matmul(&values)?;
        let logits = bag_repr
            .mul(&self.head_weight)?
            .sum(D::Minus1)?
            .add(&self.head_bias)?;

        Ok(AttentionOutput {
            logits,
            attention,
            bag_repr,
            critical,
        })
    }
}

/// Per-class argmax over instances of an N×C score table; ties go to the smaller index.
#[must_use]
pub fn critical_instances(scores: &[Vec<f32>]) -> Vec<usize> {
    let classes = scores.first().map_or(0, Vec::len);
    (0..classes)
        .map(|class| {
            scores
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, best_score), (index, row)| {
                    if row[class] > best_score {
                        (index, row[class])
                    } else {
                        (best, best_score)
                    }
                })
                .0
        })
        .collect()
}
