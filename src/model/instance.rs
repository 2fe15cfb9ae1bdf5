use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder, linear};

use crate::util::error::{MilError, MilResult};

/// Per-instance linear scorer: N×K features to N×C class scores.
#[derive(Debug)]
pub struct InstanceClassifier {
    fc: Linear,
    feature_dim: usize,
}

impl InstanceClassifier {
    /// # Errors
    /// Parameter allocation errors.
    pub fn new(feature_dim: usize, num_classes: usize, vb: VarBuilder<'_>) -> MilResult<Self> {
        Ok(Self {
            fc: linear(feature_dim, num_classes, vb.pp("fc"))?,
            feature_dim,
        })
    }

    /// # Errors
    /// [`MilError::ShapeMismatch`] when the feature width differs from the layer's input.
    pub fn score(&self, features: &Tensor) -> MilResult<Tensor> {
        let (_, k) = features.dims2()?;
        if k != self.feature_dim {
            return Err(MilError::shape("instance classifier input", self.feature_dim, k));
        }
        Ok(self.fc.forward(features)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn scores_every_instance_for_every_class() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let classifier = InstanceClassifier::new(6, 2, vb).expect("classifier");

        let features = Tensor::ones((4, 6), DType::F32, &Device::Cpu).expect("features");
        let scores = classifier.score(&features).expect("scores");
        assert_eq!(scores.dims(), &[4, 2]);

        let narrow = Tensor::ones((4, 5), DType::F32, &Device::Cpu).expect("features");
        assert!(matches!(
            classifier.score(&narrow),
            Err(MilError::ShapeMismatch { .. })
        ));
    }
}
