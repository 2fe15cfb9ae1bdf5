use ndarray::{Array1, Array2};

use crate::util::error::{MilError, MilResult};

/// One whole-slide image: its patch feature vectors and class-indicator label.
#[derive(Debug, Clone)]
pub struct Bag {
    id: String,
    features: Array2<f32>,
    label: Array1<f32>,
}

impl Bag {
    /// # Errors
    /// Returns [`MilError::EmptyBag`] when `features` has no rows.
    pub fn new(id: impl Into<String>, features: Array2<f32>, label: Array1<f32>) -> MilResult<Self> {
        let id = id.into();
        if features.nrows() == 0 {
            return Err(MilError::EmptyBag { bag_id: id });
        }
        Ok(Self {
            id,
            features,
            label,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// N×K, row order defines node indices.
    #[must_use]
    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    #[must_use]
    pub fn label(&self) -> &Array1<f32> {
        &self.label
    }

    #[must_use]
    pub fn num_instances(&self) -> usize {
        self.features.nrows()
    }

    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.features.ncols()
    }
}

/// Turns a manifest label into a class-indicator vector.
///
/// With one class the raw value is the label. Otherwise the value is a one-hot position;
/// positions outside `0..num_classes` give an all-zero (negative) vector.
#[must_use]
pub fn encode_label(raw: f32, num_classes: usize) -> Array1<f32> {
    let mut label = Array1::zeros(num_classes);
    if num_classes == 1 {
        label[0] = raw;
    } else if raw >= 0.0 && raw.fract() == 0.0 && (raw as usize) < num_classes {
        label[raw as usize] = 1.0;
    }
    label
}
