use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::Serialize;
use tracing::warn;

use super::roc::{auc, has_both_classes, optimal_threshold, roc_curve};

/// Non-fatal condition found while scoring an epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EvaluationWarning {
    /// Only one label value occurs for `class`; its AUC was taken as 1.0.
    UndefinedAuc { class: usize },
}

/// Per-epoch evaluation summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub aucs: Vec<f64>,
    pub thresholds: Vec<f64>,
    /// Share of bags whose binarized prediction equals the label on every class.
    pub accuracy: f64,
    pub mean_loss: f64,
    pub bags: usize,
    pub warnings: Vec<EvaluationWarning>,
}

impl EvaluationReport {
    #[must_use]
    pub fn mean_auc(&self) -> f64 {
        if self.aucs.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = self.aucs.len() as f64;
        self.aucs.iter().sum::<f64>() / count
    }

    /// Average of the mean per-class AUC and the exact-match accuracy.
    #[must_use]
    pub fn composite_score(&self) -> f64 {
        (self.mean_auc() + self.accuracy) / 2.0
    }
}

/// Collects labels and predictions of one evaluation pass.
#[derive(Debug)]
pub struct EvaluationAccumulator {
    num_classes: usize,
    labels: Vec<f32>,
    predictions: Vec<f32>,
    loss_sum: f64,
    bags: usize,
}

impl EvaluationAccumulator {
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            labels: Vec::new(),
            predictions: Vec::new(),
            loss_sum: 0.0,
            bags: 0,
        }
    }

    /// Records one bag. `label` and `prediction` must both have `num_classes` entries.
    pub fn push(&mut self, label: ArrayView1<'_, f32>, prediction: &[f32], loss: f64) {
        debug_assert_eq!(label.len(), self.num_classes);
        debug_assert_eq!(prediction.len(), self.num_classes);
        self.labels.extend(label.iter().copied());
        self.predictions.extend_from_slice(prediction);
        self.loss_sum += loss;
        self.bags += 1;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bags
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bags == 0
    }

    /// Selects per-class thresholds and scores the pass.
    ///
    /// A pass without bags has no AUCs or thresholds and scores 0.
    #[must_use]
    pub fn finalize(&self, prevalence_penalty: f64) -> EvaluationReport {
        if self.bags == 0 {
            return EvaluationReport {
                aucs: Vec::new(),
                thresholds: Vec::new(),
                accuracy: 0.0,
                mean_loss: 0.0,
                bags: 0,
                warnings: Vec::new(),
            };
        }
        let shape = (self.bags, self.num_classes);
        let labels = Array2::from_shape_vec(shape, self.labels.clone())
            .unwrap_or_else(|_| Array2::zeros(shape));
        let predictions = Array2::from_shape_vec(shape, self.predictions.clone())
            .unwrap_or_else(|_| Array2::zeros(shape));

        let mut aucs = Vec::with_capacity(self.num_classes);
        let mut thresholds = Vec::with_capacity(self.num_classes);
        let mut warnings = Vec::new();
        for class in 0..self.num_classes {
            let label = labels.column(class).to_vec();
            let prediction = predictions.column(class).to_vec();
            let curve = roc_curve(&label, &prediction);
            thresholds.push(optimal_threshold(&curve, prevalence_penalty).threshold);
            if has_both_classes(&label) {
                aucs.push(auc(&curve));
            } else {
                warn!(class, bags = self.bags, "only one label value present, AUC taken as 1.0");
                warnings.push(EvaluationWarning::UndefinedAuc { class });
                aucs.push(1.0);
            }
        }

        let threshold_row = Array1::from_vec(thresholds.clone());
        let correct = labels
            .axis_iter(Axis(0))
            .zip(predictions.axis_iter(Axis(0)))
            .filter(|(label, prediction)| {
                binarize(*prediction, threshold_row.view())
                    .iter()
                    .zip(label.iter())
                    .all(|(predicted, actual)| predicted == actual)
            })
            .count();

        #[allow(clippy::cast_precision_loss)]
        let bags = self.bags as f64;
        #[allow(clippy::cast_precision_loss)]
        let accuracy = correct as f64 / bags;
        let mean_loss = self.loss_sum / bags;

        EvaluationReport {
            aucs,
            thresholds,
            accuracy,
            mean_loss,
            bags: self.bags,
            warnings,
        }
    }
}

/// 1.0 where `prediction >= threshold`, else 0.0.
#[must_use]
pub fn binarize(prediction: ArrayView1<'_, f32>, thresholds: ArrayView1<'_, f64>) -> Array1<f32> {
    prediction
        .iter()
        .zip(thresholds.iter())
        .map(|(value, threshold)| if f64::from(*value) >= *threshold { 1.0 } else { 0.0 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn all_negative_single_class_substitutes_auc_and_warns() {
        let mut accumulator = EvaluationAccumulator::new(1);
        for prediction in [0.2_f32, 0.7, 0.4] {
            accumulator.push(arr1(&[0.0]).view(), &[prediction], 0.5);
        }

        let report = accumulator.finalize(0.0);
        assert_eq!(report.aucs, vec![1.0]);
        assert_eq!(report.warnings, vec![EvaluationWarning::UndefinedAuc { class: 0 }]);
        // the +inf threshold predicts every bag negative
        assert!((report.accuracy - 1.0).abs() < f64::EPSILON);
        assert!((report.mean_loss - 0.5).abs() < 1e-12);
    }

    #[test]
    fn separable_classes_score_perfectly() {
        let mut accumulator = EvaluationAccumulator::new(2);
        let bags: [([f32; 2], [f32; 2]); 5] = [
            ([1.0, 0.0], [0.9, 0.2]),
            ([1.0, 0.0], [0.8, 0.1]),
            ([0.0, 1.0], [0.3, 0.7]),
            ([0.0, 1.0], [0.1, 0.95]),
            ([0.0, 0.0], [0.2, 0.3]),
        ];
        for (label, prediction) in bags {
            accumulator.push(arr1(&label).view(), &prediction, 0.1);
        }

        let report = accumulator.finalize(0.0);
        assert_eq!(report.aucs, vec![1.0, 1.0]);
        assert!(report.warnings.is_empty());
        assert!((report.accuracy - 1.0).abs() < f64::EPSILON);
        assert!((report.composite_score() - 1.0).abs() < f64::EPSILON);
        assert_eq!(report.bags, 5);
    }

    #[test]
    fn exact_match_requires_every_class() {
        let mut accumulator = EvaluationAccumulator::new(2);
        accumulator.push(arr1(&[1.0, 0.0]).view(), &[0.9, 0.8], 0.0);
        accumulator.push(arr1(&[0.0, 1.0]).view(), &[0.1, 0.9], 0.0);
        accumulator.push(arr1(&[0.0, 0.0]).view(), &[0.2, 0.1], 0.0);

        let report = accumulator.finalize(0.0);
        // class 1 threshold is 0.9, so the first bag's 0.8 stays negative
        assert!((report.thresholds[1] - 0.9).abs() < 1e-6);
        assert!((report.accuracy - 1.0).abs() < f64::EPSILON);

        let mut accumulator = EvaluationAccumulator::new(2);
        accumulator.push(arr1(&[1.0, 0.0]).view(), &[0.9, 0.95], 0.0);
        accumulator.push(arr1(&[0.0, 1.0]).view(), &[0.1, 0.9], 0.0);
        accumulator.push(arr1(&[0.0, 0.0]).view(), &[0.2, 0.1], 0.0);

        let report = accumulator.finalize(0.0);
        assert!((report.accuracy - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn binarize_includes_the_threshold() {
        let out = binarize(arr1(&[0.5_f32, 0.49]).view(), arr1(&[0.5, 0.5]).view());
        assert_eq!(out, arr1(&[1.0, 0.0]));
    }

    #[test]
    fn empty_pass_has_no_scores() {
        let report = EvaluationAccumulator::new(2).finalize(0.0);
        assert_eq!(report.bags, 0);
        assert!(report.aucs.is_empty());
        assert!(report.thresholds.is_empty());
        assert!(report.warnings.is_empty());
        assert!(report.composite_score().abs() < f64::EPSILON);
    }
}
