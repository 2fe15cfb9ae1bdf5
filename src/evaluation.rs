//! Epoch scoring: per-class ROC analysis, thresholds and exact-match accuracy.

pub mod metrics;
pub mod roc;

pub use metrics::{EvaluationAccumulator, EvaluationReport, EvaluationWarning, binarize};
pub use roc::{OperatingPoint, RocCurve, auc, optimal_threshold, roc_curve};
