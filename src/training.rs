//! Optimization loop: loss, learning-rate schedule, checkpoints and the trainer.

pub mod checkpoint;
pub mod loss;
pub mod schedule;
pub mod trainer;

use std::path::PathBuf;

pub use checkpoint::CheckpointWriter;
pub use loss::{bce_with_logits, mil_loss};
pub use schedule::CosineAnnealing;
pub use trainer::{EpochSummary, Trainer};

use crate::graph::{EdgeSet, GraphPolicy};

/// Run-level settings of the optimization loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOptions {
    pub learning_rate: f64,
    /// Floor of the cosine schedule.
    pub min_learning_rate: f64,
    pub weight_decay: f64,
    pub num_epochs: usize,
    /// Predict with the mean of the max-instance and bag probabilities.
    pub average: bool,
    pub prevalence_penalty: f64,
    pub seed: u64,
    pub weights_dir: PathBuf,
    /// Edge set the model consumes.
    pub edge_set: EdgeSet,
    /// When set, graphs are built per bag instead of read from edge files.
    pub online_policy: Option<GraphPolicy>,
}
