//! Command-level flows: offline edge building and a full training run.

pub mod edges;
pub mod train;

pub use edges::{EdgeSummary, build_edges, run_edges};
pub use train::{TrainingSummary, run_training};
