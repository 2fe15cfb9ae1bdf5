use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::model::{ExecutionContext, MilNet};
use crate::observability::Telemetry;
use crate::store::{FeatureStore, read_manifest, split_train_test};
use crate::training::{CheckpointWriter, EpochSummary, Trainer};

/// Outcome of a training run.
#[derive(Debug)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochSummary>,
    pub best_score: f64,
    /// Parameter file of this run; only present once a checkpoint was saved.
    pub checkpoint: Option<PathBuf>,
}

/// Trains on the configured manifest and keeps the best checkpoint.
///
/// # Errors
/// Unreadable manifest, invalid model configuration, unreadable initial weights or any
/// fatal training error.
pub fn run_training(config: &Config, telemetry: Telemetry) -> Result<TrainingSummary> {
    let entries = read_manifest(config.manifest(), config.data_root())
        .with_context(|| format!("failed to read manifest {}", config.manifest().display()))?;
    let (train, test) = split_train_test(entries, config.split());

    let context = ExecutionContext::new(config.device()).context("failed to open device")?;
    let spec = config.model_spec();
    info!(
        layer_type = %spec.layer_type,
        n_layers = spec.n_layers,
        aggregator = ?spec.aggregator,
        device = ?config.device(),
        "building model"
    );
    let mut net = MilNet::new(spec, &context).context("invalid model configuration")?;
    if let Some(path) = config.init_weights() {
        net.load(path)
            .with_context(|| format!("failed to load initial weights {}", path.display()))?;
        info!(path = %path.display(), "initial weights loaded");
    }

    let options = config.training_options();
    let mut checkpoints = CheckpointWriter::today(&options.weights_dir)
        .context("failed to prepare checkpoint directory")?;
    let store = FeatureStore::new(config.feats_size(), config.num_classes());
    let mut trainer = Trainer::new(net, store, options, telemetry)?;

    let epochs = trainer
        .fit(train, test, &mut checkpoints)
        .context("training failed")?;
    let checkpoint = checkpoints.weights_path();
    let checkpoint = checkpoint.exists().then_some(checkpoint);
    info!(
        epochs = epochs.len(),
        best_score = checkpoints.best_score(),
        checkpoint = ?checkpoint,
        "training finished"
    );
    Ok(TrainingSummary {
        epochs,
        best_score: checkpoints.best_score(),
        checkpoint,
    })
}
