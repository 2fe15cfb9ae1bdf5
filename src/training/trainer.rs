use std::fmt;
use std::path::PathBuf;

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::{rngs::StdRng, seq::SliceRandom};
use tracing::{debug, info, warn};

use super::checkpoint::CheckpointWriter;
use super::loss::mil_loss;
use super::schedule::CosineAnnealing;
use super::TrainingOptions;
use crate::evaluation::{EvaluationAccumulator, EvaluationReport};
use crate::graph::{GraphBuilder, InstanceGraph};
use crate::model::MilNet;
use crate::observability::Telemetry;
use crate::store::{Bag, FeatureStore, ManifestEntry};
use crate::util::error::{MilError, MilResult, is_bag_local};
use crate::util::rng;

const ADAM_BETA1: f64 = 0.5;
const ADAM_BETA2: f64 = 0.9;

/// Outcome of one epoch.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub skipped_train: usize,
    pub skipped_test: usize,
    pub report: EvaluationReport,
    pub checkpoint: Option<PathBuf>,
}

/// Owns the model and its optimizer; the only place parameters change.
pub struct Trainer {
    net: MilNet,
    optimizer: AdamW,
    schedule: CosineAnnealing,
    store: FeatureStore,
    options: TrainingOptions,
    builder: Option<GraphBuilder>,
    rng: StdRng,
    telemetry: Telemetry,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("net", &self.net)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    /// # Errors
    /// [`MilError::ShapeMismatch`] when the store and the model disagree on widths;
    /// optimizer construction errors.
    pub fn new(
        net: MilNet,
        store: FeatureStore,
        options: TrainingOptions,
        telemetry: Telemetry,
    ) -> MilResult<Self> {
        let spec = net.spec();
        if store.feature_dim() != spec.feature_dim {
            return Err(MilError::shape(
                "store feature dimension",
                spec.feature_dim,
                store.feature_dim(),
            ));
        }
        if store.num_classes() != spec.num_classes {
            return Err(MilError::shape(
                "store class count",
                spec.num_classes,
                store.num_classes(),
            ));
        }

        let optimizer = AdamW::new(
            net.vars(),
            ParamsAdamW {
                lr: options.learning_rate,
                beta1: ADAM_BETA1,
                beta2: ADAM_BETA2,
                weight_decay: options.weight_decay,
                ..Default::default()
            },
        )?;
        let schedule = CosineAnnealing::new(
            options.learning_rate,
            options.min_learning_rate,
            options.num_epochs,
        );
        let builder = options
            .online_policy
            .clone()
            .map(|policy| GraphBuilder::new(policy, options.seed));

        Ok(Self {
            net,
            optimizer,
            schedule,
            store,
            rng: rng::stream(options.seed, 0x7368_7566),
            options,
            builder,
            telemetry,
        })
    }

    #[must_use]
    pub fn net(&self) -> &MilNet {
        &self.net
    }

    /// One forward/backward pass and parameter update. Returns the loss.
    ///
    /// # Errors
    /// Forward errors for this bag, optimizer errors.
    pub fn train_step(&mut self, bag: &Bag, graph: Option<&InstanceGraph>) -> MilResult<f64> {
        let output = self.net.forward(bag, graph, true)?;
        let loss = mil_loss(&output, &self.targets(bag)?)?;
        self.optimizer.backward_step(&loss)?;
        Ok(f64::from(loss.to_scalar::<f32>()?))
    }

    /// Forward pass without update. Returns the loss and per-class probabilities.
    ///
    /// # Errors
    /// Forward errors for this bag.
    pub fn eval_step(&self, bag: &Bag, graph: Option<&InstanceGraph>) -> MilResult<(f64, Vec<f32>)> {
        let output = self.net.forward(bag, graph, false)?;
        let loss = mil_loss(&output, &self.targets(bag)?)?;

        let bag_probs = sigmoid(&output.bag_logits.to_vec1::<f32>()?);
        let prediction = if self.options.average {
            let max_probs = sigmoid(&output.max_instance_logits()?.to_vec1::<f32>()?);
            max_probs
                .iter()
                .zip(&bag_probs)
                .map(|(max, bag)| 0.5 * max + 0.5 * bag)
                .collect()
        } else {
            bag_probs
        };
        Ok((f64::from(loss.to_scalar::<f32>()?), prediction))
    }

    /// Trains on every bag once, in the given order. Returns `(mean loss, skipped bags)`.
    ///
    /// # Errors
    /// Fatal errors only; bag-local errors skip the bag.
    pub fn train_epoch(&mut self, entries: &[ManifestEntry]) -> MilResult<(f64, usize)> {
        let mut loss_sum = 0.0;
        let mut trained = 0_usize;
        let mut skipped = 0;
        for entry in entries {
            let timer = self.telemetry.metrics().bag_step_duration.start_timer();
            let step = self
                .load(entry)
                .and_then(|(bag, graph)| self.train_step(&bag, graph.as_ref()));
            match step {
                Ok(loss) => {
                    timer.observe_duration();
                    self.telemetry.metrics().bags_trained.inc();
                    debug!(bag_id = %entry.bag_id(), loss, "train step");
                    loss_sum += loss;
                    trained += 1;
                }
                Err(error) => {
                    timer.stop_and_discard();
                    self.skip_or_abort(entry, error)?;
                    skipped += 1;
                }
            }
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = if trained == 0 { 0.0 } else { loss_sum / trained as f64 };
        Ok((mean, skipped))
    }

    /// Scores every bag. Returns the report and the number of skipped bags.
    ///
    /// # Errors
    /// Fatal errors only; bag-local errors skip the bag.
    pub fn evaluate(&mut self, entries: &[ManifestEntry]) -> MilResult<(EvaluationReport, usize)> {
        let mut accumulator = EvaluationAccumulator::new(self.store.num_classes());
        let mut skipped = 0;
        for entry in entries {
            let step = self.load(entry).and_then(|(bag, graph)| {
                let (loss, prediction) = self.eval_step(&bag, graph.as_ref())?;
                Ok((bag, loss, prediction))
            });
            match step {
                Ok((bag, loss, prediction)) => {
                    self.telemetry.metrics().bags_evaluated.inc();
                    accumulator.push(bag.label().view(), &prediction, loss);
                }
                Err(error) => {
                    self.skip_or_abort(entry, error)?;
                    skipped += 1;
                }
            }
        }
        Ok((accumulator.finalize(self.options.prevalence_penalty), skipped))
    }

    /// Runs epochs `1..num_epochs`, shuffling both sets each epoch and keeping the
    /// best checkpoint.
    ///
    /// # Errors
    /// Fatal errors from any step or checkpoint write.
    pub fn fit(
        &mut self,
        mut train: Vec<ManifestEntry>,
        mut test: Vec<ManifestEntry>,
        checkpoints: &mut CheckpointWriter,
    ) -> MilResult<Vec<EpochSummary>> {
        info!(
            train_bags = train.len(),
            test_bags = test.len(),
            epochs = self.options.num_epochs.saturating_sub(1),
            "training started"
        );
        let mut summaries = Vec::new();
        for epoch in 1..self.options.num_epochs {
            let learning_rate = self.schedule.lr_at(epoch - 1);
            self.optimizer.set_learning_rate(learning_rate);
            train.shuffle(&mut self.rng);
            test.shuffle(&mut self.rng);

            let (train_loss, skipped_train) = self.train_epoch(&train)?;
            let (report, skipped_test) = self.evaluate(&test)?;
            let checkpoint = checkpoints.offer(&self.net, epoch, &report)?;

            let metrics = self.telemetry.metrics();
            metrics.epoch_train_loss.set(train_loss);
            metrics.epoch_composite_score.set(report.composite_score());
            metrics.best_composite_score.set(checkpoints.best_score());
            if checkpoint.is_some() {
                metrics.checkpoints_saved.inc();
            }

            info!(
                epoch,
                num_epochs = self.options.num_epochs,
                learning_rate,
                train_loss,
                test_loss = report.mean_loss,
                accuracy = report.accuracy,
                aucs = ?report.aucs,
                composite_score = report.composite_score(),
                skipped_train,
                skipped_test,
                "epoch finished"
            );
            summaries.push(EpochSummary {
                epoch,
                learning_rate,
                train_loss,
                skipped_train,
                skipped_test,
                report,
                checkpoint,
            });
        }
        Ok(summaries)
    }

    /// Loads a bag and, when the model needs one, its graph.
    fn load(&mut self, entry: &ManifestEntry) -> MilResult<(Bag, Option<InstanceGraph>)> {
        let bag = self.store.load_bag(entry)?;
        if !self.net.spec().requires_graph() {
            return Ok((bag, None));
        }
        let graph = match self.builder.as_mut() {
            Some(builder) => {
                let timer = self.telemetry.metrics().graph_build_duration.start_timer();
                let wanted = self.options.edge_set;
                let graph = builder
                    .build(bag.id(), bag.features().view())?
                    .into_iter()
                    .find_map(|(set, graph)| (set == wanted).then_some(graph))
                    .ok_or_else(|| MilError::data(bag.id(), format!("policy does not build {wanted}")))?;
                timer.observe_duration();
                self.telemetry.metrics().graphs_built.inc();
                graph
            }
            None => self.store.load_graph(entry, &bag, self.options.edge_set)?,
        };
        Ok((bag, Some(graph)))
    }

    fn skip_or_abort(&self, entry: &ManifestEntry, error: MilError) -> MilResult<()> {
        if !is_bag_local(&error) {
            return Err(error);
        }
        warn!(
            bag_id = %entry.bag_id(),
            path = %entry.feature_path.display(),
            error = %error,
            "skipping bag"
        );
        self.telemetry.metrics().bags_skipped.inc();
        Ok(())
    }

    fn targets(&self, bag: &Bag) -> MilResult<Tensor> {
        Ok(Tensor::from_vec(
            bag.label().to_vec(),
            bag.label().len(),
            self.net.device(),
        )?)
    }
}

fn sigmoid(logits: &[f32]) -> Vec<f32> {
    logits.iter().map(|x| 1.0 / (1.0 + (-x).exp())).collect()
}
