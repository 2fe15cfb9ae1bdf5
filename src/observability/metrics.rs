/// Prometheusメトリクス定義。
use prometheus::{
    Counter, Gauge, Histogram, HistogramOpts, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub bags_trained: Counter,
    pub bags_evaluated: Counter,
    pub bags_skipped: Counter,
    pub graphs_built: Counter,
    pub checkpoints_saved: Counter,

    // ヒストグラム
    pub bag_step_duration: Histogram,
    pub graph_build_duration: Histogram,

    // ゲージ
    pub epoch_train_loss: Gauge,
    pub epoch_composite_score: Gauge,
    pub best_composite_score: Gauge,
}

impl Metrics {
    /// # Errors
    /// Fails when a metric with the same name is already registered in `registry`.
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            bags_trained: register_counter_with_registry!(
                "mil_bags_trained_total",
                "Bags that completed a training step",
                registry
            )?,
            bags_evaluated: register_counter_with_registry!(
                "mil_bags_evaluated_total",
                "Bags that completed an evaluation step",
                registry
            )?,
            bags_skipped: register_counter_with_registry!(
                "mil_bags_skipped_total",
                "Bags skipped because of missing or malformed data",
                registry
            )?,
            graphs_built: register_counter_with_registry!(
                "mil_graphs_built_total",
                "Instance graphs constructed",
                registry
            )?,
            checkpoints_saved: register_counter_with_registry!(
                "mil_checkpoints_saved_total",
                "Model checkpoints written",
                registry
            )?,
            bag_step_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "mil_bag_step_duration_seconds",
                    "Forward (and backward) time per bag"
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
                registry
            )?,
            graph_build_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "mil_graph_build_duration_seconds",
                    "Graph construction time per bag"
                )
                .buckets(vec![0.001, 0.01, 0.1, 1.0, 10.0, 60.0]),
                registry
            )?,
            epoch_train_loss: register_gauge_with_registry!(
                "mil_epoch_train_loss",
                "Mean training loss of the last epoch",
                registry
            )?,
            epoch_composite_score: register_gauge_with_registry!(
                "mil_epoch_composite_score",
                "Composite evaluation score of the last epoch",
                registry
            )?,
            best_composite_score: register_gauge_with_registry!(
                "mil_best_composite_score",
                "Best composite evaluation score so far",
                registry
            )?,
        })
    }
}
