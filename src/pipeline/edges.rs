use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::graph::GraphBuilder;
use crate::observability::Telemetry;
use crate::store::{FeatureStore, ManifestEntry, read_manifest};
use crate::util::error::{MilResult, is_bag_local};

/// Counts of one edge-building pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeSummary {
    pub bags: usize,
    pub files_written: usize,
    pub skipped: usize,
}

/// Builds and writes every edge set of the builder's policy for each bag, in order.
///
/// Bags that fail to load are skipped; write failures abort.
///
/// # Errors
/// Fatal errors from reading bags or writing edge files.
pub fn build_edges(
    entries: &[ManifestEntry],
    store: &FeatureStore,
    builder: &mut GraphBuilder,
    telemetry: &Telemetry,
) -> MilResult<EdgeSummary> {
    let mut summary = EdgeSummary::default();
    for entry in entries {
        let graphs = store.load_bag(entry).and_then(|bag| {
            let timer = telemetry.metrics().graph_build_duration.start_timer();
            let graphs = builder.build(bag.id(), bag.features().view())?;
            timer.observe_duration();
            Ok(graphs)
        });
        let graphs = match graphs {
            Ok(graphs) => graphs,
            Err(error) if is_bag_local(&error) => {
                warn!(
                    bag_id = %entry.bag_id(),
                    path = %entry.feature_path.display(),
                    error = %error,
                    "skipping bag"
                );
                telemetry.metrics().bags_skipped.inc();
                summary.skipped += 1;
                continue;
            }
            Err(error) => return Err(error),
        };

        for (set, graph) in &graphs {
            store.save_graph(entry, *set, graph)?;
            telemetry.metrics().graphs_built.inc();
            summary.files_written += 1;
        }
        summary.bags += 1;
    }
    Ok(summary)
}

/// Edge building for every bag of the configured manifest.
///
/// # Errors
/// Unreadable manifest or any fatal bag error.
pub fn run_edges(config: &Config, telemetry: &Telemetry) -> Result<EdgeSummary> {
    let entries = read_manifest(config.manifest(), config.data_root())
        .with_context(|| format!("failed to read manifest {}", config.manifest().display()))?;
    let store = FeatureStore::new(config.feats_size(), config.num_classes());
    let policy = config.graph_policy();
    info!(bags = entries.len(), policy = ?policy, "building edges");

    let mut builder = GraphBuilder::new(policy, config.seed());
    let summary = build_edges(&entries, &store, &mut builder, telemetry)
        .context("edge building failed")?;
    info!(
        bags = summary.bags,
        files_written = summary.files_written,
        skipped = summary.skipped,
        "edges written"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeSet, GraphPolicy};
    use crate::store::{edge_path, features::write_features};
    use ndarray::Array2;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_bag(root: &Path, name: &str, rows: usize) -> ManifestEntry {
        let path = root.join("dataset").join("1-tumor").join(format!("{name}.csv"));
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        let features = Array2::from_shape_fn((rows, 3), |(i, j)| (i * 3 + j) as f32 * 0.1 + 0.1);
        write_features(&path, features.view()).expect("write features");
        ManifestEntry {
            feature_path: path,
            label: 1.0,
        }
    }

    #[test]
    fn writes_one_file_per_rung_and_skips_missing_bags() {
        let dir = tempdir().expect("tempdir");
        let entries = vec![
            write_bag(dir.path(), "tumor_001", 5),
            ManifestEntry {
                feature_path: dir.path().join("dataset/1-tumor/missing.csv"),
                label: 1.0,
            },
            write_bag(dir.path(), "tumor_002", 3),
        ];
        let store = FeatureStore::new(3, 1);
        let mut builder = GraphBuilder::new(
            GraphPolicy::Knn {
                ladder: vec![1, 2],
                candidate_cap: 8,
            },
            0,
        );
        let telemetry = Telemetry::new().expect("telemetry");

        let summary = build_edges(&entries, &store, &mut builder, &telemetry).expect("edges");

        assert_eq!(
            summary,
            EdgeSummary {
                bags: 2,
                files_written: 4,
                skipped: 1,
            }
        );
        let bag = store.load_bag(&entries[0]).expect("bag");
        let graph = store
            .load_graph(&entries[0], &bag, EdgeSet::Knn(2))
            .expect("graph");
        assert_eq!(graph.edge_count(), 5 * 2);
        assert!(edge_path(&entries[2].feature_path, EdgeSet::Knn(1)).exists());
        assert!((telemetry.metrics().graphs_built.get() - 4.0).abs() < f64::EPSILON);
    }
}
