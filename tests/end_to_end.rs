use std::fs;
use std::path::Path;

use graph_mil::{
    config::Config,
    graph::EdgeSet,
    observability::Telemetry,
    pipeline::{run_edges, run_training},
    store::{edge_path, features::write_features, read_manifest},
};
use ndarray::Array2;
use tempfile::{TempDir, tempdir};

const DIM: usize = 4;

/// Six bags of 5 to 8 instances; positive bags carry one shifted instance.
fn dataset() -> TempDir {
    let dir = tempdir().expect("tempdir");
    let mut manifest = String::from("0,1\n");
    for bag in 0..6_usize {
        let positive = bag % 2 == 1;
        let class_dir = if positive { "1-tumor" } else { "0-normal" };
        let rows = 5 + bag % 4;
        let features = Array2::from_shape_fn((rows, DIM), |(i, j)| {
            let base = 0.1 + ((i * DIM + j + bag) % 7) as f32 * 0.05;
            if positive && i == 0 { base + 2.0 } else { base }
        });
        let relative = format!("dataset/{class_dir}/slide_{bag}.csv");
        write_features(&dir.path().join(&relative), features.view()).expect("features");
        manifest.push_str(&format!("{relative},{}\n", u8::from(positive)));
    }
    fs::write(dir.path().join("manifest.csv"), manifest).expect("manifest");
    dir
}

fn with_config<R>(root: &Path, overrides: &[(&str, &str)], run: impl FnOnce(Config) -> R) -> R {
    let mut vars: Vec<(String, Option<String>)> = vec![
        ("MIL_MANIFEST".into(), Some(root.join("manifest.csv").display().to_string())),
        ("MIL_DATA_ROOT".into(), Some(root.display().to_string())),
        ("MIL_WEIGHTS_DIR".into(), Some(root.join("weights").display().to_string())),
        ("MIL_NUM_CLASSES".into(), Some("1".into())),
        ("MIL_FEATS_SIZE".into(), Some(DIM.to_string())),
        ("MIL_NUM_EPOCHS".into(), Some("3".into())),
        ("MIL_SPLIT".into(), Some("0.5".into())),
        ("MIL_KNN_K".into(), Some("2".into())),
        ("MIL_KNN_LADDER".into(), Some("2,3".into())),
        ("MIL_LR".into(), Some("0.001".into())),
    ];
    for (key, value) in overrides {
        vars.retain(|(existing, _)| existing != key);
        vars.push(((*key).to_string(), Some((*value).to_string())));
    }
    temp_env::with_vars(vars, || run(Config::from_env().expect("config")))
}

#[test]
fn offline_edges_then_training_saves_a_checkpoint() {
    let data = dataset();

    with_config(data.path(), &[], |config| {
        let telemetry = Telemetry::new().expect("telemetry");
        let summary = run_edges(&config, &telemetry).expect("edges");
        assert_eq!(summary.bags, 6);
        assert_eq!(summary.files_written, 12);

        let entries = read_manifest(config.manifest(), config.data_root()).expect("manifest");
        assert!(edge_path(&entries[0].feature_path, EdgeSet::Knn(2)).exists());
        assert!(edge_path(&entries[0].feature_path, EdgeSet::Knn(3)).exists());

        let run = run_training(&config, telemetry.clone()).expect("training");
        assert_eq!(run.epochs.len(), 2);
        for epoch in &run.epochs {
            assert_eq!(epoch.report.bags, 3);
            assert_eq!(epoch.skipped_train + epoch.skipped_test, 0);
            assert!(epoch.train_loss.is_finite());
        }
        let checkpoint = run.checkpoint.expect("first epoch always checkpoints");
        assert!(checkpoint.exists());
        assert!(checkpoint.with_extension("json").exists());

        let exposition = telemetry.render_prometheus();
        assert!(exposition.contains("mil_bags_trained_total 6"));
    });
}

#[test]
fn online_graphs_train_the_pooling_variant() {
    let data = dataset();
    let overrides = [
        ("MIL_BUILD_GRAPHS_ONLINE", "true"),
        ("MIL_AGG_TYPE", "graph"),
        ("MIL_GCN_LAYER_TYPE", "GATConv"),
        ("MIL_GAT_HEADS", "2"),
        ("MIL_N_GCN_LAYERS", "2"),
    ];

    with_config(data.path(), &overrides, |config| {
        let telemetry = Telemetry::new().expect("telemetry");
        let run = run_training(&config, telemetry.clone()).expect("training");
        assert_eq!(run.epochs.len(), 2);
        assert!(run.best_score >= 0.0);
        // 3 train and 3 test bags per epoch, no edge files on disk
        assert!((telemetry.metrics().graphs_built.get() - 12.0).abs() < f64::EPSILON);
    });
}

#[test]
fn missing_edge_files_skip_bags_and_save_nothing() {
    let data = dataset();

    with_config(data.path(), &[], |config| {
        let run = run_training(&config, Telemetry::new().expect("telemetry")).expect("training");
        for epoch in &run.epochs {
            assert_eq!(epoch.skipped_train, 3);
            assert_eq!(epoch.skipped_test, 3);
            assert_eq!(epoch.report.bags, 0);
            assert!(epoch.checkpoint.is_none());
        }
        assert!(run.checkpoint.is_none(), "an untrained model is never the best one");
        assert!(run.best_score.abs() < f64::EPSILON);
    });
}

#[test]
fn warm_start_loads_a_previous_checkpoint() {
    let data = dataset();
    let overrides = [("MIL_N_GCN_LAYERS", "0")];

    let first = with_config(data.path(), &overrides, |config| {
        run_training(&config, Telemetry::new().expect("telemetry")).expect("training")
    });
    let checkpoint = first.checkpoint.expect("checkpoint");
    let init = checkpoint.display().to_string();

    let overrides = [("MIL_N_GCN_LAYERS", "0"), ("MIL_INIT_WEIGHTS", init.as_str())];
    let second = with_config(data.path(), &overrides, |config| {
        run_training(&config, Telemetry::new().expect("telemetry")).expect("training")
    });
    let second_checkpoint = second.checkpoint.expect("checkpoint");
    assert_ne!(checkpoint, second_checkpoint, "runs on the same day get distinct files");
}

#[test]
fn unsupported_convolution_is_rejected_before_training() {
    let data = dataset();

    with_config(data.path(), &[("MIL_GCN_LAYER_TYPE", "SAGEConv")], |config| {
        let error = run_training(&config, Telemetry::new().expect("telemetry"))
            .expect_err("SAGEConv is not implemented");
        assert!(format!("{error:#}").contains("not yet implemented"));
    });
}
