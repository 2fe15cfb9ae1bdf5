use std::{env, path::PathBuf, str::FromStr};

use thiserror::Error;

use crate::graph::{
    EdgeSet, GraphPolicy,
    builder::{DEFAULT_CANDIDATE_CAP, DEFAULT_KNN_LADDER, DEFAULT_PARTIAL_SAMPLES},
};
use crate::model::{
    AggregatorKind, AttentionOptions, ConvLayerType, DeviceSpec, FeatureSource, ModelSpec,
};
use crate::training::TrainingOptions;

/// Floor of the cosine learning-rate schedule.
const MIN_LEARNING_RATE: f64 = 5e-6;

/// Graph policy named by `MIL_GRAPH_POLICY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyName {
    Full,
    Knn,
    Partial,
}

impl FromStr for PolicyName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "knn" => Ok(Self::Knn),
            "partial" | "random_partial" => Ok(Self::Partial),
            other => Err(format!("unknown graph policy '{other}' (expected full|knn|partial)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    manifest: PathBuf,
    data_root: PathBuf,
    num_classes: usize,
    feats_size: usize,
    lr: f64,
    weight_decay: f64,
    num_epochs: usize,
    split: f64,
    dropout_node: f32,
    non_linearity: bool,
    passing_v: bool,
    average: bool,
    graph_policy: PolicyName,
    knn_k: usize,
    knn_ladder: Vec<usize>,
    knn_candidate_cap: usize,
    partial_samples: usize,
    build_graphs_online: bool,
    gcn_layer_type: ConvLayerType,
    n_gcn_layers: usize,
    gat_heads: usize,
    use_edge_weights: bool,
    agg_type: AggregatorKind,
    query_source: FeatureSource,
    prevalence_penalty: f64,
    weights_dir: PathBuf,
    init_weights: Option<PathBuf>,
    seed: u64,
    device: DeviceSpec,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// Reads the run configuration from `MIL_*` environment variables.
    ///
    /// Only `MIL_MANIFEST` is required; everything else has a default.
    ///
    /// # Errors
    /// [`ConfigError::Missing`] without a manifest, [`ConfigError::Invalid`] for values
    /// that do not parse or are out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let manifest = PathBuf::from(env_var("MIL_MANIFEST")?);
        let data_root = PathBuf::from(env::var("MIL_DATA_ROOT").unwrap_or_else(|_| ".".into()));

        let num_classes = parse_positive("MIL_NUM_CLASSES", 2)?;
        let feats_size = parse_positive("MIL_FEATS_SIZE", 512)?;

        // Optimization
        let lr = parse_f64("MIL_LR", 0.0002)?;
        let weight_decay = parse_f64("MIL_WEIGHT_DECAY", 5e-3)?;
        let num_epochs = parse_usize("MIL_NUM_EPOCHS", 200)?;
        let split = parse_fraction("MIL_SPLIT", 0.2)?;
        #[allow(clippy::cast_possible_truncation)]
        let dropout_node = parse_fraction("MIL_DROPOUT_NODE", 0.0)? as f32;
        let non_linearity = parse_bool("MIL_NON_LINEARITY", true)?;
        let passing_v = parse_bool("MIL_PASSING_V", false)?;
        let average = parse_bool("MIL_AVERAGE", true)?;
        let prevalence_penalty = parse_f64("MIL_PREVALENCE_PENALTY", 0.0)?;

        // Graph construction
        let graph_policy = parse_enum("MIL_GRAPH_POLICY", "knn")?;
        let knn_k = parse_positive("MIL_KNN_K", 8)?;
        let knn_ladder = parse_usize_list("MIL_KNN_LADDER", &DEFAULT_KNN_LADDER)?;
        let knn_candidate_cap = parse_positive("MIL_KNN_CANDIDATE_CAP", DEFAULT_CANDIDATE_CAP)?;
        let partial_samples = parse_positive("MIL_PARTIAL_SAMPLES", DEFAULT_PARTIAL_SAMPLES)?;
        let build_graphs_online = parse_bool("MIL_BUILD_GRAPHS_ONLINE", false)?;

        // Propagation and aggregation
        let gcn_layer_type = parse_enum("MIL_GCN_LAYER_TYPE", "GraphConv")?;
        let n_gcn_layers = parse_usize("MIL_N_GCN_LAYERS", 1)?;
        let gat_heads = parse_positive("MIL_GAT_HEADS", 1)?;
        let use_edge_weights = parse_bool("MIL_USE_EDGE_WEIGHTS", false)?;
        let agg_type = parse_enum("MIL_AGG_TYPE", "dsmil")?;
        let query_source = parse_enum("MIL_QUERY_SOURCE", "propagated")?;

        // Run
        let weights_dir =
            PathBuf::from(env::var("MIL_WEIGHTS_DIR").unwrap_or_else(|_| "weights".into()));
        let init_weights = env::var("MIL_INIT_WEIGHTS")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let seed = parse_u64("MIL_SEED", 0)?;
        let device = parse_enum("MIL_DEVICE", "cpu")?;

        Ok(Self {
            manifest,
            data_root,
            num_classes,
            feats_size,
            lr,
            weight_decay,
            num_epochs,
            split,
            dropout_node,
            non_linearity,
            passing_v,
            average,
            graph_policy,
            knn_k,
            knn_ladder,
            knn_candidate_cap,
            partial_samples,
            build_graphs_online,
            gcn_layer_type,
            n_gcn_layers,
            gat_heads,
            use_edge_weights,
            agg_type,
            query_source,
            prevalence_penalty,
            weights_dir,
            init_weights,
            seed,
            device,
        })
    }

    #[must_use]
    pub fn manifest(&self) -> &PathBuf {
        &self.manifest
    }

    #[must_use]
    pub fn data_root(&self) -> &PathBuf {
        &self.data_root
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[must_use]
    pub fn feats_size(&self) -> usize {
        self.feats_size
    }

    #[must_use]
    pub fn num_epochs(&self) -> usize {
        self.num_epochs
    }

    #[must_use]
    pub fn split(&self) -> f64 {
        self.split
    }

    #[must_use]
    pub fn init_weights(&self) -> Option<&PathBuf> {
        self.init_weights.as_ref()
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn device(&self) -> DeviceSpec {
        self.device
    }

    #[must_use]
    pub fn build_graphs_online(&self) -> bool {
        self.build_graphs_online
    }

    /// Policy used by the edge-building pipeline: the whole ladder for kNN.
    #[must_use]
    pub fn graph_policy(&self) -> GraphPolicy {
        match self.graph_policy {
            PolicyName::Full => GraphPolicy::Full,
            PolicyName::Knn => GraphPolicy::Knn {
                ladder: self.knn_ladder.clone(),
                candidate_cap: self.knn_candidate_cap,
            },
            PolicyName::Partial => GraphPolicy::RandomPartial {
                samples: self.partial_samples,
            },
        }
    }

    /// Edge set a training run reads.
    #[must_use]
    pub fn training_edge_set(&self) -> EdgeSet {
        match self.graph_policy {
            PolicyName::Full => EdgeSet::Full,
            PolicyName::Knn => EdgeSet::Knn(self.knn_k),
            PolicyName::Partial => EdgeSet::Partial,
        }
    }

    #[must_use]
    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            feature_dim: self.feats_size,
            num_classes: self.num_classes,
            layer_type: self.gcn_layer_type,
            n_layers: self.n_gcn_layers,
            gat_heads: self.gat_heads,
            use_edge_weights: self.use_edge_weights,
            aggregator: self.agg_type,
            query_source: self.query_source,
            attention: AttentionOptions {
                nonlinear_query: self.non_linearity,
                passing_value: self.passing_v,
                value_dropout: self.dropout_node,
            },
        }
    }

    #[must_use]
    pub fn training_options(&self) -> TrainingOptions {
        // Online building only needs the one rung the run trains on.
        let online_policy = self.build_graphs_online.then(|| match self.graph_policy() {
            GraphPolicy::Knn { candidate_cap, .. } => GraphPolicy::Knn {
                ladder: vec![self.knn_k],
                candidate_cap,
            },
            other => other,
        });
        TrainingOptions {
            learning_rate: self.lr,
            min_learning_rate: MIN_LEARNING_RATE,
            weight_decay: self.weight_decay,
            num_epochs: self.num_epochs,
            average: self.average,
            prevalence_penalty: self.prevalence_penalty,
            seed: self.seed,
            weights_dir: self.weights_dir.clone(),
            edge_set: self.training_edge_set(),
            online_policy,
        }
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_positive(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let value = parse_usize(name, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("must be greater than zero"),
        });
    }
    Ok(value)
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_fraction(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let value = parse_f64(name, default)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("value must be between 0 and 1"),
        });
    }
    Ok(value)
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}

fn parse_enum<T>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = String>,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::msg(error),
    })
}

fn parse_usize_list(name: &'static str, default: &[usize]) -> Result<Vec<usize>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(default.to_vec());
    };
    let values = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>().map_err(|error| ConfigError::Invalid {
                name,
                source: anyhow::Error::new(error),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() || values.contains(&0) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("expected a comma-separated list of positive integers"),
        });
    }
    Ok(values)
}
