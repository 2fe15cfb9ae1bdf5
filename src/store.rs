//! Bag persistence: feature, edge and manifest files.

pub mod bag;
pub mod edges;
pub mod features;
pub mod manifest;

use std::path::{Path, PathBuf};

pub use bag::{Bag, encode_label};
pub use manifest::{ManifestEntry, read_manifest, split_train_test};

use crate::graph::{EdgeSet, InstanceGraph};
use crate::util::error::{MilError, MilResult};

/// Location of a bag's edge file for the given edge set.
///
/// Edge directories sit next to the feature directory:
/// `<dataset>/<class>/<bag>.csv` maps to `<dataset>/edges_<k>/edges_<bag>.csv`.
#[must_use]
pub fn edge_path(feature_path: &Path, set: EdgeSet) -> PathBuf {
    let dataset_dir = feature_path
        .parent()
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new(""));
    let file_name = feature_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dataset_dir
        .join(set.dir_name())
        .join(format!("edges_{file_name}"))
}

/// Loads bags and their graphs for a run with fixed feature width and class count.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    feature_dim: usize,
    num_classes: usize,
}

impl FeatureStore {
    #[must_use]
    pub fn new(feature_dim: usize, num_classes: usize) -> Self {
        Self {
            feature_dim,
            num_classes,
        }
    }

    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// # Errors
    /// [`MilError::Data`] for malformed or wrongly sized files, [`MilError::EmptyBag`] for
    /// files without instances, I/O errors for missing files.
    pub fn load_bag(&self, entry: &ManifestEntry) -> MilResult<Bag> {
        let features = features::read_features(&entry.feature_path, Some(self.feature_dim))?;
        Bag::new(
            entry.bag_id(),
            features,
            encode_label(entry.label, self.num_classes),
        )
    }

    /// Reads a bag's persisted edge set.
    ///
    /// # Errors
    /// [`MilError::Data`] when the edge file is missing or inconsistent with the bag.
    pub fn load_graph(
        &self,
        entry: &ManifestEntry,
        bag: &Bag,
        set: EdgeSet,
    ) -> MilResult<InstanceGraph> {
        let path = edge_path(&entry.feature_path, set);
        if !path.exists() {
            return Err(MilError::data(path.display(), "edge file not found"));
        }
        edges::read_edges(&path, bag.num_instances())
    }

    /// # Errors
    /// I/O and CSV errors.
    pub fn save_graph(
        &self,
        entry: &ManifestEntry,
        set: EdgeSet,
        graph: &InstanceGraph,
    ) -> MilResult<PathBuf> {
        let path = edge_path(&entry.feature_path, set);
        edges::write_edges(&path, graph)?;
        Ok(path)
    }
}
