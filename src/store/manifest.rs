//! Bag manifest: one row per bag with its feature file and label.

use std::path::{Path, PathBuf};

use csv::ReaderBuilder;

use crate::util::error::{MilError, MilResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub feature_path: PathBuf,
    /// Class position, or the label itself for single-class runs.
    pub label: f32,
}

impl ManifestEntry {
    /// Bag identifier: the feature file name without extension.
    #[must_use]
    pub fn bag_id(&self) -> String {
        self.feature_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Reads the manifest; relative feature paths are resolved against `data_root`.
///
/// # Errors
/// [`MilError::Data`] when a row lacks a path or label, or the label is not numeric.
pub fn read_manifest(path: &Path, data_root: &Path) -> MilResult<Vec<ManifestEntry>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut entries = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let raw_path = record
            .get(0)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| MilError::data(path.display(), format!("row {row}: missing path")))?;
        let label = record
            .get(1)
            .map(str::trim)
            .ok_or_else(|| MilError::data(path.display(), format!("row {row}: missing label")))?
            .parse::<f32>()
            .map_err(|error| MilError::data(path.display(), format!("row {row}: {error}")))?;

        let feature_path = PathBuf::from(raw_path);
        let feature_path = if feature_path.is_absolute() {
            feature_path
        } else {
            data_root.join(feature_path)
        };
        entries.push(ManifestEntry {
            feature_path,
            label,
        });
    }
    Ok(entries)
}

/// Splits the manifest in file order: the first `(1 - split)` share trains.
#[must_use]
pub fn split_train_test(
    entries: Vec<ManifestEntry>,
    split: f64,
) -> (Vec<ManifestEntry>, Vec<ManifestEntry>) {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let train_len = ((entries.len() as f64) * (1.0 - split)) as usize;
    let mut train = entries;
    let test = train.split_off(train_len.min(train.len()));
    (train, test)
}
