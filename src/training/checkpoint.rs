use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::evaluation::EvaluationReport;
use crate::model::MilNet;
use crate::util::error::MilResult;

const WEIGHTS_EXTENSION: &str = "safetensors";

/// JSON written next to every saved parameter file.
#[derive(Debug, Serialize)]
struct CheckpointRecord<'a> {
    epoch: usize,
    composite_score: f64,
    accuracy: f64,
    aucs: &'a [f64],
    thresholds: &'a [f64],
    saved_at: DateTime<Utc>,
}

/// Keeps the best-scoring parameters of one run at `<weights_dir>/<MMDDYYYY>/<run>`.
#[derive(Debug)]
pub struct CheckpointWriter {
    dir: PathBuf,
    run: usize,
    best_score: f64,
}

impl CheckpointWriter {
    /// Run number is one past the number of checkpoints already in the day's directory.
    ///
    /// # Errors
    /// I/O errors creating or listing the directory.
    pub fn new(weights_dir: &Path, date: NaiveDate) -> MilResult<Self> {
        let dir = weights_dir.join(date.format("%m%d%Y").to_string());
        fs::create_dir_all(&dir)?;
        let existing = fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .filter(|entry| {
                entry.path().extension().and_then(|ext| ext.to_str()) == Some(WEIGHTS_EXTENSION)
            })
            .count();
        Ok(Self {
            dir,
            run: existing + 1,
            best_score: 0.0,
        })
    }

    /// # Errors
    /// See [`CheckpointWriter::new`].
    pub fn today(weights_dir: &Path) -> MilResult<Self> {
        Self::new(weights_dir, Local::now().date_naive())
    }

    #[must_use]
    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{WEIGHTS_EXTENSION}", self.run))
    }

    #[must_use]
    pub fn record_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.run))
    }

    #[must_use]
    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    /// Saves `net` when the report's composite score ties or beats the best so far.
    /// Reports without evaluated bags are never saved.
    ///
    /// # Errors
    /// I/O and serialization errors.
    pub fn offer(
        &mut self,
        net: &MilNet,
        epoch: usize,
        report: &EvaluationReport,
    ) -> MilResult<Option<PathBuf>> {
        if report.bags == 0 {
            warn!(epoch, "no bags evaluated, checkpoint not considered");
            return Ok(None);
        }
        let score = report.composite_score();
        if score < self.best_score {
            return Ok(None);
        }
        self.best_score = score;

        let path = self.weights_path();
        net.save(&path)?;
        let record = CheckpointRecord {
            epoch,
            composite_score: score,
            accuracy: report.accuracy,
            aucs: &report.aucs,
            thresholds: &report.thresholds,
            saved_at: Utc::now(),
        };
        fs::write(self.record_path(), serde_json::to_vec_pretty(&record)?)?;
        info!(
            path = %path.display(),
            epoch,
            composite_score = score,
            thresholds = ?report.thresholds,
            "best model saved"
        );
        Ok(Some(path))
    }
}
