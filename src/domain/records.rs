// ============================================================
// Layer 3 — Epoch Records and Prediction Buffer
// ============================================================
// EpochMetricRecord is exactly one JSON line in a metric log:
//   {"epoch": 3, "loss": 0.41, "acc": 0.83, "auroc": 0.91}
//
// PredictionBuffer holds every (score, label) pair seen in one
// epoch so accuracy and AUROC are computed over the whole epoch
// rather than averaged per batch.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// One line of `epoch_train.jsonl` or `epoch_valid.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetricRecord {
    pub epoch: usize,
    pub loss: f64,
    pub acc: f64,
    pub auroc: f64,
}

impl EpochMetricRecord {
    pub fn new(epoch: usize, loss: f64, acc: f64, auroc: f64) -> Self {
        Self { epoch, loss, acc, auroc }
    }
}

/// Which loop produced a record; selects the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Valid,
}

impl Phase {
    pub fn log_file_name(self) -> &'static str {
        match self {
            Phase::Train => "epoch_train.jsonl",
            Phase::Valid => "epoch_valid.jsonl",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Train => "Train",
            Phase::Valid => "Valid",
        }
    }
}

/// Ordered (score, ground-truth) pairs for one epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionBuffer {
    scores: Vec<f32>,
    labels: Vec<bool>,
}

impl PredictionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one batch; scores and labels must line up.
    pub fn extend(&mut self, scores: &[f32], labels: &[bool]) -> Result<()> {
        if scores.len() != labels.len() {
            return Err(TrainError::Metric(format!(
                "batch has {} scores but {} labels",
                scores.len(),
                labels.len()
            )));
        }
        self.scores.extend_from_slice(scores);
        self.labels.extend_from_slice(labels);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn labels(&self) -> &[bool] {
        &self.labels
    }

    /// Labels as 0.0 / 1.0 so they can cross a float-only collective.
    pub fn labels_as_f32(&self) -> Vec<f32> {
        self.labels
            .iter()
            .map(|&l| if l { 1.0 } else { 0.0 })
            .collect()
    }

    /// Rebuild a buffer from gathered float scores and float labels.
    pub fn from_gathered(scores: Vec<f32>, labels: &[f32]) -> Result<Self> {
        let labels: Vec<bool> = labels.iter().map(|&l| l > 0.5).collect();
        let mut buffer = Self::new();
        buffer.extend(&scores, &labels)?;
        Ok(buffer)
    }
}
