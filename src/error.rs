// ============================================================
// Error Taxonomy
// ============================================================
// Every failure in this crate is fatal for the run. The variants
// group failures by where they come from so the CLI can report
// them before (config) or during (numeric, I/O) training:
//
//   Config / MissingCheckpoint:       reported before any step
//   EmptyTrainingSet / Shape / ...:   numeric and data errors
//   Io / Checkpoint:                  disk failures, not retried
//
// The application layer wraps these in anyhow::Error with
// file-path context.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("checkpoint not found at '{}'", .0.display())]
    MissingCheckpoint(PathBuf),

    #[error("training set produced no batches; mean loss is undefined")]
    EmptyTrainingSet,

    #[error("validation set produced no batches; mean loss is undefined")]
    EmptyValidationSet,

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("metric error: {0}")]
    Metric(String),

    #[error("collective operation failed: {0}")]
    Collective(String),

    #[error("checkpoint format error: {0}")]
    Checkpoint(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("model error: {0}")]
    Model(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl TrainError {
    /// True for errors that are detected before the first training step.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            TrainError::Config(_)
                | TrainError::MissingCheckpoint(_)
                | TrainError::EmptyTrainingSet
                | TrainError::EmptyValidationSet
                | TrainError::Yaml(_)
        )
    }
}
