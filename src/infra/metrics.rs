// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Appends one JSON object per epoch to a per-phase log file:
//
//   {run_dir}/epoch_train.jsonl
//   {run_dir}/epoch_valid.jsonl
//
// Example line:
//   {"epoch":0,"loss":0.6931,"acc":0.5,"auroc":0.5}
//
// Files are only ever opened in append mode, so a resumed run
// continues the same log. Records are read back on resume to
// recover the best validation accuracy seen so far.

use std::{
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use crate::domain::records::{EpochMetricRecord, Phase};
use crate::error::{Result, TrainError};

/// Appends epoch records to JSON-lines files in a run directory.
#[derive(Debug, Clone)]
pub struct MetricsLogger {
    dir: PathBuf,
}

impl MetricsLogger {
    /// Creates the run directory if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, phase: Phase) -> PathBuf {
        self.dir.join(phase.log_file_name())
    }

    /// Append one record as a single line.
    pub fn append(&self, phase: Phase, record: &EpochMetricRecord) -> Result<()> {
        let path = self.path(phase);
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        f.write_all(line.as_bytes())?;
        f.flush()?;

        tracing::debug!(
            phase = phase.label(),
            epoch = record.epoch,
            path = %path.display(),
            "appended metric record"
        );
        Ok(())
    }

    /// All records of one phase in file order; a missing file reads as empty.
    pub fn read_records(&self, phase: Phase) -> Result<Vec<EpochMetricRecord>> {
        read_log(&self.path(phase))
    }
}

/// Parse a metric log file; a missing file reads as empty.
pub fn read_log(path: &Path) -> Result<Vec<EpochMetricRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut records = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            TrainError::Checkpoint(format!("{}:{}: {e}", path.display(), n + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Best validation accuracy among records with `epoch <= last_epoch`.
pub fn best_accuracy_up_to(records: &[EpochMetricRecord], last_epoch: usize) -> f64 {
    records
        .iter()
        .filter(|r| r.epoch <= last_epoch)
        .map(|r| r.acc)
        .fold(0.0, f64::max)
}
