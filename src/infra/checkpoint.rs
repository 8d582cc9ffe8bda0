// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Produces the initial RunState and persists best-so-far state.
//
// Files in a run directory:
//   pytorch_model.bin:  model parameters plus "optimizer.*"
//                       entries, as one safetensors file
//   epoch.pt:           JSON list holding the last saved epoch,
//                       e.g. [4]
//   best.txt:           human-readable summary of the best epoch
//
// Save order is best.txt → pytorch_model.bin → epoch.pt, so the
// epoch marker never points past the weights on disk.
//
// Fresh start reads a pretraining checkpoint and resamples its
// positional embedding when the lengths differ. Resume reads a
// run directory and continues at the epoch after the marker.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::domain::params::StateDict;
use crate::domain::records::Phase;
use crate::domain::run_state::{RunState, StartMode};
use crate::domain::traits::{ClassificationModel, Optimizer};
use crate::error::{Result, TrainError};
use crate::infra::metrics::{best_accuracy_up_to, read_log};
use crate::infra::state_dict::{
    load_state_dict, save_state_dict, strip_prefix, without_prefix, write_atomic,
};
use crate::ml::interpolate::adapt_state_embedding;

pub const MODEL_FILE: &str = "pytorch_model.bin";
pub const EPOCH_FILE: &str = "epoch.pt";
pub const BEST_FILE:  &str = "best.txt";

const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Reads and writes the checkpoint files of one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn epoch_path(&self) -> PathBuf {
        self.dir.join(EPOCH_FILE)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_FILE)
    }

    /// Load weights for the chosen start mode and return the loop state.
    pub fn load_initial_state<M, O>(
        &self,
        start:     &StartMode,
        model:     &mut M,
        optimizer: &mut O,
    ) -> Result<RunState>
    where
        M: ClassificationModel + ?Sized,
        O: Optimizer + ?Sized,
    {
        match start {
            StartMode::FreshStart { pretrained_checkpoint } => {
                load_pretrained(pretrained_checkpoint, model)?;
                Ok(RunState::fresh())
            }
            StartMode::Resume { checkpoint_dir } => {
                resume_from(checkpoint_dir, model, optimizer)
            }
        }
    }

    /// Persist the current weights if `accuracy` strictly beats the best so far.
    ///
    /// Every worker updates `state`; only the primary worker writes files.
    /// Returns whether this epoch was an improvement.
    pub fn save_if_improved<M, O>(
        &self,
        state:      &mut RunState,
        model:      &M,
        optimizer:  &O,
        accuracy:   f64,
        auroc:      f64,
        is_primary: bool,
    ) -> Result<bool>
    where
        M: ClassificationModel + ?Sized,
        O: Optimizer + ?Sized,
    {
        if !state.is_improvement(accuracy) {
            return Ok(false);
        }
        state.best_validation_accuracy = accuracy;
        if !is_primary {
            return Ok(true);
        }

        let epoch = state.current_epoch;
        fs::create_dir_all(&self.dir)?;

        let summary = format!("best epoch {epoch} with valid_acc: {accuracy} and valid_auroc: {auroc}");
        write_atomic(&self.best_path(), summary.as_bytes())?;

        let mut blob = model.params().to_state_dict();
        for (key, tensor) in optimizer.state_dict() {
            blob.insert(format!("{OPTIMIZER_PREFIX}{key}"), tensor);
        }
        let metadata = HashMap::from([
            ("epoch".to_string(), epoch.to_string()),
            ("valid_acc".to_string(), accuracy.to_string()),
        ]);
        save_state_dict(&self.model_path(), &blob, metadata)?;

        write_epoch_marker(&self.epoch_path(), epoch)?;

        tracing::info!(epoch, accuracy, auroc, dir = %self.dir.display(), "saved new best checkpoint");
        Ok(true)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

fn load_model_params<M>(model: &mut M, state: &StateDict) -> Result<()>
where
    M: ClassificationModel + ?Sized,
{
    let unexpected = model.params_mut().load_state_dict(state)?;
    if !unexpected.is_empty() {
        tracing::warn!(?unexpected, "checkpoint has tensors the model does not use");
    }
    Ok(())
}

fn load_pretrained<M>(path: &Path, model: &mut M) -> Result<()>
where
    M: ClassificationModel + ?Sized,
{
    tracing::info!(path = %path.display(), "loading pretrained weights");
    let mut state = without_prefix(&load_state_dict(path)?, OPTIMIZER_PREFIX);

    let key = model.positional_embedding_key().to_string();
    if state.contains_key(&key) {
        adapt_state_embedding(&mut state, &key, model.positional_embedding_len())?;
    }
    load_model_params(model, &state)
}

fn resume_from<M, O>(dir: &Path, model: &mut M, optimizer: &mut O) -> Result<RunState>
where
    M: ClassificationModel + ?Sized,
    O: Optimizer + ?Sized,
{
    tracing::info!(dir = %dir.display(), "resuming from checkpoint directory");
    let blob = load_state_dict(&dir.join(MODEL_FILE))?;
    load_model_params(model, &without_prefix(&blob, OPTIMIZER_PREFIX))?;

    let optimizer_state = strip_prefix(&blob, OPTIMIZER_PREFIX);
    if optimizer_state.is_empty() {
        tracing::warn!("checkpoint has no optimizer state; optimizer starts fresh");
    } else {
        optimizer.load_state_dict(&optimizer_state)?;
    }

    let Some(stored) = read_epoch_marker(&dir.join(EPOCH_FILE))? else {
        tracing::info!("no epoch marker found; starting at epoch 0");
        return Ok(RunState::fresh());
    };

    let records = read_log(&dir.join(Phase::Valid.log_file_name()))?;
    let best = best_accuracy_up_to(&records, stored);
    tracing::info!(stored_epoch = stored, best_accuracy = best, "resuming at epoch {}", stored + 1);
    Ok(RunState::resumed(stored + 1, best))
}

// ─── Epoch Marker ────────────────────────────────────────────────────────────

pub fn read_epoch_marker(path: &Path) -> Result<Option<usize>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    let marker: Vec<usize> = serde_json::from_str(&text)?;
    match marker.as_slice() {
        [epoch] => Ok(Some(*epoch)),
        _ => Err(TrainError::Checkpoint(format!(
            "'{}' should hold exactly one epoch, found {marker:?}",
            path.display()
        ))),
    }
}

fn write_epoch_marker(path: &Path, epoch: usize) -> Result<()> {
    write_atomic(path, serde_json::to_string(&[epoch])?.as_bytes())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::records::EpochMetricRecord;
    use crate::infra::metrics::MetricsLogger;
    use crate::ml::model::{ExpertFusionConfig, POS_EMBED_KEY};
    use crate::ml::optimizer::{AdamW, AdamWConfig};
    use ndarray::Array2;

    fn model(num_experts: usize) -> crate::ml::model::ExpertFusionClassifier {
        ExpertFusionConfig::new(num_experts, 3).init(1)
    }

    fn optimizer() -> AdamW {
        AdamW::new(AdamWConfig::default())
    }

    #[test]
    fn test_missing_pretrained_checkpoint_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(dir.path());
        let start = StartMode::FreshStart {
            pretrained_checkpoint: dir.path().join("nope.bin"),
        };
        let err = ckpt
            .load_initial_state(&start, &mut model(4), &mut optimizer())
            .unwrap_err();
        assert!(matches!(err, TrainError::MissingCheckpoint(_)));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_fresh_start_interpolates_positional_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let pretrained = dir.path().join("pretrain").join(MODEL_FILE);

        let mut state = model(2).params().to_state_dict();
        let short = Array2::from_shape_fn((2, 3), |(i, d)| (i * 3 + d) as f32);
        state.insert(POS_EMBED_KEY.into(), short.clone().into_dyn());
        state.insert("optimizer.step".into(), ndarray::ArrayD::zeros(ndarray::IxDyn(&[1])));
        save_state_dict(&pretrained, &state, HashMap::new()).unwrap();

        let mut target = model(4);
        let run = CheckpointManager::new(dir.path().join("run"))
            .load_initial_state(
                &StartMode::FreshStart { pretrained_checkpoint: pretrained },
                &mut target,
                &mut optimizer(),
            )
            .unwrap();

        assert_eq!(run, RunState::fresh());
        let pos = target.params().get(POS_EMBED_KEY).unwrap();
        assert_eq!(pos.shape(), &[4, 3]);
        assert_eq!(pos[[0, 2]], short[[0, 2]]);
        assert_eq!(pos[[3, 1]], short[[1, 1]]);
    }

    #[test]
    fn test_save_only_on_strict_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(dir.path());
        let (m, o) = (model(2), optimizer());
        let mut state = RunState::resumed(3, 0.0);

        assert!(ckpt.save_if_improved(&mut state, &m, &o, 0.5, 0.6, true).unwrap());
        assert_eq!(state.best_validation_accuracy, 0.5);
        assert_eq!(read_epoch_marker(&ckpt.epoch_path()).unwrap(), Some(3));
        assert_eq!(
            fs::read_to_string(ckpt.best_path()).unwrap(),
            "best epoch 3 with valid_acc: 0.5 and valid_auroc: 0.6"
        );

        state.advance();
        assert!(!ckpt.save_if_improved(&mut state, &m, &o, 0.5, 0.9, true).unwrap());
        assert_eq!(read_epoch_marker(&ckpt.epoch_path()).unwrap(), Some(3));
    }

    #[test]
    fn test_non_primary_tracks_best_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(dir.path().join("run"));
        let mut state = RunState::fresh();
        let saved = ckpt
            .save_if_improved(&mut state, &model(2), &optimizer(), 0.7, 0.5, false)
            .unwrap();
        assert!(saved);
        assert_eq!(state.best_validation_accuracy, 0.7);
        assert!(!ckpt.model_path().exists());
        assert!(!ckpt.epoch_path().exists());
    }

    #[test]
    fn test_resume_continues_after_marker_and_rederives_best() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(dir.path());
        let logger = MetricsLogger::new(dir.path()).unwrap();
        for (epoch, acc) in [(0, 0.6), (1, 0.75), (2, 0.7), (3, 0.9)] {
            logger
                .append(Phase::Valid, &EpochMetricRecord::new(epoch, 0.5, acc, 0.5))
                .unwrap();
        }

        let m = model(2);
        let mut o = optimizer();
        let mut params = m.params().clone();
        params.grad_mut(POS_EMBED_KEY).unwrap().fill(0.1);
        o.step(&mut params).unwrap();

        let mut state = RunState::resumed(1, 0.6);
        ckpt.save_if_improved(&mut state, &m, &o, 0.75, 0.5, true).unwrap();

        let mut restored = ExpertFusionConfig::new(2, 3).init(99);
        let mut restored_opt = optimizer();
        let run = ckpt
            .load_initial_state(
                &StartMode::Resume { checkpoint_dir: dir.path().to_path_buf() },
                &mut restored,
                &mut restored_opt,
            )
            .unwrap();

        assert_eq!(run.current_epoch, 2);
        assert_eq!(run.best_validation_accuracy, 0.75);
        assert_eq!(restored.params().to_state_dict(), m.params().to_state_dict());
        assert_eq!(restored_opt.state_dict(), o.state_dict());
    }

    #[test]
    fn test_resume_without_marker_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let m = model(2);
        save_state_dict(&dir.path().join(MODEL_FILE), &m.params().to_state_dict(), HashMap::new())
            .unwrap();
        let run = CheckpointManager::new(dir.path())
            .load_initial_state(
                &StartMode::Resume { checkpoint_dir: dir.path().to_path_buf() },
                &mut model(2),
                &mut optimizer(),
            )
            .unwrap();
        assert_eq!(run, RunState::fresh());
    }

    #[test]
    fn test_resume_from_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = CheckpointManager::new(dir.path())
            .load_initial_state(
                &StartMode::Resume { checkpoint_dir: dir.path().join("gone") },
                &mut model(2),
                &mut optimizer(),
            )
            .unwrap_err();
        assert!(matches!(err, TrainError::MissingCheckpoint(_)));
    }

    #[test]
    fn test_malformed_epoch_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(EPOCH_FILE);
        fs::write(&path, "[1, 2]").unwrap();
        assert!(read_epoch_marker(&path).is_err());
        fs::write(&path, "[7]").unwrap();
        assert_eq!(read_epoch_marker(&path).unwrap(), Some(7));
    }
}
