// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates one classification run, on every worker:
//
//   Step 1: Report accelerator options           (Layer 6 - infra)
//   Step 2: Build model + optimizer              (Layer 5 - ml)
//   Step 3: Load initial state (fresh / resume)  (Layer 6 - infra)
//   Step 4: Build datasets and sharded loaders   (Layer 4 - data)
//   Step 5: Evaluate once, or run the epoch loop (Layer 5 - ml)
//
// With world_size 1 the worker runs on the calling thread with
// a SingleWorker collective; otherwise `launch` starts one
// thread per worker, each with its own model replica.

use anyhow::{Context, Result};

use crate::application::config::RunConfig;
use crate::data::dataset::{create_dataset, DatasetConfig};
use crate::data::loader::BatchLoader;
use crate::domain::records::EpochMetricRecord;
use crate::domain::traits::{Collective, InferenceOptions};
use crate::error::TrainError;
use crate::infra::checkpoint::CheckpointManager;
use crate::infra::distributed::{launch, SingleWorker};
use crate::infra::metrics::MetricsLogger;
use crate::ml::model::ExpertFusionConfig;
use crate::ml::optimizer::{AdamW, AdamWConfig};
use crate::ml::trainer::{global_batch_count, LoopSettings, TrainingLoop};

/// What a finished run reports back to the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Epoch loop completed; best validation accuracy seen.
    Trained { last_epoch: usize, best_accuracy: f64 },
    /// Single validation pass in evaluate mode.
    Evaluated(EpochMetricRecord),
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: RunConfig,
}

impl TrainUseCase {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Run on every worker and return the primary worker's outcome.
    pub fn execute(&self) -> Result<RunOutcome> {
        let cfg = &self.config;
        cfg.validate()?;

        // ── Step 1: Accelerator ───────────────────────────────────────────────
        cfg.accelerator.report(cfg.world_size);

        if cfg.world_size == 1 {
            return run_worker(cfg, &SingleWorker);
        }
        let mut outcomes = launch(cfg.world_size, |group| {
            run_worker(cfg, group).map_err(|e| {
                tracing::error!(rank = group.rank(), "{e:#}");
                into_train_error(e)
            })
        })?;
        // Rank 0 is the primary worker.
        Ok(outcomes.swap_remove(0))
    }
}

/// The typed error behind `err`, so `launch` can tell a worker's own
/// failure apart from a peer abort.
fn into_train_error(err: anyhow::Error) -> TrainError {
    match err.downcast::<TrainError>() {
        Ok(typed) => typed,
        Err(other) => TrainError::Model(format!("{other:#}")),
    }
}

/// Everything one worker does for a run.
pub fn run_worker<C>(cfg: &RunConfig, collective: &C) -> Result<RunOutcome>
where
    C: Collective + ?Sized,
{
    let cls = &cfg.classification;
    let (rank, world) = (collective.rank(), collective.world_size());

    // ── Step 2: Model and optimizer ───────────────────────────────────────────
    // Same seed on every worker, so replicas start identical.
    let mut model = ExpertFusionConfig::new(cls.num_experts, cls.expert_dim).init(cfg.seed);
    let mut optimizer = AdamW::new(AdamWConfig {
        lr: cls.init_lr,
        weight_decay: cls.weight_decay,
        ..Default::default()
    });

    // ── Step 3: Initial state ─────────────────────────────────────────────────
    let run_dir = cfg.run_dir();
    let checkpoints = CheckpointManager::new(&run_dir);
    let mut state = checkpoints
        .load_initial_state(&cfg.start_mode(), &mut model, &mut optimizer)
        .context("Cannot load initial model state")?;
    if collective.is_primary_worker() {
        tracing::info!(
            start_epoch = state.current_epoch,
            best_accuracy = state.best_validation_accuracy,
            "initial state ready"
        );
    }

    // ── Step 4: Data ──────────────────────────────────────────────────────────
    let dataset_cfg = DatasetConfig::from_extra(&cls.dataset)?;
    let (train_ds, test_ds) = create_dataset(&dataset_cfg).context("Cannot build datasets")?;
    let train = BatchLoader::new(&train_ds, cls.batch_size_train)?
        .shuffle(cfg.seed)
        .shard(rank, world)?
        .pad_shards();
    let valid = BatchLoader::new(&test_ds, cls.batch_size_test)?.shard(rank, world)?;

    // Both checks run before the first step. Padded training shards are
    // equal on every worker; validation shards are not, so count globally.
    if !cfg.evaluate && train.num_batches() == 0 {
        return Err(TrainError::EmptyTrainingSet.into());
    }
    if global_batch_count(&valid, collective)? == 0 {
        return Err(TrainError::EmptyValidationSet.into());
    }

    // ── Step 5: Evaluate or train ─────────────────────────────────────────────
    let options = InferenceOptions {
        prefix:          &cls.prefix,
        answer_list:     &dataset_cfg.answer_list,
        positive_answer: &dataset_cfg.positive_answer,
        k_test:          cls.k_test,
    };
    let settings = LoopSettings {
        init_lr:     cls.init_lr,
        min_lr:      cls.min_lr,
        max_epoch:   cls.max_epoch,
        valid_every: cls.valid_every,
    };
    let logger = MetricsLogger::new(&run_dir)
        .with_context(|| format!("Cannot create run directory '{}'", run_dir.display()))?;
    let looper = TrainingLoop::new(settings, options, collective, &logger, &checkpoints);

    if cfg.evaluate {
        let record = looper.evaluate(&state, &mut model, &valid)?;
        return Ok(RunOutcome::Evaluated(record));
    }

    looper.run(&mut state, &mut model, &mut optimizer, &train, &valid)?;
    Ok(RunOutcome::Trained {
        last_epoch:    state.current_epoch.saturating_sub(1),
        best_accuracy: state.best_validation_accuracy,
    })
}
