// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Epoch loop for binary classification with resumable state.
//
// Per epoch:
//   1. train_one_epoch:  cosine lr per step, forward, backward,
//                        gradient all-reduce, optimizer step
//   2. primary worker appends to epoch_train.jsonl
//   3. every `valid_every` epochs:
//        validate:  ranked inference, one gather per epoch
//        primary appends to epoch_valid.jsonl
//        barrier
//        save_if_improved (strict accuracy improvement)
//   4. state.advance()
//
// Accuracy and AUROC are computed over the predictions of all
// workers, gathered into one buffer, never averaged per batch.

use std::time::{Duration, Instant};

use crate::data::dataset::Dataset;
use crate::data::loader::BatchLoader;
use crate::domain::params::ParamSet;
use crate::domain::records::{EpochMetricRecord, Phase, PredictionBuffer};
use crate::domain::run_state::RunState;
use crate::domain::traits::{ClassificationModel, Collective, InferenceOptions, ModelMode, Optimizer};
use crate::error::{Result, TrainError};
use crate::infra::checkpoint::CheckpointManager;
use crate::infra::metrics::MetricsLogger;
use crate::ml::metrics::epoch_scores;
use crate::ml::schedule::CosineScheduler;

// ─── Collective Helpers ──────────────────────────────────────────────────────

/// Average every gradient across workers, in parameter-name order.
pub fn sync_gradients<C>(params: &mut ParamSet, collective: &C) -> Result<()>
where
    C: Collective + ?Sized,
{
    if collective.world_size() <= 1 {
        return Ok(());
    }
    for (name, grad) in params.grads_mut() {
        let values = grad.as_slice_mut().ok_or_else(|| {
            TrainError::Shape(format!("gradient '{name}' is not contiguous"))
        })?;
        collective.all_reduce_mean(values)?;
    }
    Ok(())
}

/// Every worker's predictions, concatenated in rank order.
pub fn gather_predictions<C>(local: &PredictionBuffer, collective: &C) -> Result<PredictionBuffer>
where
    C: Collective + ?Sized,
{
    if collective.world_size() <= 1 {
        return Ok(local.clone());
    }
    let scores = collective.all_gather_f32(local.scores())?;
    let labels = collective.all_gather_f32(&local.labels_as_f32())?;
    PredictionBuffer::from_gathered(scores, &labels)
}

/// An f64 as a high f32 plus the f32 remainder (about 48 significant bits).
fn split_f64(x: f64) -> [f32; 2] {
    let hi = x as f32;
    [hi, (x - hi as f64) as f32]
}

fn join_f64(parts: &[f32]) -> f64 {
    parts.iter().map(|&p| p as f64).sum()
}

/// Every worker's f64 values, summed element-wise.
fn all_sum_f64<C>(values: &[f64], collective: &C) -> Result<Vec<f64>>
where
    C: Collective + ?Sized,
{
    if collective.world_size() <= 1 {
        return Ok(values.to_vec());
    }
    let local: Vec<f32> = values.iter().flat_map(|&v| split_f64(v)).collect();
    let gathered = collective.all_gather_f32(&local)?;
    let mut sums = vec![0.0f64; values.len()];
    for worker in gathered.chunks_exact(local.len()) {
        for (sum, pair) in sums.iter_mut().zip(worker.chunks_exact(2)) {
            *sum += join_f64(pair);
        }
    }
    Ok(sums)
}

/// Summed loss and batch count across workers.
fn gather_loss<C>(loss_sum: f64, batches: usize, collective: &C) -> Result<(f64, usize)>
where
    C: Collective + ?Sized,
{
    let totals = all_sum_f64(&[loss_sum, batches as f64], collective)?;
    Ok((totals[0], totals[1].round() as usize))
}

/// Batches per epoch summed over every worker's shard.
pub fn global_batch_count<C, D>(loader: &BatchLoader<'_, D>, collective: &C) -> Result<usize>
where
    C: Collective + ?Sized,
    D: Dataset,
{
    let totals = all_sum_f64(&[loader.num_batches() as f64], collective)?;
    Ok(totals[0].round() as usize)
}

// ─── One Epoch ───────────────────────────────────────────────────────────────

/// Train for one epoch and return its metric record.
pub fn train_one_epoch<M, O, C, D>(
    epoch:     usize,
    model:     &mut M,
    optimizer: &mut O,
    loader:    &BatchLoader<'_, D>,
    scheduler: &CosineScheduler,
    options:   &InferenceOptions<'_>,
    collective: &C,
) -> Result<EpochMetricRecord>
where
    M: ClassificationModel + ?Sized,
    O: Optimizer + ?Sized,
    C: Collective + ?Sized,
    D: Dataset,
{
    model.set_mode(ModelMode::Train);
    let batches_per_epoch = loader.num_batches();
    if batches_per_epoch == 0 {
        return Err(TrainError::EmptyTrainingSet);
    }

    let mut loss_sum = 0.0f64;
    let mut batches = 0usize;
    let mut buffer = PredictionBuffer::new();

    for (i, batch) in loader.iter(epoch).enumerate() {
        let batch = batch?;
        let lr = scheduler.get_lr_at_step(epoch * batches_per_epoch + i);
        optimizer.set_learning_rate(lr);

        model.params_mut().zero_grad();
        let out = model.forward_train(&batch, options)?;
        model.backward()?;
        sync_gradients(model.params_mut(), collective)?;
        optimizer.step(model.params_mut())?;

        loss_sum += out.loss;
        batches += 1;
        buffer.extend(&out.outputs, &out.targets)?;
        tracing::debug!(epoch, batch = i, loss = out.loss, lr, "train step");
    }

    let (loss_sum, batches) = gather_loss(loss_sum, batches, collective)?;
    if batches == 0 {
        return Err(TrainError::EmptyTrainingSet);
    }
    let gathered = gather_predictions(&buffer, collective)?;
    let (acc, auroc) = epoch_scores(&gathered)?;
    Ok(EpochMetricRecord::new(epoch, loss_sum / batches as f64, acc, auroc))
}

/// Ranked inference over the validation shard; no gradients are touched.
pub fn validate<M, C, D>(
    epoch:      usize,
    model:      &mut M,
    loader:     &BatchLoader<'_, D>,
    options:    &InferenceOptions<'_>,
    collective: &C,
) -> Result<EpochMetricRecord>
where
    M: ClassificationModel + ?Sized,
    C: Collective + ?Sized,
    D: Dataset,
{
    model.set_mode(ModelMode::Eval);

    let mut loss_sum = 0.0f64;
    let mut batches = 0usize;
    let mut buffer = PredictionBuffer::new();
    for batch in loader.iter(epoch) {
        let out = model.rank(&batch?, options)?;
        loss_sum += out.loss;
        batches += 1;
        buffer.extend(&out.scores, &out.ground_truth)?;
    }

    // Every worker reaches the gathers, even with an empty shard.
    let (loss_sum, batches) = gather_loss(loss_sum, batches, collective)?;
    let gathered = gather_predictions(&buffer, collective)?;
    if batches == 0 {
        return Err(TrainError::EmptyValidationSet);
    }
    let (acc, auroc) = epoch_scores(&gathered)?;
    Ok(EpochMetricRecord::new(epoch, loss_sum / batches as f64, acc, auroc))
}

fn log_epoch(phase: Phase, record: &EpochMetricRecord, elapsed: Duration) {
    tracing::info!(
        "{} Epoch {:03} | loss: {:.4} | acc: {:.4} | auroc: {:.4} || Time: {:.1}s",
        phase.label(),
        record.epoch,
        record.loss,
        record.acc,
        record.auroc,
        elapsed.as_secs_f64(),
    );
}

// ─── Epoch Loop ──────────────────────────────────────────────────────────────

/// Scalars that drive the epoch loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub init_lr:     f64,
    pub min_lr:      f64,
    pub max_epoch:   usize,
    pub valid_every: usize,
}

pub struct TrainingLoop<'a, C: Collective + ?Sized> {
    settings:    LoopSettings,
    options:     InferenceOptions<'a>,
    collective:  &'a C,
    logger:      &'a MetricsLogger,
    checkpoints: &'a CheckpointManager,
}

impl<'a, C: Collective + ?Sized> TrainingLoop<'a, C> {
    pub fn new(
        settings:    LoopSettings,
        options:     InferenceOptions<'a>,
        collective:  &'a C,
        logger:      &'a MetricsLogger,
        checkpoints: &'a CheckpointManager,
    ) -> Self {
        Self { settings, options, collective, logger, checkpoints }
    }

    fn should_validate(&self, epoch: usize) -> bool {
        (epoch + 1) % self.settings.valid_every.max(1) == 0
    }

    /// Run epochs `state.current_epoch..max_epoch`.
    pub fn run<M, O, D>(
        &self,
        state:     &mut RunState,
        model:     &mut M,
        optimizer: &mut O,
        train:     &BatchLoader<'_, D>,
        valid:     &BatchLoader<'_, D>,
    ) -> Result<()>
    where
        M: ClassificationModel + ?Sized,
        O: Optimizer + ?Sized,
        D: Dataset,
    {
        let s = &self.settings;
        let scheduler = CosineScheduler::for_run(s.init_lr, s.min_lr, s.max_epoch, train.num_batches());
        let primary = self.collective.is_primary_worker();
        if primary {
            tracing::info!(
                total_steps = scheduler.total_steps(),
                batches_per_epoch = train.num_batches(),
                "cosine schedule ready"
            );
        }

        if state.current_epoch >= s.max_epoch {
            tracing::info!(
                epoch = state.current_epoch,
                max_epoch = s.max_epoch,
                "run already complete; nothing to train"
            );
        }

        while state.current_epoch < s.max_epoch {
            let epoch = state.current_epoch;

            let started = Instant::now();
            let record = train_one_epoch(
                epoch, model, optimizer, train, &scheduler, &self.options, self.collective,
            )?;
            if primary {
                self.logger.append(Phase::Train, &record)?;
                log_epoch(Phase::Train, &record, started.elapsed());
            }

            if self.should_validate(epoch) {
                let started = Instant::now();
                let record = validate(epoch, model, valid, &self.options, self.collective)?;
                if primary {
                    self.logger.append(Phase::Valid, &record)?;
                    log_epoch(Phase::Valid, &record, started.elapsed());
                }
                self.collective.barrier()?;
                self.checkpoints.save_if_improved(
                    state, model, optimizer, record.acc, record.auroc, primary,
                )?;
            }

            state.advance();
        }
        Ok(())
    }

    /// One validation pass at the current epoch; nothing is logged to disk
    /// or saved.
    pub fn evaluate<M, D>(
        &self,
        state: &RunState,
        model: &mut M,
        valid: &BatchLoader<'_, D>,
    ) -> Result<EpochMetricRecord>
    where
        M: ClassificationModel + ?Sized,
        D: Dataset,
    {
        let started = Instant::now();
        let record = validate(state.current_epoch, model, valid, &self.options, self.collective)?;
        if self.collective.is_primary_worker() {
            log_epoch(Phase::Valid, &record, started.elapsed());
        }
        Ok(record)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::{Example, JsonlDataset};
    use crate::domain::run_state::StartMode;
    use crate::infra::distributed::{launch, SingleWorker};
    use crate::ml::model::{ExpertFusionClassifier, ExpertFusionConfig};
    use crate::ml::optimizer::{AdamW, AdamWConfig};

    fn separable(n: usize) -> JsonlDataset {
        JsonlDataset::new(
            (0..n)
                .map(|i| {
                    let positive = i % 2 == 0;
                    let v = if positive { 1.0 } else { -1.0 };
                    let jitter = (i % 5) as f32 * 0.05;
                    Example {
                        experts: vec![vec![v + jitter, 0.1], vec![v, -jitter]],
                        answer:  if positive { "yes" } else { "no" }.to_string(),
                    }
                })
                .collect(),
        )
    }

    fn answer_list() -> Vec<String> {
        vec!["no".to_string(), "yes".to_string()]
    }

    fn options(list: &[String]) -> InferenceOptions<'_> {
        InferenceOptions {
            prefix:          "",
            answer_list:     list,
            positive_answer: "yes",
            k_test:          128,
        }
    }

    fn settings(max_epoch: usize, valid_every: usize) -> LoopSettings {
        LoopSettings { init_lr: 0.05, min_lr: 1e-4, max_epoch, valid_every }
    }

    fn fresh_model() -> ExpertFusionClassifier {
        ExpertFusionConfig::new(2, 2).init(5)
    }

    fn adamw() -> AdamW {
        AdamW::new(AdamWConfig { lr: 0.05, weight_decay: 0.01, ..Default::default() })
    }

    #[test]
    fn test_train_epoch_sets_scheduled_learning_rate() {
        let list = answer_list();
        let ds = separable(12);
        let loader = BatchLoader::new(&ds, 4).unwrap();
        let scheduler = CosineScheduler::for_run(0.05, 1e-4, 3, loader.num_batches());
        let (mut model, mut opt) = (fresh_model(), adamw());

        let record = train_one_epoch(
            1, &mut model, &mut opt, &loader, &scheduler, &options(&list), &SingleWorker,
        )
        .unwrap();
        assert_eq!(record.epoch, 1);
        assert!(record.loss.is_finite());
        // Last step of epoch 1 is global step 1 * 3 + 2.
        assert_eq!(opt.learning_rate(), scheduler.get_lr_at_step(5));
        assert_eq!(opt.steps_taken(), 3);
    }

    #[test]
    fn test_empty_sets_are_errors() {
        let list = answer_list();
        let empty = JsonlDataset::default();
        let loader = BatchLoader::new(&empty, 4).unwrap();
        let scheduler = CosineScheduler::for_run(0.05, 1e-4, 1, 0);
        let (mut model, mut opt) = (fresh_model(), adamw());

        let err = train_one_epoch(
            0, &mut model, &mut opt, &loader, &scheduler, &options(&list), &SingleWorker,
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::EmptyTrainingSet));

        let err = validate(0, &mut model, &loader, &options(&list), &SingleWorker).unwrap_err();
        assert!(matches!(err, TrainError::EmptyValidationSet));
    }

    #[test]
    fn test_validate_leaves_parameters_untouched() {
        let list = answer_list();
        let ds = separable(6);
        let loader = BatchLoader::new(&ds, 4).unwrap();
        let mut model = fresh_model();
        let before = model.params().to_state_dict();
        let record = validate(0, &mut model, &loader, &options(&list), &SingleWorker).unwrap();
        assert_eq!(model.mode(), ModelMode::Eval);
        assert_eq!(model.params().to_state_dict(), before);
        assert!((0.0..=1.0).contains(&record.acc));
    }

    #[test]
    fn test_loop_logs_every_epoch_and_keeps_best() {
        let dir = tempfile::tempdir().unwrap();
        let list = answer_list();
        let (train_ds, valid_ds) = (separable(16), separable(8));
        let train = BatchLoader::new(&train_ds, 4).unwrap().shuffle(42);
        let valid = BatchLoader::new(&valid_ds, 4).unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        let ckpt = CheckpointManager::new(dir.path());
        let looper = TrainingLoop::new(settings(4, 1), options(&list), &SingleWorker, &logger, &ckpt);

        let (mut model, mut opt) = (fresh_model(), adamw());
        let mut state = RunState::fresh();
        looper.run(&mut state, &mut model, &mut opt, &train, &valid).unwrap();

        assert_eq!(state.current_epoch, 4);
        let train_log = logger.read_records(Phase::Train).unwrap();
        assert_eq!(train_log.iter().map(|r| r.epoch).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        let valid_log = logger.read_records(Phase::Valid).unwrap();
        assert_eq!(valid_log.len(), 4);

        let best = valid_log.iter().map(|r| r.acc).fold(0.0, f64::max);
        assert_eq!(state.best_validation_accuracy, best);
        // The marker names the first epoch that reached the best accuracy.
        let first_best = valid_log.iter().find(|r| r.acc == best).unwrap().epoch;
        assert_eq!(
            crate::infra::checkpoint::read_epoch_marker(&ckpt.epoch_path()).unwrap(),
            Some(first_best)
        );
    }

    #[test]
    fn test_valid_every_skips_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let list = answer_list();
        let ds = separable(8);
        let loader = BatchLoader::new(&ds, 4).unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        let ckpt = CheckpointManager::new(dir.path());
        let looper = TrainingLoop::new(settings(4, 2), options(&list), &SingleWorker, &logger, &ckpt);

        let mut state = RunState::fresh();
        looper.run(&mut state, &mut fresh_model(), &mut adamw(), &loader, &loader).unwrap();

        let epochs: Vec<usize> = logger
            .read_records(Phase::Valid)
            .unwrap()
            .iter()
            .map(|r| r.epoch)
            .collect();
        assert_eq!(epochs, vec![1, 3]);
        assert_eq!(logger.read_records(Phase::Train).unwrap().len(), 4);
    }

    #[test]
    fn test_resume_continues_after_saved_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let list = answer_list();
        let ds = separable(8);
        let loader = BatchLoader::new(&ds, 4).unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        let ckpt = CheckpointManager::new(dir.path());

        let first = TrainingLoop::new(settings(2, 1), options(&list), &SingleWorker, &logger, &ckpt);
        let mut state = RunState::fresh();
        first.run(&mut state, &mut fresh_model(), &mut adamw(), &loader, &loader).unwrap();
        let marker = crate::infra::checkpoint::read_epoch_marker(&ckpt.epoch_path())
            .unwrap()
            .unwrap();

        let (mut model, mut opt) = (fresh_model(), adamw());
        let mut resumed = ckpt
            .load_initial_state(
                &StartMode::Resume { checkpoint_dir: dir.path().to_path_buf() },
                &mut model,
                &mut opt,
            )
            .unwrap();
        assert_eq!(resumed.current_epoch, marker + 1);
        assert_eq!(resumed.best_validation_accuracy, state.best_validation_accuracy);

        let second = TrainingLoop::new(settings(3, 1), options(&list), &SingleWorker, &logger, &ckpt);
        second.run(&mut resumed, &mut model, &mut opt, &loader, &loader).unwrap();
        assert_eq!(resumed.current_epoch, 3);
        assert!(resumed.best_validation_accuracy >= state.best_validation_accuracy);
        let last = logger.read_records(Phase::Train).unwrap().last().copied().unwrap();
        assert_eq!(last.epoch, 2);
    }

    #[test]
    fn test_evaluate_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let list = answer_list();
        let ds = separable(8);
        let loader = BatchLoader::new(&ds, 4).unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        let ckpt = CheckpointManager::new(dir.path());
        let looper = TrainingLoop::new(settings(2, 1), options(&list), &SingleWorker, &logger, &ckpt);

        let record = looper.evaluate(&RunState::fresh(), &mut fresh_model(), &loader).unwrap();
        assert_eq!(record.epoch, 0);
        assert!(logger.read_records(Phase::Valid).unwrap().is_empty());
        assert!(!ckpt.model_path().exists());
    }

    #[test]
    fn test_loss_totals_keep_f64_precision_across_workers() {
        let totals = launch(2, |group| {
            let loss = 1.0e8 + 0.125 * (group.rank() + 1) as f64;
            gather_loss(loss, 20_000_001, group)
        })
        .unwrap();
        for (loss, batches) in totals {
            // Both values are beyond f32's 24-bit mantissa.
            assert_eq!(loss, 2.0e8 + 0.375);
            assert_eq!(batches, 40_000_002);
        }
    }

    #[test]
    fn test_global_batch_count_sums_shards() {
        let ds = separable(5);
        let counts = launch(3, |group| {
            let loader = BatchLoader::new(&ds, 1)?.shard(group.rank(), 3)?;
            global_batch_count(&loader, group)
        })
        .unwrap();
        assert_eq!(counts, vec![5, 5, 5]);
    }

    #[test]
    fn test_two_workers_stay_in_sync_and_log_once() {
        let dir = tempfile::tempdir().unwrap();
        let list = answer_list();
        let (train_ds, valid_ds) = (separable(10), separable(5));
        let logger = MetricsLogger::new(dir.path()).unwrap();
        let ckpt = CheckpointManager::new(dir.path());

        let finals = launch(2, |group| {
            let rank = group.rank();
            let train = BatchLoader::new(&train_ds, 2)?.shuffle(7).shard(rank, 2)?.pad_shards();
            let valid = BatchLoader::new(&valid_ds, 2)?.shard(rank, 2)?;
            let looper = TrainingLoop::new(settings(3, 1), options(&list), group, &logger, &ckpt);
            let (mut model, mut opt) = (fresh_model(), adamw());
            let mut state = RunState::fresh();
            looper.run(&mut state, &mut model, &mut opt, &train, &valid)?;
            Ok((model.params().to_state_dict(), state))
        })
        .unwrap();

        assert_eq!(finals[0].0, finals[1].0);
        assert_eq!(finals[0].1, finals[1].1);
        assert_eq!(logger.read_records(Phase::Train).unwrap().len(), 3);
        assert_eq!(logger.read_records(Phase::Valid).unwrap().len(), 3);
    }
}
