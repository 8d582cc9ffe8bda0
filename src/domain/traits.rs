// ============================================================
// Layer 3 — Core Traits (Collaborator Seams)
// ============================================================
// The epoch loop is written against these traits only:
//
//   ClassificationModel:  forward/backward and ranked inference
//   Optimizer:            learning-rate aware parameter update
//   Collective:           multi-worker cooperation
//                         (gather, barrier, gradient reduction)
//
// Implementations:
//   ml::model::ExpertFusionClassifier   → ClassificationModel
//   ml::optimizer::AdamW                → Optimizer
//   infra::distributed::SingleWorker    → Collective (no-op)
//   infra::distributed::ThreadGroup     → Collective (N workers)

use crate::domain::batch::Batch;
use crate::domain::params::{ParamSet, StateDict};
use crate::error::{Result, TrainError};

// ─── ClassificationModel ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    Train,
    Eval,
}

/// Result of one training forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    /// Mean loss over the batch.
    pub loss: f64,
    /// Per-example binary scores in [0, 1].
    pub outputs: Vec<f32>,
    /// Per-example binary targets.
    pub targets: Vec<bool>,
}

/// Result of ranked inference over a candidate-answer list.
#[derive(Debug, Clone, PartialEq)]
pub struct RankOutput {
    pub loss: f64,
    /// Probability assigned to the positive answer, per example.
    pub scores: Vec<f32>,
    pub ground_truth: Vec<bool>,
}

/// Inputs shared by every forward call in a run.
#[derive(Debug, Clone, Copy)]
pub struct InferenceOptions<'a> {
    /// Prompt prefix prepended to answers in the dataset.
    pub prefix: &'a str,
    /// Fixed candidate answers for ranked inference.
    pub answer_list: &'a [String],
    /// The candidate that counts as the positive class.
    pub positive_answer: &'a str,
    /// Number of top-ranked candidates kept when scoring.
    pub k_test: usize,
}

pub trait ClassificationModel {
    fn set_mode(&mut self, mode: ModelMode);

    fn mode(&self) -> ModelMode;

    /// Forward pass in training mode. Keeps whatever `backward` needs.
    fn forward_train(&mut self, batch: &Batch, options: &InferenceOptions<'_>)
        -> Result<TrainOutput>;

    /// Accumulate gradients of the last `forward_train` into the parameter set.
    fn backward(&mut self) -> Result<()>;

    /// Ranked inference; never touches gradients.
    fn rank(&self, batch: &Batch, options: &InferenceOptions<'_>) -> Result<RankOutput>;

    fn params(&self) -> &ParamSet;

    fn params_mut(&mut self) -> &mut ParamSet;

    /// Name of the positional-embedding tensor in a state dict.
    fn positional_embedding_key(&self) -> &str;

    /// Sequence length the model expects for that tensor.
    fn positional_embedding_len(&self) -> usize;
}

// ─── Optimizer ───────────────────────────────────────────────────────────────

pub trait Optimizer {
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Apply one update using the gradients stored in `params`.
    fn step(&mut self, params: &mut ParamSet) -> Result<()>;

    /// Internal state (moments, step counter) as named tensors.
    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

// ─── Collective ──────────────────────────────────────────────────────────────

/// Operations every cooperating worker must call together.
pub trait Collective {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// The single worker allowed to write logs and checkpoints.
    fn is_primary_worker(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every worker has reached this point.
    fn barrier(&self) -> Result<()>;

    /// Concatenate every worker's `local` slice in rank order.
    /// Slices may have different lengths.
    fn all_gather_f32(&self, local: &[f32]) -> Result<Vec<f32>>;

    /// Replace `values` with the element-wise mean across workers.
    /// Every worker must pass a slice of the same length.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        let world = self.world_size();
        if world <= 1 {
            return Ok(());
        }
        let gathered = self.all_gather_f32(values)?;
        let n = values.len();
        if gathered.len() != n * world {
            return Err(TrainError::Collective(format!(
                "all_reduce_mean expected {} values from {} workers, got {}",
                n * world,
                world,
                gathered.len()
            )));
        }
        for (i, v) in values.iter_mut().enumerate() {
            let sum: f32 = (0..world).map(|w| gathered[w * n + i]).sum();
            *v = sum / world as f32;
        }
        Ok(())
    }
}
