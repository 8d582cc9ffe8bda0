// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain structs, enums and traits that describe a training run:
//
//   run_state.rs:  RunState and the fresh/resume StartMode
//   records.rs:    EpochMetricRecord, Phase, PredictionBuffer
//   params.rs:     named parameter tensors and their gradients
//   batch.rs:      one mini-batch of expert features + answers
//   traits.rs:     the collaborator seams: model, optimizer,
//                  and the collective (multi-worker) interface
//
// Nothing in this layer touches the filesystem.

pub mod batch;
pub mod params;
pub mod records;
pub mod run_state;
pub mod traits;

pub use batch::{Batch, ExpertBundle};
pub use params::{ParamSet, StateDict};
pub use records::{EpochMetricRecord, Phase, PredictionBuffer};
pub use run_state::{RunState, StartMode};
pub use traits::{
    ClassificationModel, Collective, InferenceOptions, ModelMode, Optimizer, RankOutput,
    TrainOutput,
};
