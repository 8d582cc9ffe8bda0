// ============================================================
// Layer 5 — ML / Model Layer
// ============================================================
// All numeric code lives here. No other layer touches ndarray
// math directly.
//
//   model.rs:        expert-fusion classifier: pooled expert
//                    features + positional embedding, linear
//                    head, BCE loss, top-k candidate ranking
//
//   optimizer.rs:    AdamW with decoupled weight decay and a
//                    serialisable state dict
//
//   schedule.rs:     per-step cosine learning-rate decay
//
//   interpolate.rs:  resize a positional embedding to a new
//                    sequence length (linear, align-corners)
//
//   metrics.rs:      accuracy and AUROC over gathered scores
//
//   trainer.rs:      one training epoch, one validation pass,
//                    and the epoch loop with checkpointing

/// Positional-embedding resizing for pretrained weights
pub mod interpolate;

/// Accuracy and AUROC
pub mod metrics;

/// Expert-fusion binary classifier
pub mod model;

/// AdamW optimizer
pub mod optimizer;

/// Cosine learning-rate schedule
pub mod schedule;

/// Epoch loop, training and validation passes
pub mod trainer;
