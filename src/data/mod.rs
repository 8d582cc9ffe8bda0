// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// From dataset files to per-worker mini-batches:
//
//   train.jsonl / test.jsonl
//       │
//       ▼
//   JsonlDataset   → one Example per line (expert features + answer)
//       │
//       ▼
//   BatchLoader    → seeded shuffle, worker sharding, batching
//       │
//       ▼
//   Batch          → handed to the training / validation loop
//
// DatasetConfig is read from the keys of the run config that the
// classification section does not claim for itself.

/// JSONL dataset and its configuration
pub mod dataset;

/// Sharded, optionally shuffled mini-batch iteration
pub mod loader;

pub use dataset::{create_dataset, Dataset, DatasetConfig, Example, JsonlDataset};
pub use loader::BatchLoader;
