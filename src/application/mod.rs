// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer wires the other layers together for one run.
//
// Rules for this layer:
//   - No model math here (that's Layer 5)
//   - No argument parsing here (that's Layer 1)
//   - File formats belong to Layer 6
//
//   config.rs:          YAML hyperparameters merged with CLI flags
//   train_use_case.rs:  per-worker wiring of data, model, loop

/// Run configuration (YAML file + CLI flags)
pub mod config;

/// The training / evaluation workflow
pub mod train_use_case;
