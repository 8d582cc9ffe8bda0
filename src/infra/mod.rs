// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything that touches disk or other workers:
//
//   state_dict.rs:   safetensors read/write of named f32 tensors,
//                    atomic file replacement
//
//   checkpoint.rs:   fresh-start and resume loading, the
//                    save-on-strict-improvement policy, and the
//                    best.txt / epoch.pt markers
//
//   metrics.rs:      append-only JSONL logs, one per phase
//
//   distributed.rs:  the Collective implementations (single
//                    worker, in-process thread group) and the
//                    accelerator options reported at startup
//
// Only the primary worker writes files; every worker reads them.

/// Model + optimizer checkpoints and markers
pub mod checkpoint;

/// Worker groups and accelerator options
pub mod distributed;

/// JSONL metric logs
pub mod metrics;

/// safetensors persistence for state dicts
pub mod state_dict;
