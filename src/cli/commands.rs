// ============================================================
// Layer 1 — CLI Arguments
// ============================================================
// Flags of the single training command. Underscore names are
// kept so existing launch scripts keep working.
//
// clap's derive macros generate:
//   - help text (--help)
//   - errors for unknown or conflicting flags
//   - type conversion (string → u64, usize, PathBuf)

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::application::config::{ClassificationConfig, RunConfig};
use crate::infra::distributed::{AcceleratorOptions, MixedPrecision, ShardingMode};

/// All arguments for a classification run.
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Launcher mode; accepted and ignored
    #[arg(long, default_value = "")]
    pub mode: String,

    /// Launcher port; accepted and ignored
    #[arg(long, default_value = "")]
    pub port: String,

    /// YAML file with hyperparameters and dataset keys
    #[arg(long, default_value = "configs/classification.yaml")]
    pub config: PathBuf,

    /// Resume from this experiment's own classification checkpoint
    #[arg(long = "from_checkpoint")]
    pub from_checkpoint: bool,

    /// Run one validation pass and exit
    #[arg(long)]
    pub evaluate: bool,

    /// Experiment name; selects pretrain_{name} and classification_{name}
    #[arg(long = "exp_name", default_value = "")]
    pub exp_name: String,

    /// Shard gradients and optimizer state across workers
    #[arg(long = "shard_grad_op", conflicts_with = "full_shard")]
    pub shard_grad_op: bool,

    /// Shard parameters, gradients and optimizer state across workers
    #[arg(long = "full_shard")]
    pub full_shard: bool,

    /// Mixed precision mode
    #[arg(
        long = "mixed_precision",
        default_value = "fp16",
        value_parser = ["no", "fp16", "bf16"]
    )]
    pub mixed_precision: String,

    /// Seed for initialisation and data shuffling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Parent directory of pretrain_* and classification_* run directories
    #[arg(long = "output_root", default_value = "logging")]
    pub output_root: PathBuf,

    /// Number of in-process workers
    #[arg(long = "world_size", default_value_t = 1)]
    pub world_size: usize,
}

impl TrainArgs {
    /// Read the YAML file and merge it with the flags.
    /// This is the boundary between Layer 1 and Layer 2;
    /// the application layer never sees clap types.
    pub fn into_run_config(self) -> Result<RunConfig> {
        let classification = ClassificationConfig::load(&self.config)?;
        let accelerator = AcceleratorOptions {
            sharding:        ShardingMode::from_flags(self.shard_grad_op, self.full_shard)?,
            mixed_precision: self
                .mixed_precision
                .parse::<MixedPrecision>()
                .context("Invalid --mixed_precision")?,
        };
        Ok(RunConfig {
            classification,
            exp_name:        self.exp_name,
            output_root:     self.output_root,
            from_checkpoint: self.from_checkpoint,
            evaluate:        self.evaluate,
            seed:            self.seed,
            world_size:      self.world_size,
            accelerator,
            mode:            self.mode,
            port:            self.port,
        })
    }
}
