// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All workflow logic is delegated to Layer 2 (application).
//
// One command: train (or, with --evaluate, validate once)
// a binary classifier on top of a pretraining run.

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::TrainArgs;

use crate::application::train_use_case::{RunOutcome, TrainUseCase};
use crate::error::TrainError;

/// Exit status for a run that failed before its first training step.
pub const EXIT_CONFIG_ERROR: u8 = 2;
/// Exit status for a failure during training or validation.
pub const EXIT_RUN_ERROR: u8 = 1;

/// Map a failed run onto a process exit status.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let config_error = err
        .chain()
        .filter_map(|e| e.downcast_ref::<TrainError>())
        .any(TrainError::is_configuration_error);
    if config_error {
        EXIT_CONFIG_ERROR
    } else {
        EXIT_RUN_ERROR
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "classify-trainer",
    version,
    about = "Fine-tune a binary multimodal classifier with resumable checkpoints."
)]
pub struct Cli {
    #[command(flatten)]
    pub args: TrainArgs,
}

impl Cli {
    /// Convert flags into a RunConfig and hand off to Layer 2.
    pub fn run(self) -> Result<()> {
        let config = self.args.into_run_config()?;
        tracing::info!(
            exp_name = %config.exp_name,
            run_dir = %config.run_dir().display(),
            "starting classification run"
        );

        match TrainUseCase::new(config).execute()? {
            RunOutcome::Trained { last_epoch, best_accuracy } => {
                println!("Training complete after epoch {last_epoch:03}. Best valid_acc: {best_accuracy:.4}");
            }
            RunOutcome::Evaluated(record) => {
                println!(
                    "Evaluation | loss {:.4} | acc {:.4} | auroc {:.4}",
                    record.loss, record.acc, record.auroc
                );
            }
        }
        Ok(())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::path::PathBuf;

    #[test]
    fn test_configuration_errors_exit_with_two() {
        let err = anyhow::Error::from(TrainError::EmptyValidationSet);
        assert_eq!(exit_code(&err), EXIT_CONFIG_ERROR);

        let wrapped: Result<()> = Err(TrainError::MissingCheckpoint(PathBuf::from("x")))
            .context("Cannot load initial model state");
        assert_eq!(exit_code(&wrapped.unwrap_err()), EXIT_CONFIG_ERROR);
    }

    #[test]
    fn test_run_errors_exit_with_one() {
        let err = anyhow::Error::from(TrainError::Shape("bad".into()));
        assert_eq!(exit_code(&err), EXIT_RUN_ERROR);
        assert_eq!(exit_code(&anyhow::anyhow!("disk full")), EXIT_RUN_ERROR);
    }
}
