// ============================================================
// Layer 3 — Run State
// ============================================================
// The loop-level state that survives an epoch: which epoch is
// running and the best validation accuracy seen so far. Model
// and optimizer tensors live in their own objects and are
// persisted alongside this state by the checkpoint manager.

use std::path::PathBuf;

/// Where the initial weights come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// Start at epoch 0 from a pretraining checkpoint file.
    FreshStart { pretrained_checkpoint: PathBuf },
    /// Continue a previous classification run stored in `checkpoint_dir`.
    Resume { checkpoint_dir: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunState {
    pub current_epoch: usize,
    pub best_validation_accuracy: f64,
}

impl RunState {
    pub fn fresh() -> Self {
        Self {
            current_epoch: 0,
            best_validation_accuracy: 0.0,
        }
    }

    pub fn resumed(current_epoch: usize, best_validation_accuracy: f64) -> Self {
        Self {
            current_epoch,
            best_validation_accuracy,
        }
    }

    /// Move to the next epoch; called once per loop iteration.
    pub fn advance(&mut self) {
        self.current_epoch += 1;
    }

    /// Strict improvement test used by the save policy.
    pub fn is_improvement(&self, candidate_accuracy: f64) -> bool {
        candidate_accuracy > self.best_validation_accuracy
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::fresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_increments_by_one() {
        let mut state = RunState::resumed(4, 0.5);
        state.advance();
        assert_eq!(state.current_epoch, 5);
    }

    #[test]
    fn test_improvement_is_strict() {
        let state = RunState::resumed(0, 0.8);
        assert!(state.is_improvement(0.81));
        assert!(!state.is_improvement(0.8));
        assert!(!state.is_improvement(0.7));
    }
}
