//! Cosine learning-rate decay from `init_lr` to `min_lr`

use std::f64::consts::PI;

/// Learning rate at `step` of a schedule that spans `max_step` steps.
///
/// lr = min_lr + (init_lr - min_lr) * 0.5 * (1 + cos(pi * step / max_step))
///
/// Progress is clamped to [0, 1]; a zero-length schedule stays at `init_lr`.
pub fn cosine_lr(step: usize, max_step: usize, init_lr: f64, min_lr: f64) -> f64 {
    if max_step == 0 {
        return init_lr;
    }
    let progress = (step as f64 / max_step as f64).clamp(0.0, 1.0);
    let cosine_factor = 0.5 * (1.0 + (PI * progress).cos());
    min_lr + (init_lr - min_lr) * cosine_factor
}

/// Cosine scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CosineSchedulerConfig {
    /// Learning rate at step 0
    pub lr_init: f64,
    /// Learning rate at the end of the schedule
    pub lr_min: f64,
    /// Steps in the whole run (`max_epoch * batches_per_epoch`)
    pub total_steps: usize,
}

/// Cosine scheduler over global steps.
///
/// The training loop asks for the rate at an explicit global step
/// (`epoch * batches_per_epoch + batch_index`) so a resumed run picks up
/// the curve where the stored epoch left off.
#[derive(Debug, Clone)]
pub struct CosineScheduler {
    config: CosineSchedulerConfig,
}

impl CosineScheduler {
    pub fn new(config: CosineSchedulerConfig) -> Self {
        Self { config }
    }

    /// Scheduler for `max_epoch` epochs of `batches_per_epoch` steps each.
    pub fn for_run(lr_init: f64, lr_min: f64, max_epoch: usize, batches_per_epoch: usize) -> Self {
        Self::new(CosineSchedulerConfig {
            lr_init,
            lr_min,
            total_steps: max_epoch * batches_per_epoch,
        })
    }

    pub fn get_lr_at_step(&self, step: usize) -> f64 {
        cosine_lr(
            step,
            self.config.total_steps,
            self.config.lr_init,
            self.config.lr_min,
        )
    }

    pub fn total_steps(&self) -> usize {
        self.config.total_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_starts_at_init_lr() {
        let scheduler = CosineScheduler::for_run(1e-4, 1e-6, 10, 50);
        assert_abs_diff_eq!(scheduler.get_lr_at_step(0), 1e-4, epsilon = 1e-15);
    }

    #[test]
    fn test_halfway_is_midpoint() {
        let lr = cosine_lr(500, 1000, 1.0, 0.0);
        assert_abs_diff_eq!(lr, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_final_step_approaches_min_lr() {
        let (epochs, batches) = (5, 20);
        let scheduler = CosineScheduler::for_run(1e-3, 1e-5, epochs, batches);
        let last = scheduler.get_lr_at_step(epochs * batches - 1);
        assert!(last > 1e-5);
        assert!(last - 1e-5 < 1e-3 * 1e-3);
        assert_abs_diff_eq!(scheduler.get_lr_at_step(epochs * batches), 1e-5, epsilon = 1e-15);
    }

    #[test]
    fn test_zero_length_schedule_keeps_init_lr() {
        assert_eq!(cosine_lr(3, 0, 0.1, 0.01), 0.1);
    }

    #[test]
    fn test_resumed_epoch_continues_the_curve() {
        let scheduler = CosineScheduler::for_run(1.0, 0.0, 2, 10);
        assert_eq!(scheduler.total_steps(), 20);
        // First step of epoch 1 sits halfway through a two-epoch run.
        assert_abs_diff_eq!(scheduler.get_lr_at_step(10), 0.5, epsilon = 1e-12);
    }

    proptest! {
        #[test]
        fn prop_monotone_and_bounded(
            total in 1usize..2000,
            init in 1e-6f64..1.0,
            frac in 0.0f64..1.0,
        ) {
            let min = init * frac;
            let mut prev = f64::INFINITY;
            for step in 0..=total {
                let lr = cosine_lr(step, total, init, min);
                prop_assert!(lr <= prev + 1e-15);
                prop_assert!(lr <= init + 1e-15);
                prop_assert!(lr >= min - 1e-15);
                prev = lr;
            }
        }
    }
}
