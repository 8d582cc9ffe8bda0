//! AdamW optimizer implementation
//!
//! Adam with decoupled weight decay (Loshchilov & Hutter, 2019), applied to
//! every tensor of a `ParamSet`. The learning rate is overwritten by the
//! cosine schedule before each step.

use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn, Zip};

use crate::domain::params::{ParamSet, StateDict};
use crate::domain::traits::Optimizer;
use crate::error::{Result, TrainError};

const STEP_KEY: &str = "step";
const EXP_AVG_SUFFIX: &str = ".exp_avg";
const EXP_AVG_SQ_SUFFIX: &str = ".exp_avg_sq";

/// AdamW optimizer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for the running average of the gradient
    pub beta1: f64,
    /// Coefficient for the running average of the squared gradient
    pub beta2: f64,
    /// Term added to the denominator for numerical stability
    pub eps: f64,
    /// Decoupled weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// First and second moment estimates for one parameter
#[derive(Debug, Clone)]
struct MomentState {
    exp_avg: ArrayD<f32>,
    exp_avg_sq: ArrayD<f32>,
}

#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    moments: BTreeMap<String, MomentState>,
    step: u64,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            moments: BTreeMap::new(),
            step: 0,
        }
    }

    /// Number of updates applied so far.
    pub fn steps_taken(&self) -> u64 {
        self.step
    }
}

impl Optimizer for AdamW {
    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn step(&mut self, params: &mut ParamSet) -> Result<()> {
        // Shapes are checked up front so a failed step changes nothing.
        for (name, value, grad) in params.iter_with_grads_mut() {
            if value.shape() != grad.shape() {
                return Err(TrainError::Shape(format!(
                    "parameter '{name}' has shape {:?}, its gradient has {:?}",
                    value.shape(),
                    grad.shape()
                )));
            }
            if let Some(state) = self.moments.get(name) {
                if state.exp_avg.shape() != grad.shape() || state.exp_avg_sq.shape() != grad.shape() {
                    return Err(TrainError::Shape(format!(
                        "optimizer state for '{name}' has shape {:?}, gradient has {:?}",
                        state.exp_avg.shape(),
                        grad.shape()
                    )));
                }
            }
        }

        self.step += 1;
        let t = self.step as i32;

        let lr = self.config.lr as f32;
        let beta1 = self.config.beta1 as f32;
        let beta2 = self.config.beta2 as f32;
        let eps = self.config.eps as f32;
        let decay = 1.0 - (self.config.lr * self.config.weight_decay) as f32;
        let bias1 = 1.0 - self.config.beta1.powi(t) as f32;
        let bias2 = 1.0 - self.config.beta2.powi(t) as f32;

        for (name, value, grad) in params.iter_with_grads_mut() {
            let state = self
                .moments
                .entry(name.to_string())
                .or_insert_with(|| MomentState {
                    exp_avg: ArrayD::zeros(grad.raw_dim()),
                    exp_avg_sq: ArrayD::zeros(grad.raw_dim()),
                });

            Zip::from(value)
                .and(&mut state.exp_avg)
                .and(&mut state.exp_avg_sq)
                .and(grad)
                .for_each(|p, m, v, &g| {
                    *p *= decay;
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            STEP_KEY.to_string(),
            ArrayD::from_elem(IxDyn(&[1]), self.step as f32),
        );
        for (name, moment) in &self.moments {
            state.insert(format!("{name}{EXP_AVG_SUFFIX}"), moment.exp_avg.clone());
            state.insert(format!("{name}{EXP_AVG_SQ_SUFFIX}"), moment.exp_avg_sq.clone());
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let step = state
            .get(STEP_KEY)
            .and_then(|t| t.iter().next().copied())
            .ok_or_else(|| TrainError::Checkpoint("optimizer state has no step counter".into()))?;

        let mut moments = BTreeMap::new();
        for (key, exp_avg) in state {
            let Some(name) = key.strip_suffix(EXP_AVG_SUFFIX) else {
                continue;
            };
            let exp_avg_sq = state
                .get(&format!("{name}{EXP_AVG_SQ_SUFFIX}"))
                .ok_or_else(|| {
                    TrainError::Checkpoint(format!("optimizer state for '{name}' is incomplete"))
                })?;
            moments.insert(
                name.to_string(),
                MomentState {
                    exp_avg: exp_avg.clone(),
                    exp_avg_sq: exp_avg_sq.clone(),
                },
            );
        }

        self.step = step as u64;
        self.moments = moments;
        Ok(())
    }
}
