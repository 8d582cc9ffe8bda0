// ============================================================
// Layer 3 — Parameter Set
// ============================================================
// Named parameter tensors plus one gradient buffer per tensor.
// Both maps are BTreeMaps with identical key sets, so iterating
// them side by side always pairs a value with its own gradient.
//
// A StateDict is the serialisable view: just the named values.
// Optimizer state travels in a StateDict too, under its own keys.

use std::collections::BTreeMap;

use ndarray::ArrayD;

use crate::error::{Result, TrainError};

/// Named tensors, as written to and read from a checkpoint file.
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

#[derive(Debug, Clone, Default)]
pub struct ParamSet {
    values: BTreeMap<String, ArrayD<f32>>,
    grads: BTreeMap<String, ArrayD<f32>>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a parameter; its gradient starts at zero.
    pub fn insert(&mut self, name: impl Into<String>, value: ArrayD<f32>) {
        let name = name.into();
        self.grads
            .insert(name.clone(), ArrayD::zeros(value.raw_dim()));
        self.values.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.values.get(name)
    }

    pub fn grad(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.grads.get(name)
    }

    pub fn grad_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.grads.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn zero_grad(&mut self) {
        for grad in self.grads.values_mut() {
            grad.fill(0.0);
        }
    }

    /// Values paired with their gradients, in name order.
    pub fn iter_with_grads_mut(
        &mut self,
    ) -> impl Iterator<Item = (&str, &mut ArrayD<f32>, &ArrayD<f32>)> {
        self.values
            .iter_mut()
            .zip(self.grads.iter())
            .map(|((name, value), (_, grad))| (name.as_str(), value, grad))
    }

    /// Gradients in name order, for cross-worker reduction.
    pub fn grads_mut(&mut self) -> impl Iterator<Item = (&str, &mut ArrayD<f32>)> {
        self.grads
            .iter_mut()
            .map(|(name, grad)| (name.as_str(), grad))
    }

    pub fn to_state_dict(&self) -> StateDict {
        self.values.clone()
    }

    /// Copy values from `state` into the registered parameters.
    ///
    /// Every registered parameter must be present with an identical shape.
    /// Keys in `state` that name no parameter are skipped and returned so the
    /// caller can decide whether to warn about them.
    /// Nothing is modified unless every parameter checks out.
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<Vec<String>> {
        for (name, value) in &self.values {
            let incoming = state.get(name).ok_or_else(|| {
                TrainError::Checkpoint(format!("missing parameter '{name}' in state dict"))
            })?;
            if incoming.shape() != value.shape() {
                return Err(TrainError::Shape(format!(
                    "parameter '{name}' expects shape {:?}, checkpoint has {:?}",
                    value.shape(),
                    incoming.shape()
                )));
            }
        }
        for (name, value) in self.values.iter_mut() {
            if let Some(incoming) = state.get(name) {
                value.assign(incoming);
            }
        }
        self.zero_grad();

        Ok(state
            .keys()
            .filter(|k| !self.values.contains_key(*k))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn sample() -> ParamSet {
        let mut params = ParamSet::new();
        params.insert("a", ArrayD::from_elem(IxDyn(&[2, 3]), 1.0));
        params.insert("b", ArrayD::from_elem(IxDyn(&[1]), 2.0));
        params
    }

    #[test]
    fn test_insert_creates_zero_grad() {
        let params = sample();
        assert_eq!(params.grad("a").unwrap().shape(), &[2, 3]);
        assert!(params.grad("a").unwrap().iter().all(|&g| g == 0.0));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_zero_grad_clears_accumulated_values() {
        let mut params = sample();
        params.grad_mut("b").unwrap().fill(5.0);
        params.zero_grad();
        assert_eq!(params.grad("b").unwrap()[[0]], 0.0);
    }

    #[test]
    fn test_load_state_dict_reports_unexpected_keys() {
        let mut params = sample();
        let mut state = StateDict::new();
        state.insert("a".into(), ArrayD::from_elem(IxDyn(&[2, 3]), 7.0));
        state.insert("b".into(), ArrayD::from_elem(IxDyn(&[1]), 8.0));
        state.insert("optimizer.step".into(), ArrayD::from_elem(IxDyn(&[1]), 3.0));

        let unexpected = params.load_state_dict(&state).unwrap();
        assert_eq!(unexpected, vec!["optimizer.step".to_string()]);
        assert_eq!(params.get("a").unwrap()[[1, 2]], 7.0);
    }

    #[test]
    fn test_load_state_dict_rejects_shape_mismatch() {
        let mut params = sample();
        let mut state = StateDict::new();
        state.insert("a".into(), ArrayD::zeros(IxDyn(&[3, 2])));
        state.insert("b".into(), ArrayD::zeros(IxDyn(&[1])));
        assert!(matches!(
            params.load_state_dict(&state),
            Err(TrainError::Shape(_))
        ));
    }

    #[test]
    fn test_failed_load_leaves_every_parameter_unchanged() {
        let mut params = sample();
        let before = params.to_state_dict();
        // "a" is valid and sorts first; "b" has the wrong shape.
        let mut state = StateDict::new();
        state.insert("a".into(), ArrayD::from_elem(IxDyn(&[2, 3]), 9.0));
        state.insert("b".into(), ArrayD::zeros(IxDyn(&[4])));
        assert!(params.load_state_dict(&state).is_err());
        assert_eq!(params.to_state_dict(), before);
    }

    #[test]
    fn test_load_state_dict_rejects_missing_parameter() {
        let mut params = sample();
        let state = StateDict::new();
        assert!(params.load_state_dict(&state).is_err());
    }
}
