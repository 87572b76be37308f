//! Learnable states owned by exactly one module.

use crate::nn::module::{check_shape, ModuleResult};
use crate::tensor::State;
use ndarray::{ArrayD, Axis, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// Hyperparameters of the uniform re-initialization rule.
///
/// Weights are drawn from `[-z, z]` with `z = lin_value / fan_in^(1/lin_exponent)`;
/// modules without a fan-in use `z = lin_value`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgetConfig {
    pub lin_value: f64,
    pub lin_exponent: f64,
}

impl Default for ForgetConfig {
    fn default() -> Self {
        Self {
            lin_value: 1.0,
            lin_exponent: 2.0,
        }
    }
}

impl ForgetConfig {
    pub fn new(lin_value: f64, lin_exponent: f64) -> Self {
        Self {
            lin_value,
            lin_exponent,
        }
    }

    /// Half-width of the init range for a weight with `fan_in` input columns.
    pub fn range(&self, fan_in: usize) -> f64 {
        if fan_in == 0 || self.lin_exponent == 0.0 {
            log::warn!(
                "degenerate forget rule (fan_in={}, lin_exponent={}), using zero range",
                fan_in,
                self.lin_exponent
            );
            return 0.0;
        }
        self.lin_value / (fan_in as f64).powf(1.0 / self.lin_exponent)
    }
}

/// A `State` that is the target of learning.
///
/// Dereferences to its `State`, so `param.x`, `param.dx` and `param.ddx` read
/// the same as on any other state.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    state: State,
}

impl Parameter {
    /// Creates a zero-valued parameter.
    pub fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            state: State::new(shape),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Replaces the value, keeping the accumulators. The shape must not change.
    pub fn set_value(&mut self, value: ArrayD<f64>) -> ModuleResult<()> {
        check_shape(&self.name, self.state.shape(), value.shape())?;
        self.state.x = value;
        Ok(())
    }

    /// Redraws every entry uniformly from `[-z, z]`.
    pub fn forget_uniform(&mut self, z: f64, rng: &mut dyn RngCore) {
        let dim = IxDyn(self.state.shape());
        if z > 0.0 && z.is_finite() {
            self.state.x = ArrayD::random_using(dim, Uniform::new_inclusive(-z, z), rng);
        } else {
            self.state.x = ArrayD::zeros(dim);
        }
        log::debug!("forget {} {:?} in [-{}, {}]", self.name, self.state.shape(), z, z);
    }

    /// Rescales each column of a 2-D parameter to unit L2 norm.
    ///
    /// All-zero columns are left untouched.
    pub fn normalize_columns(&mut self) {
        if self.state.x.ndim() != 2 {
            log::warn!("{}: column normalization needs a 2-D parameter", self.name);
            return;
        }
        for (index, mut column) in self.state.x.axis_iter_mut(Axis(1)).enumerate() {
            let norm = column.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                column.mapv_inplace(|v| v / norm);
            } else {
                log::warn!("{}: column {} has zero norm, skipped", self.name, index);
            }
        }
    }

    /// Rescales the whole parameter to unit L2 norm.
    pub fn normalize(&mut self) {
        let norm = self.state.x.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            self.state.x.mapv_inplace(|v| v / norm);
        } else {
            log::warn!("{}: zero norm, normalization skipped", self.name);
        }
    }
}

impl Deref for Parameter {
    type Target = State;

    fn deref(&self) -> &State {
        &self.state
    }
}

impl DerefMut for Parameter {
    fn deref_mut(&mut self) -> &mut State {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_forget_range() {
        let config = ForgetConfig::default();
        assert!((config.range(4) - 0.5).abs() < 1e-12);
        assert_eq!(ForgetConfig::new(2.0, 1.0).range(4), 0.5);
        assert_eq!(config.range(0), 0.0);
    }

    #[test]
    fn test_forget_uniform_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut param = Parameter::new("w", &[8, 8]);
        param.forget_uniform(0.25, &mut rng);
        assert!(param.x.iter().all(|v| v.abs() <= 0.25));
        assert!(param.x.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_normalize_columns() {
        let mut param = Parameter::new("w", &[2, 2]);
        param
            .set_value(arr2(&[[3.0, 0.0], [4.0, 0.0]]).into_dyn())
            .unwrap();
        param.normalize_columns();
        let x = param.x.clone().into_dimensionality::<ndarray::Ix2>().unwrap();
        assert!((x[[0, 0]] - 0.6).abs() < 1e-12);
        assert!((x[[1, 0]] - 0.8).abs() < 1e-12);
        // zero column left alone
        assert_eq!(x[[0, 1]], 0.0);
    }

    #[test]
    fn test_set_value_rejects_other_shape() {
        let mut param = Parameter::new("b", &[3]);
        assert!(param.set_value(ArrayD::zeros(IxDyn(&[2]))).is_err());
    }

    #[test]
    fn test_forget_config_from_json_fills_defaults() {
        let config: ForgetConfig = serde_json::from_str(r#"{"lin_value": 0.5}"#).unwrap();
        assert_eq!(config.lin_value, 0.5);
        assert_eq!(config.lin_exponent, 2.0);
    }
}
