//! Additive offset, elementwise or broadcast per feature.

use crate::nn::module::{check_shape, unary, unary_mut, Module, ModuleError, ModuleResult};
use crate::nn::parameter::{ForgetConfig, Parameter};
use crate::tensor::State;
use ndarray::{ArrayD, Axis};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// What `normalize` does to the bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasNormalization {
    /// Leave the bias as is.
    #[default]
    None,
    /// Rescale the whole bias to unit L2 norm.
    UnitNorm,
}

/// Configuration for the `Bias` module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasConfig {
    pub shape_in: Vec<usize>,
    /// `out[k][..] = in[k][..] + b[k]` instead of `out[..] = in[..] + b[..]`.
    #[serde(default)]
    pub per_feature: bool,
    #[serde(default)]
    pub forget: ForgetConfig,
    #[serde(default)]
    pub normalization: BiasNormalization,
}

impl BiasConfig {
    pub fn new(shape_in: &[usize]) -> Self {
        Self {
            shape_in: shape_in.to_vec(),
            per_feature: false,
            forget: ForgetConfig::default(),
            normalization: BiasNormalization::None,
        }
    }

    pub fn with_per_feature(mut self, per_feature: bool) -> Self {
        self.per_feature = per_feature;
        self
    }

    pub fn with_forget(mut self, forget: ForgetConfig) -> Self {
        self.forget = forget;
        self
    }

    pub fn with_normalization(mut self, normalization: BiasNormalization) -> Self {
        self.normalization = normalization;
        self
    }
}

/// Bias module.
///
/// In the per-feature variant the parameter has shape `(channels, 1, …, 1)`
/// and is broadcast over every trailing dimension of the input.
#[derive(Debug, Clone)]
pub struct Bias {
    per_feature: bool,
    forget: ForgetConfig,
    normalization: BiasNormalization,
    pub bias: Parameter,
}

impl Bias {
    pub fn new(shape_in: &[usize], per_feature: bool) -> ModuleResult<Self> {
        Self::from_config(&BiasConfig::new(shape_in).with_per_feature(per_feature))
    }

    pub fn from_config(config: &BiasConfig) -> ModuleResult<Self> {
        let shape = if config.per_feature {
            let (&channels, rest) = config.shape_in.split_first().ok_or_else(|| {
                ModuleError::InvalidConfig("per-feature bias needs at least one dimension".into())
            })?;
            std::iter::once(channels)
                .chain(rest.iter().map(|_| 1))
                .collect::<Vec<_>>()
        } else {
            config.shape_in.clone()
        };
        Ok(Self {
            per_feature: config.per_feature,
            forget: config.forget,
            normalization: config.normalization,
            bias: Parameter::new("bias.bias", &shape),
        })
    }

    pub fn per_feature(&self) -> bool {
        self.per_feature
    }

    /// Bias shape an input of `shape` needs: the same shape, or
    /// `(shape[0], 1, …, 1)` per feature.
    fn expected_bias_shape(&self, shape: &[usize]) -> Option<Vec<usize>> {
        if !self.per_feature {
            return Some(shape.to_vec());
        }
        let (&channels, rest) = shape.split_first()?;
        Some(std::iter::once(channels).chain(rest.iter().map(|_| 1)).collect())
    }

    fn check_input(&self, context: &str, shape: &[usize]) -> ModuleResult<()> {
        let bias = self.bias.shape();
        match self.expected_bias_shape(shape) {
            Some(expected) if expected == bias => Ok(()),
            _ => Err(ModuleError::ShapeMismatch {
                context: context.to_string(),
                expected: bias.to_vec(),
                actual: shape.to_vec(),
            }),
        }
    }

    /// Reduces an output-shaped buffer to the bias shape.
    fn reduce(&self, values: &ArrayD<f64>) -> ArrayD<f64> {
        if !self.per_feature || values.ndim() == 0 {
            return values.clone();
        }
        let sums = values
            .axis_iter(Axis(0))
            .map(|channel| channel.sum())
            .collect::<Vec<_>>();
        let mut reduced = ArrayD::zeros(self.bias.x.raw_dim());
        for (r, s) in reduced.iter_mut().zip(sums) {
            *r = s;
        }
        reduced
    }

    fn check_param_buffers(&self) -> ModuleResult<()> {
        let shape = self.bias.shape();
        check_shape("bias bias.dx", shape, self.bias.dx.shape())?;
        check_shape("bias bias.ddx", shape, self.bias.ddx.shape())
    }
}

impl Module for Bias {
    fn name(&self) -> &'static str {
        "bias"
    }

    fn arity(&self) -> usize {
        1
    }

    fn fprop(&mut self, inputs: &[&State], output: &mut State) -> ModuleResult<()> {
        let input = unary(self.name(), inputs)?;
        self.check_input("bias input", input.shape())?;
        output.resize(input.shape());
        output.x.assign(&input.x);
        output.x += &self.bias.x;
        Ok(())
    }

    fn bprop_input(&mut self, inputs: &mut [&mut State], output: &State) -> ModuleResult<()> {
        let input = unary_mut(self.name(), inputs)?;
        check_shape("bias output.dx", input.dx.shape(), output.dx.shape())?;
        input.dx += &output.dx;
        Ok(())
    }

    fn bprop_param(&mut self, inputs: &[&State], output: &State) -> ModuleResult<()> {
        let input = unary(self.name(), inputs)?;
        self.check_input("bias input", input.shape())?;
        check_shape("bias output.dx", input.shape(), output.dx.shape())?;
        self.check_param_buffers()?;
        let grad = self.reduce(&output.dx);
        self.bias.dx += &grad;
        Ok(())
    }

    fn bbprop_input(&mut self, inputs: &mut [&mut State], output: &State) -> ModuleResult<()> {
        let input = unary_mut(self.name(), inputs)?;
        check_shape("bias output.ddx", input.ddx.shape(), output.ddx.shape())?;
        input.ddx += &output.ddx;
        Ok(())
    }

    fn bbprop_param(&mut self, inputs: &[&State], output: &State) -> ModuleResult<()> {
        let input = unary(self.name(), inputs)?;
        self.check_input("bias input", input.shape())?;
        check_shape("bias output.ddx", input.shape(), output.ddx.shape())?;
        self.check_param_buffers()?;
        let curvature = self.reduce(&output.ddx);
        self.bias.ddx += &curvature;
        Ok(())
    }

    fn forget(&mut self, rng: &mut dyn RngCore) {
        let z = self.forget.lin_value;
        self.bias.forget_uniform(z, rng);
    }

    fn normalize(&mut self) {
        match self.normalization {
            BiasNormalization::None => {}
            BiasNormalization::UnitNorm => self.bias.normalize(),
        }
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.bias]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_elementwise_bias() {
        let mut module = Bias::new(&[3], false).unwrap();
        module.bias.set_value(arr1(&[1.0, 2.0, 3.0]).into_dyn()).unwrap();
        let mut input = State::from_shape_vec(&[3], vec![0.5, 0.5, 0.5]).unwrap();
        let mut output = State::default();
        module.fprop(&[&input], &mut output).unwrap();
        assert_eq!(output.x.as_slice().unwrap(), &[1.5, 2.5, 3.5]);

        output.dx.assign(&arr1(&[1.0, -1.0, 2.0]).into_dyn());
        module.bprop_input(&mut [&mut input], &output).unwrap();
        module.bprop_param(&[&input], &output).unwrap();
        assert_eq!(input.dx.as_slice().unwrap(), &[1.0, -1.0, 2.0]);
        assert_eq!(module.bias.dx.as_slice().unwrap(), &[1.0, -1.0, 2.0]);
    }

    #[test]
    fn test_per_feature_bias_broadcasts_and_reduces() {
        let mut module = Bias::new(&[2, 3], true).unwrap();
        assert_eq!(module.bias.shape(), &[2, 1]);
        module
            .bias
            .set_value(ndarray::arr2(&[[10.0], [20.0]]).into_dyn())
            .unwrap();
        let input = State::from_shape_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut output = State::default();
        module.fprop(&[&input], &mut output).unwrap();
        assert_eq!(
            output.x.iter().copied().collect::<Vec<_>>(),
            vec![11.0, 12.0, 13.0, 24.0, 25.0, 26.0]
        );

        output.dx.fill(1.0);
        output.ddx.fill(0.5);
        module.bprop_param(&[&input], &output).unwrap();
        module.bbprop_param(&[&input], &output).unwrap();
        assert_eq!(module.bias.dx.iter().copied().collect::<Vec<_>>(), vec![3.0, 3.0]);
        assert_eq!(module.bias.ddx.iter().copied().collect::<Vec<_>>(), vec![1.5, 1.5]);
    }

    #[test]
    fn test_channel_mismatch() {
        let mut module = Bias::new(&[2, 3], true).unwrap();
        let input = State::new(&[3, 3]);
        let mut output = State::default();
        assert!(matches!(
            module.fprop(&[&input], &mut output),
            Err(ModuleError::ShapeMismatch { .. })
        ));
        let flat = State::new(&[2]);
        assert!(module.fprop(&[&flat], &mut output).is_err());
    }

    #[test]
    fn test_reshaped_per_feature_bias_is_rejected() {
        let mut module = Bias::new(&[2, 3], true).unwrap();
        module.parameters_mut()[0].x = ArrayD::zeros(ndarray::IxDyn(&[2, 2]));
        let input = State::new(&[2, 3]);
        let mut output = State::new(&[5]);
        assert!(matches!(
            module.fprop(&[&input], &mut output),
            Err(ModuleError::ShapeMismatch { .. })
        ));
        assert_eq!(output.shape(), &[5]);
        assert!(module.bprop_param(&[&input], &output).is_err());
    }

    #[test]
    fn test_per_feature_needs_rank() {
        assert!(matches!(
            Bias::new(&[], true),
            Err(ModuleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_normalization_modes() {
        let mut plain = Bias::new(&[2], false).unwrap();
        plain.bias.set_value(arr1(&[3.0, 4.0]).into_dyn()).unwrap();
        plain.normalize();
        assert_eq!(plain.bias.x.as_slice().unwrap(), &[3.0, 4.0]);

        let config = BiasConfig::new(&[2]).with_normalization(BiasNormalization::UnitNorm);
        let mut unit = Bias::from_config(&config).unwrap();
        unit.bias.set_value(arr1(&[3.0, 4.0]).into_dyn()).unwrap();
        unit.normalize();
        let values = unit.bias.x.as_slice().unwrap();
        assert!((values[0] - 0.6).abs() < 1e-12);
        assert!((values[1] - 0.8).abs() < 1e-12);
    }
}
