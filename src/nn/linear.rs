//! Fully connected (affine) layer: `out[] = w[][] · in[]`.

use crate::nn::module::{check_shape, unary, unary_mut, Module, ModuleError, ModuleResult};
use crate::nn::parameter::{ForgetConfig, Parameter};
use crate::tensor::{product, State};
use ndarray::{Array1, Array2, ArrayD, ArrayView2, Ix2};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Configuration for the `Linear` module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConfig {
    /// Declared input shape; flattened to `size_in` elements.
    pub shape_in: Vec<usize>,
    /// Declared output shape; flattened to `size_out` elements.
    pub shape_out: Vec<usize>,
    #[serde(default)]
    pub forget: ForgetConfig,
}

impl LinearConfig {
    pub fn new(shape_in: &[usize], shape_out: &[usize]) -> Self {
        Self {
            shape_in: shape_in.to_vec(),
            shape_out: shape_out.to_vec(),
            forget: ForgetConfig::default(),
        }
    }

    pub fn with_forget(mut self, forget: ForgetConfig) -> Self {
        self.forget = forget;
        self
    }
}

/// Dense matrix-vector layer.
///
/// The weight has shape `(size_out, size_in)`; the input is flattened in
/// row-major order and the product is reshaped to `shape_out`.
#[derive(Debug, Clone)]
pub struct Linear {
    shape_in: Vec<usize>,
    shape_out: Vec<usize>,
    forget: ForgetConfig,
    /// Weight matrix, shape `(size_out, size_in)`.
    pub weight: Parameter,
}

impl Linear {
    /// Creates a layer with a zero weight; call `forget` to randomize it.
    pub fn new(shape_in: &[usize], shape_out: &[usize]) -> Self {
        Self::from_config(&LinearConfig::new(shape_in, shape_out))
    }

    pub fn from_config(config: &LinearConfig) -> Self {
        let size_in = product(&config.shape_in);
        let size_out = product(&config.shape_out);
        Self {
            shape_in: config.shape_in.clone(),
            shape_out: config.shape_out.clone(),
            forget: config.forget,
            weight: Parameter::new("linear.weight", &[size_out, size_in]),
        }
    }

    pub fn shape_in(&self) -> &[usize] {
        &self.shape_in
    }

    pub fn shape_out(&self) -> &[usize] {
        &self.shape_out
    }

    fn size_in(&self) -> usize {
        product(&self.shape_in)
    }

    fn size_out(&self) -> usize {
        product(&self.shape_out)
    }

    /// Weight value as a matrix, after checking it still has its declared shape.
    fn weight_matrix(&self) -> ModuleResult<ArrayView2<'_, f64>> {
        let expected = [self.size_out(), self.size_in()];
        check_shape("linear weight", &expected, self.weight.x.shape())?;
        self.weight
            .x
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| ModuleError::ShapeMismatch {
                context: "linear weight".to_string(),
                expected: expected.to_vec(),
                actual: self.weight.x.shape().to_vec(),
            })
    }

    fn check_weight_buffers(&self) -> ModuleResult<()> {
        let expected = [self.size_out(), self.size_in()];
        check_shape("linear weight.dx", &expected, self.weight.dx.shape())?;
        check_shape("linear weight.ddx", &expected, self.weight.ddx.shape())
    }
}

fn flatten(array: &ArrayD<f64>) -> Array1<f64> {
    array.iter().copied().collect()
}

fn outer(left: &Array1<f64>, right: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((left.len(), right.len()), |(i, j)| left[i] * right[j])
}

fn accumulate(target: &mut ArrayD<f64>, values: &Array1<f64>) {
    for (t, v) in target.iter_mut().zip(values.iter()) {
        *t += v;
    }
}

impl Module for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn arity(&self) -> usize {
        1
    }

    fn fprop(&mut self, inputs: &[&State], output: &mut State) -> ModuleResult<()> {
        let input = unary(self.name(), inputs)?;
        check_shape("linear input", &self.shape_in, input.shape())?;
        let weight = self.weight_matrix()?;
        let result = weight.dot(&flatten(&input.x));
        output.resize(&self.shape_out);
        for (o, v) in output.x.iter_mut().zip(result.iter()) {
            *o = *v;
        }
        Ok(())
    }

    fn bprop_input(&mut self, inputs: &mut [&mut State], output: &State) -> ModuleResult<()> {
        let input = unary_mut(self.name(), inputs)?;
        check_shape("linear input.dx", &self.shape_in, input.dx.shape())?;
        check_shape("linear output.dx", &self.shape_out, output.dx.shape())?;
        let weight = self.weight_matrix()?;
        let grad = weight.t().dot(&flatten(&output.dx));
        accumulate(&mut input.dx, &grad);
        Ok(())
    }

    fn bprop_param(&mut self, inputs: &[&State], output: &State) -> ModuleResult<()> {
        let input = unary(self.name(), inputs)?;
        check_shape("linear input", &self.shape_in, input.shape())?;
        check_shape("linear output.dx", &self.shape_out, output.dx.shape())?;
        self.check_weight_buffers()?;
        let grad = outer(&flatten(&output.dx), &flatten(&input.x));
        for (w, g) in self.weight.dx.iter_mut().zip(grad.iter()) {
            *w += g;
        }
        Ok(())
    }

    fn bbprop_input(&mut self, inputs: &mut [&mut State], output: &State) -> ModuleResult<()> {
        let input = unary_mut(self.name(), inputs)?;
        check_shape("linear input.ddx", &self.shape_in, input.ddx.shape())?;
        check_shape("linear output.ddx", &self.shape_out, output.ddx.shape())?;
        let squared = self.weight_matrix()?.mapv(|w| w * w);
        let curvature = squared.t().dot(&flatten(&output.ddx));
        accumulate(&mut input.ddx, &curvature);
        Ok(())
    }

    fn bbprop_param(&mut self, inputs: &[&State], output: &State) -> ModuleResult<()> {
        let input = unary(self.name(), inputs)?;
        check_shape("linear input", &self.shape_in, input.shape())?;
        check_shape("linear output.ddx", &self.shape_out, output.ddx.shape())?;
        self.check_weight_buffers()?;
        let input_sq = flatten(&input.x).mapv(|v| v * v);
        let curvature = outer(&flatten(&output.ddx), &input_sq);
        for (w, c) in self.weight.ddx.iter_mut().zip(curvature.iter()) {
            *w += c;
        }
        Ok(())
    }

    fn forget(&mut self, rng: &mut dyn RngCore) {
        let z = self.forget.range(self.size_in());
        self.weight.forget_uniform(z, rng);
    }

    fn normalize(&mut self) {
        self.weight.normalize_columns();
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight]
    }
}
