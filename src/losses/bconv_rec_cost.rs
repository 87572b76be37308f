//! Reconstruction cost against a fixed box-filter coefficient field.
//!
//! `energy = distance_l2(input1, coeff ∘ input2)`, built from two inner
//! modules that the cost owns together with their intermediate states.

use super::DistanceL2;
use crate::nn::module::{
    binary, binary_mut, check_energy, check_shape, check_state, Module, ModuleError, ModuleResult,
};
use crate::nn::multiplication::Multiplication;
use crate::tensor::State;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BconvRecCostConfig {
    /// Shape of the reconstructed field.
    pub rec_shape: Vec<usize>,
    /// Shape of the convolution kernel, same rank as `rec_shape`.
    pub kernel_shape: Vec<usize>,
    #[serde(default = "default_average")]
    pub average: bool,
}

fn default_average() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct BconvRecCost {
    product: Multiplication,
    distance: DistanceL2,
    /// Fixed coefficients; its `dx`/`ddx` only absorb discarded contributions.
    cstate: State,
    /// `cstate.x ∘ input2.x`.
    ostate: State,
}

impl BconvRecCost {
    /// Coefficient field of a stride-1 box filter.
    ///
    /// Every cell receives `1 / kernel_volume` once for each kernel window
    /// covering it, so interior cells of a field reconstructed from
    /// overlapping patches get weight 1.
    pub fn coeff_from_conv(rec_shape: &[usize], kernel_shape: &[usize]) -> ModuleResult<ArrayD<f64>> {
        if rec_shape.len() != kernel_shape.len() {
            return Err(ModuleError::InvalidConfig(format!(
                "kernel rank {} differs from reconstruction rank {}",
                kernel_shape.len(),
                rec_shape.len()
            )));
        }
        if let Some((&n, &k)) = rec_shape
            .iter()
            .zip(kernel_shape)
            .find(|&(&n, &k)| k == 0 || k > n)
        {
            return Err(ModuleError::InvalidConfig(format!(
                "kernel extent {k} does not fit dimension {n}"
            )));
        }
        let volume: usize = kernel_shape.iter().product();
        let unit = 1.0 / volume as f64;
        Ok(ArrayD::from_shape_fn(IxDyn(rec_shape), |index| {
            let windows: usize = rec_shape
                .iter()
                .zip(kernel_shape)
                .enumerate()
                .map(|(d, (&n, &k))| {
                    let i = index[d];
                    let first = i.saturating_sub(k - 1);
                    let last = i.min(n - k);
                    last - first + 1
                })
                .product();
            windows as f64 * unit
        }))
    }

    /// Builds the cost around a precomputed coefficient field.
    pub fn new(coeff: ArrayD<f64>, average: bool) -> Self {
        let ostate = State::new(coeff.shape());
        Self {
            product: Multiplication::new(),
            distance: DistanceL2::new(average),
            cstate: State::from_array(coeff),
            ostate,
        }
    }

    pub fn from_conv(rec_shape: &[usize], kernel_shape: &[usize], average: bool) -> ModuleResult<Self> {
        Ok(Self::new(Self::coeff_from_conv(rec_shape, kernel_shape)?, average))
    }

    pub fn from_config(config: &BconvRecCostConfig) -> ModuleResult<Self> {
        Self::from_conv(&config.rec_shape, &config.kernel_shape, config.average)
    }

    pub fn coeff(&self) -> &ArrayD<f64> {
        &self.cstate.x
    }

    fn check_operands(&self, input1: &State, input2: &State) -> ModuleResult<()> {
        let shape = self.cstate.shape();
        check_state("bconv_rec_cost input1", shape, input1)?;
        check_state("bconv_rec_cost input2", shape, input2)
    }
}

impl Module for BconvRecCost {
    fn name(&self) -> &'static str {
        "bconv_rec_cost"
    }

    fn arity(&self) -> usize {
        2
    }

    fn fprop(&mut self, inputs: &[&State], energy: &mut State) -> ModuleResult<()> {
        let (input1, input2) = binary(self.name(), inputs)?;
        let shape = self.cstate.shape();
        check_shape("bconv_rec_cost input1", shape, input1.shape())?;
        check_shape("bconv_rec_cost input2", shape, input2.shape())?;
        self.product.fprop(&[&self.cstate, input2], &mut self.ostate)?;
        self.distance.fprop(&[input1, &self.ostate], energy)
    }

    fn bprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let (input1, input2) = binary_mut(self.name(), inputs)?;
        self.check_operands(input1, input2)?;
        check_energy(self.name(), energy)?;
        self.cstate.clear_dx();
        self.ostate.clear_dx();
        self.distance
            .bprop_input(&mut [&mut *input1, &mut self.ostate], energy)?;
        self.product
            .bprop_input(&mut [&mut self.cstate, &mut *input2], &self.ostate)
    }

    fn bbprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let (input1, input2) = binary_mut(self.name(), inputs)?;
        self.check_operands(input1, input2)?;
        check_energy(self.name(), energy)?;
        self.cstate.clear_ddx();
        self.ostate.clear_ddx();
        self.distance
            .bbprop_input(&mut [&mut *input1, &mut self.ostate], energy)?;
        self.product
            .bbprop_input(&mut [&mut self.cstate, &mut *input2], &self.ostate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coeff_from_conv_1d() {
        let coeff = BconvRecCost::coeff_from_conv(&[5], &[3]).unwrap();
        let expected = [1.0 / 3.0, 2.0 / 3.0, 1.0, 2.0 / 3.0, 1.0 / 3.0];
        for (c, e) in coeff.iter().zip(expected.iter()) {
            assert!((c - e).abs() < 1e-12);
        }
    }

    #[test]
    fn test_coeff_from_conv_2d_is_separable() {
        let coeff = BconvRecCost::coeff_from_conv(&[3, 4], &[2, 2]).unwrap();
        assert_eq!(coeff.shape(), &[3, 4]);
        // corner: 1 window, centre row/column: 2 x 2 windows
        assert!((coeff[[0, 0]] - 0.25).abs() < 1e-12);
        assert!((coeff[[1, 1]] - 1.0).abs() < 1e-12);
        assert!((coeff[[1, 0]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_coeff_rejects_bad_kernels() {
        assert!(BconvRecCost::coeff_from_conv(&[4], &[2, 2]).is_err());
        assert!(BconvRecCost::coeff_from_conv(&[4], &[5]).is_err());
        assert!(BconvRecCost::coeff_from_conv(&[4], &[0]).is_err());
    }

    #[test]
    fn test_energy_matches_manual_computation() {
        let coeff = ArrayD::from_shape_vec(IxDyn(&[3]), vec![1.0, 0.5, 2.0]).unwrap();
        let mut cost = BconvRecCost::new(coeff, false);
        let target = State::from_shape_vec(&[3], vec![1.0, 1.0, 1.0]).unwrap();
        let rec = State::from_shape_vec(&[3], vec![1.0, 2.0, 0.0]).unwrap();
        let mut energy = State::default();
        cost.fprop(&[&target, &rec], &mut energy).unwrap();
        // coeff * rec = [1, 1, 0]; 0.5 * (0 + 0 + 1)
        assert!((energy.x[[0]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_backward_does_not_leak_inner_gradients() {
        let coeff = ArrayD::from_shape_vec(IxDyn(&[2]), vec![2.0, 3.0]).unwrap();
        let mut cost = BconvRecCost::new(coeff, false);
        let mut target = State::from_shape_vec(&[2], vec![1.0, -1.0]).unwrap();
        let mut rec = State::from_shape_vec(&[2], vec![0.5, 0.5]).unwrap();
        let mut energy = State::default();
        cost.fprop(&[&target, &rec], &mut energy).unwrap();
        energy.dx.fill(1.0);

        cost.bprop_input(&mut [&mut target, &mut rec], &energy).unwrap();
        let first = rec.dx.clone();
        cost.bprop_input(&mut [&mut target, &mut rec], &energy).unwrap();
        // inputs accumulate, the inner state is cleared before reuse
        for (twice, once) in rec.dx.iter().zip(first.iter()) {
            assert!((twice - 2.0 * once).abs() < 1e-12);
        }
        // d/drec = -coeff * (target - coeff*rec) = [-2*(1-1), -3*(-1-1.5)]
        assert!((first[[0]] - 0.0).abs() < 1e-12);
        assert!((first[[1]] - 7.5).abs() < 1e-12);
    }

    #[test]
    fn test_shape_checked_before_inner_modules_run() {
        let mut cost = BconvRecCost::from_conv(&[4], &[2], true).unwrap();
        let target = State::new(&[3]);
        let rec = State::new(&[4]);
        let mut energy = State::default();
        assert!(matches!(
            cost.fprop(&[&target, &rec], &mut energy),
            Err(ModuleError::ShapeMismatch { .. })
        ));
    }
}
