//! Cost (energy) modules.
//!
//! Each module reduces one or two input states to a single-element energy
//! state of shape `(1,)`. None of them owns a parameter.
//!
//! # Available Energies
//!
//! - **`DistanceL2`**: `0.5·‖x1 − x2‖²`
//! - **`CrossEntropy`**: `−x2 · log(softmax(x1))`
//! - **`PenaltyL1`**: `Σ|x|` with a dead-zone threshold on the subgradient
//! - **`PenaltyL2`**: `0.5·‖x‖²`
//! - **`BconvRecCost`**: reconstruction error against a fixed coefficient field
//!
//! With `average` set, the energy and all of its derivatives are divided by
//! the input element count.

mod bconv_rec_cost;

pub use bconv_rec_cost::{BconvRecCost, BconvRecCostConfig};

use crate::nn::module::{
    binary, binary_mut, check_energy, check_shape, check_state, energy_ddx, energy_dx, sign,
    unary, unary_mut, Module, ModuleResult,
};
use crate::tensor::State;
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

const ENERGY_SHAPE: [usize; 1] = [1];

fn set_energy(energy: &mut State, value: f64) {
    energy.resize(&ENERGY_SHAPE);
    energy.x.fill(value);
}

/// `1/N` when averaging, `1` otherwise. Empty inputs are not divided.
fn scale(average: bool, size: usize) -> f64 {
    if average && size > 0 {
        1.0 / size as f64
    } else {
        1.0
    }
}

// ============================================================================
// Squared distance
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceL2Config {
    pub average: bool,
}

impl Default for DistanceL2Config {
    fn default() -> Self {
        Self { average: true }
    }
}

/// Half squared Euclidean distance between two states of equal shape.
#[derive(Debug, Clone)]
pub struct DistanceL2 {
    average: bool,
}

impl DistanceL2 {
    pub fn new(average: bool) -> Self {
        Self { average }
    }

    pub fn from_config(config: &DistanceL2Config) -> Self {
        Self::new(config.average)
    }

    fn check_operands(input1: &State, input2: &State) -> ModuleResult<Vec<usize>> {
        let shape = input1.shape().to_vec();
        check_state("distance_l2 input1", &shape, input1)?;
        check_state("distance_l2 input2", &shape, input2)?;
        Ok(shape)
    }
}

impl Default for DistanceL2 {
    fn default() -> Self {
        Self::from_config(&DistanceL2Config::default())
    }
}

impl Module for DistanceL2 {
    fn name(&self) -> &'static str {
        "distance_l2"
    }

    fn arity(&self) -> usize {
        2
    }

    fn fprop(&mut self, inputs: &[&State], energy: &mut State) -> ModuleResult<()> {
        let (input1, input2) = binary(self.name(), inputs)?;
        check_shape("distance_l2 input2", input1.shape(), input2.shape())?;
        let coeff = 0.5 * scale(self.average, input1.size());
        let sqdist = Zip::from(&input1.x)
            .and(&input2.x)
            .fold(0.0, |acc, &a, &b| acc + (a - b) * (a - b));
        set_energy(energy, sqdist * coeff);
        Ok(())
    }

    fn bprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let (input1, input2) = binary_mut(self.name(), inputs)?;
        Self::check_operands(input1, input2)?;
        check_energy(self.name(), energy)?;
        let edx = energy_dx(energy) * scale(self.average, input1.size());
        Zip::from(&mut input1.dx)
            .and(&mut input2.dx)
            .and(&input1.x)
            .and(&input2.x)
            .for_each(|d1, d2, &a, &b| {
                let r = (a - b) * edx;
                *d1 += r;
                *d2 -= r;
            });
        Ok(())
    }

    fn bbprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let (input1, input2) = binary_mut(self.name(), inputs)?;
        Self::check_operands(input1, input2)?;
        check_energy(self.name(), energy)?;
        let s = scale(self.average, input1.size());
        let edx = energy_dx(energy) * s;
        let eddx = energy_ddx(energy);
        Zip::from(&mut input1.ddx)
            .and(&mut input2.ddx)
            .and(&input1.x)
            .and(&input2.x)
            .for_each(|dd1, dd2, &a, &b| {
                let d = (a - b) * s;
                let c = d * d * eddx + edx;
                *dd1 += c;
                *dd2 += c;
            });
        Ok(())
    }
}

// ============================================================================
// Softmax cross-entropy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossEntropyConfig {
    pub average: bool,
}

/// Cross-entropy between `softmax(x1)` (logits) and a target `x2`.
///
/// The softmax is taken over all elements of `x1`. The target does not have
/// to be normalized: with `sum2 = Σ x2`, the logit gradient is
/// `sum2·softmax(x1) − x2`, which is exact for any target.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropy {
    average: bool,
}

/// Softmax and log-softmax of all elements, shifted by the max for stability.
fn softmax(x: &ArrayD<f64>) -> (ArrayD<f64>, ArrayD<f64>) {
    let max = x.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let log_norm = max + x.fold(0.0, |acc, &v| acc + (v - max).exp()).ln();
    let log_softmax = x.mapv(|v| v - log_norm);
    let softmax = log_softmax.mapv(f64::exp);
    (softmax, log_softmax)
}

impl CrossEntropy {
    pub fn new(average: bool) -> Self {
        Self { average }
    }

    pub fn from_config(config: &CrossEntropyConfig) -> Self {
        Self::new(config.average)
    }

    fn check_operands(input1: &State, input2: &State) -> ModuleResult<Vec<usize>> {
        let shape = input1.shape().to_vec();
        check_state("cross_entropy input1", &shape, input1)?;
        check_state("cross_entropy input2", &shape, input2)?;
        Ok(shape)
    }

    fn target_sum(target: &State) -> f64 {
        let sum2 = target.x.sum();
        if (sum2 - 1.0).abs() > 1e-6 {
            log::debug!("cross_entropy target sums to {}, not 1", sum2);
        }
        sum2
    }
}

impl Module for CrossEntropy {
    fn name(&self) -> &'static str {
        "cross_entropy"
    }

    fn arity(&self) -> usize {
        2
    }

    fn fprop(&mut self, inputs: &[&State], energy: &mut State) -> ModuleResult<()> {
        let (input1, input2) = binary(self.name(), inputs)?;
        check_shape("cross_entropy input2", input1.shape(), input2.shape())?;
        let (_, log_softmax) = softmax(&input1.x);
        let value = -Zip::from(&input2.x)
            .and(&log_softmax)
            .fold(0.0, |acc, &t, &l| if t == 0.0 { acc } else { acc + t * l });
        set_energy(energy, value * scale(self.average, input1.size()));
        Ok(())
    }

    fn bprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let (input1, input2) = binary_mut(self.name(), inputs)?;
        Self::check_operands(input1, input2)?;
        check_energy(self.name(), energy)?;
        let edx = energy_dx(energy) * scale(self.average, input1.size());
        let (softmax, log_softmax) = softmax(&input1.x);
        let sum2 = Self::target_sum(input2);
        Zip::from(&mut input1.dx)
            .and(&mut input2.dx)
            .and(&input2.x)
            .and(&softmax)
            .and(&log_softmax)
            .for_each(|d1, d2, &t, &s, &l| {
                *d1 += edx * (sum2 * s - t);
                *d2 -= edx * l;
            });
        Ok(())
    }

    fn bbprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let (input1, input2) = binary_mut(self.name(), inputs)?;
        Self::check_operands(input1, input2)?;
        check_energy(self.name(), energy)?;
        let s = scale(self.average, input1.size());
        let edx = energy_dx(energy) * s;
        let eddx = energy_ddx(energy);
        let (softmax, log_softmax) = softmax(&input1.x);
        let sum2 = Self::target_sum(input2);
        Zip::from(&mut input1.ddx)
            .and(&mut input2.ddx)
            .and(&input2.x)
            .and(&softmax)
            .and(&log_softmax)
            .for_each(|dd1, dd2, &t, &p, &l| {
                let d1 = (sum2 * p - t) * s;
                let d2 = l * s;
                *dd1 += eddx * d1 * d1 + edx * sum2 * p * (1.0 - p);
                // `d2` is infinite for a masked `-inf` logit
                if eddx != 0.0 {
                    *dd2 += eddx * d2 * d2;
                }
            });
        Ok(())
    }
}

// ============================================================================
// L1 penalty
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyL1Config {
    /// Entries with `|x| < threshold` get no gradient. `0` disables the dead zone.
    pub threshold: f64,
    pub average: bool,
}

impl Default for PenaltyL1Config {
    fn default() -> Self {
        Self {
            threshold: 1e-4,
            average: true,
        }
    }
}

/// Sum of absolute values, with a thresholded subgradient.
#[derive(Debug, Clone)]
pub struct PenaltyL1 {
    threshold: f64,
    average: bool,
}

impl PenaltyL1 {
    pub fn new(threshold: f64, average: bool) -> Self {
        Self { threshold, average }
    }

    pub fn from_config(config: &PenaltyL1Config) -> Self {
        Self::new(config.threshold, config.average)
    }

    fn is_live(&self, value: f64) -> bool {
        self.threshold <= 0.0 || value.abs() >= self.threshold
    }
}

impl Default for PenaltyL1 {
    fn default() -> Self {
        Self::from_config(&PenaltyL1Config::default())
    }
}

impl Module for PenaltyL1 {
    fn name(&self) -> &'static str {
        "penalty_l1"
    }

    fn arity(&self) -> usize {
        1
    }

    fn fprop(&mut self, inputs: &[&State], energy: &mut State) -> ModuleResult<()> {
        let input = unary(self.name(), inputs)?;
        let value = input.x.fold(0.0, |acc, &v| acc + v.abs());
        set_energy(energy, value * scale(self.average, input.size()));
        Ok(())
    }

    fn bprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let input = unary_mut(self.name(), inputs)?;
        check_state("penalty_l1 input", &input.shape().to_vec(), input)?;
        check_energy(self.name(), energy)?;
        let edx = energy_dx(energy) * scale(self.average, input.size());
        Zip::from(&mut input.dx).and(&input.x).for_each(|d, &v| {
            if self.is_live(v) {
                *d += sign(v) * edx;
            }
        });
        Ok(())
    }

    fn bbprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let input = unary_mut(self.name(), inputs)?;
        check_state("penalty_l1 input", &input.shape().to_vec(), input)?;
        check_energy(self.name(), energy)?;
        let s = scale(self.average, input.size());
        let eddx = energy_ddx(energy) * s * s;
        Zip::from(&mut input.ddx).and(&input.x).for_each(|dd, &v| {
            if self.is_live(v) {
                *dd += eddx;
            }
        });
        Ok(())
    }
}

// ============================================================================
// L2 penalty
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyL2Config {
    pub average: bool,
}

impl Default for PenaltyL2Config {
    fn default() -> Self {
        Self { average: true }
    }
}

/// Half squared norm (ridge term).
#[derive(Debug, Clone)]
pub struct PenaltyL2 {
    average: bool,
}

impl PenaltyL2 {
    pub fn new(average: bool) -> Self {
        Self { average }
    }

    pub fn from_config(config: &PenaltyL2Config) -> Self {
        Self::new(config.average)
    }
}

impl Default for PenaltyL2 {
    fn default() -> Self {
        Self::from_config(&PenaltyL2Config::default())
    }
}

impl Module for PenaltyL2 {
    fn name(&self) -> &'static str {
        "penalty_l2"
    }

    fn arity(&self) -> usize {
        1
    }

    fn fprop(&mut self, inputs: &[&State], energy: &mut State) -> ModuleResult<()> {
        let input = unary(self.name(), inputs)?;
        let value = 0.5 * input.x.fold(0.0, |acc, &v| acc + v * v);
        set_energy(energy, value * scale(self.average, input.size()));
        Ok(())
    }

    fn bprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let input = unary_mut(self.name(), inputs)?;
        check_state("penalty_l2 input", &input.shape().to_vec(), input)?;
        check_energy(self.name(), energy)?;
        let edx = energy_dx(energy) * scale(self.average, input.size());
        Zip::from(&mut input.dx)
            .and(&input.x)
            .for_each(|d, &v| *d += v * edx);
        Ok(())
    }

    fn bbprop_input(&mut self, inputs: &mut [&mut State], energy: &State) -> ModuleResult<()> {
        let input = unary_mut(self.name(), inputs)?;
        check_state("penalty_l2 input", &input.shape().to_vec(), input)?;
        check_energy(self.name(), energy)?;
        let s = scale(self.average, input.size());
        let edx = energy_dx(energy) * s;
        let eddx = energy_ddx(energy);
        Zip::from(&mut input.ddx).and(&input.x).for_each(|dd, &v| {
            let d = v * s;
            *dd += d * d * eddx + edx;
        });
        Ok(())
    }
}
