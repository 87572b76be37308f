//! Module defining the core `Module` trait for every computational node.

use crate::nn::parameter::Parameter;
use crate::tensor::State;
use rand::RngCore;
use thiserror::Error;

/// Errors raised by module operations.
///
/// Every check runs before any buffer is written, so a failed call leaves all
/// states exactly as they were.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("module `{module}` takes {expected} input state(s), got {actual}")]
    InputCount {
        module: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid module configuration: {0}")]
    InvalidConfig(String),
}

pub type ModuleResult<T> = Result<T, ModuleError>;

/// Common interface of all modules.
///
/// A module reads `arity()` input states and writes exactly one output state.
/// Forward writes `output.x` (overwrite). The backward operations read
/// `output.dx` / `output.ddx` and accumulate into the inputs (`*_input`) or
/// into the owned parameter (`*_param`).
///
/// The curvature sweep (`bbprop_*`) propagates squared Jacobian entries, i.e.
/// the diagonal Gauss-Newton approximation of the Hessian. Off-diagonal terms
/// are dropped.
///
/// A module has no notion of which phase it is in: it trusts that
/// `output.dx` / `output.ddx` were populated before a backward call.
pub trait Module {
    /// Short module kind, used in errors and logs.
    fn name(&self) -> &'static str;

    /// Number of input states.
    fn arity(&self) -> usize;

    /// Computes `output.x` from the inputs' values.
    fn fprop(&mut self, inputs: &[&State], output: &mut State) -> ModuleResult<()>;

    /// Accumulates `Jᵗ · output.dx` into each input's `dx`.
    fn bprop_input(&mut self, inputs: &mut [&mut State], output: &State) -> ModuleResult<()>;

    /// Accumulates the parameter gradient. No-op for parameterless modules.
    fn bprop_param(&mut self, _inputs: &[&State], _output: &State) -> ModuleResult<()> {
        Ok(())
    }

    /// Accumulates `(J∘J)ᵗ · output.ddx` (plus second-derivative terms of the
    /// cost functions) into each input's `ddx`.
    fn bbprop_input(&mut self, inputs: &mut [&mut State], output: &State) -> ModuleResult<()>;

    /// Accumulates the parameter curvature. No-op for parameterless modules.
    fn bbprop_param(&mut self, _inputs: &[&State], _output: &State) -> ModuleResult<()> {
        Ok(())
    }

    /// Re-initializes the owned parameter from the configured random rule.
    fn forget(&mut self, _rng: &mut dyn RngCore) {}

    /// Rescales the owned parameter per the module's normalization rule.
    fn normalize(&mut self) {}

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }
}

pub(crate) fn check_shape(context: &str, expected: &[usize], actual: &[usize]) -> ModuleResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModuleError::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

/// Checks that all three buffers of `state` have `expected` shape.
pub(crate) fn check_state(context: &str, expected: &[usize], state: &State) -> ModuleResult<()> {
    check_shape(context, expected, state.x.shape())?;
    check_shape(context, expected, state.dx.shape())?;
    check_shape(context, expected, state.ddx.shape())
}

/// Energy states hold exactly one element.
pub(crate) fn check_energy(module: &'static str, energy: &State) -> ModuleResult<()> {
    check_shape(&format!("{module} energy.dx"), &[1], energy.dx.shape())?;
    check_shape(&format!("{module} energy.ddx"), &[1], energy.ddx.shape())
}

pub(crate) fn energy_dx(energy: &State) -> f64 {
    energy.dx.iter().next().copied().unwrap_or(0.0)
}

pub(crate) fn energy_ddx(energy: &State) -> f64 {
    energy.ddx.iter().next().copied().unwrap_or(0.0)
}

pub(crate) fn unary<'a>(module: &'static str, inputs: &[&'a State]) -> ModuleResult<&'a State> {
    match inputs {
        [input] => Ok(*input),
        _ => Err(ModuleError::InputCount {
            module,
            expected: 1,
            actual: inputs.len(),
        }),
    }
}

pub(crate) fn unary_mut<'s>(
    module: &'static str,
    inputs: &'s mut [&mut State],
) -> ModuleResult<&'s mut State> {
    let actual = inputs.len();
    match inputs {
        [input] => Ok(&mut **input),
        _ => Err(ModuleError::InputCount {
            module,
            expected: 1,
            actual,
        }),
    }
}

pub(crate) fn binary<'a>(
    module: &'static str,
    inputs: &[&'a State],
) -> ModuleResult<(&'a State, &'a State)> {
    match inputs {
        [first, second] => Ok((*first, *second)),
        _ => Err(ModuleError::InputCount {
            module,
            expected: 2,
            actual: inputs.len(),
        }),
    }
}

pub(crate) fn binary_mut<'s>(
    module: &'static str,
    inputs: &'s mut [&mut State],
) -> ModuleResult<(&'s mut State, &'s mut State)> {
    let actual = inputs.len();
    match inputs {
        [first, second] => Ok((&mut **first, &mut **second)),
        _ => Err(ModuleError::InputCount {
            module,
            expected: 2,
            actual,
        }),
    }
}

/// `sign` with `sign(0) == 0`, unlike `f64::signum`.
pub(crate) fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}
