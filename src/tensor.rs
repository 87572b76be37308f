//! Module defining `State`, the tensor container that flows between modules.
//!
//! A `State` bundles three buffers of identical shape:
//!
//! - `x`: the current value, written by the producing module's `fprop`;
//! - `dx`: the gradient accumulator, filled by the first backward sweep;
//! - `ddx`: the curvature accumulator, filled by the second backward sweep.
//!
//! Modules only ever accumulate (`+=`) into `dx`/`ddx`, so a `State` read by
//! several consumers receives the sum of their contributions. Clearing the
//! accumulators between independent sweeps is the caller's job (see
//! [`crate::runtime::Graph`], which does it for you).

use ndarray::{ArrayD, IxDyn};

/// Value/gradient/curvature buffers for one edge of the module graph.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct State {
    /// Current value.
    pub x: ArrayD<f64>,
    /// Gradient accumulator, same shape as `x`.
    pub dx: ArrayD<f64>,
    /// Curvature accumulator, same shape as `x`.
    pub ddx: ArrayD<f64>,
}

impl State {
    /// Allocates a zero-filled `State` of the given shape.
    pub fn new(shape: &[usize]) -> Self {
        Self {
            x: ArrayD::zeros(IxDyn(shape)),
            dx: ArrayD::zeros(IxDyn(shape)),
            ddx: ArrayD::zeros(IxDyn(shape)),
        }
    }

    /// Wraps an existing value; the accumulators start at zero.
    pub fn from_array(x: ArrayD<f64>) -> Self {
        let dx = ArrayD::zeros(x.raw_dim());
        let ddx = ArrayD::zeros(x.raw_dim());
        Self { x, dx, ddx }
    }

    /// Builds a `State` from a shape and row-major values.
    pub fn from_shape_vec(shape: &[usize], values: Vec<f64>) -> Result<Self, ndarray::ShapeError> {
        ArrayD::from_shape_vec(IxDyn(shape), values).map(Self::from_array)
    }

    pub fn shape(&self) -> &[usize] {
        self.x.shape()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.x.len()
    }

    /// Reallocates all three buffers (zero-filled) if `shape` differs from the
    /// current one. Calling it with the current shape keeps every buffer as is.
    pub fn resize(&mut self, shape: &[usize]) {
        if self.x.shape() == shape
            && self.dx.shape() == shape
            && self.ddx.shape() == shape
        {
            return;
        }
        *self = Self::new(shape);
    }

    pub fn clear_dx(&mut self) {
        self.dx.fill(0.0);
    }

    pub fn clear_ddx(&mut self) {
        self.ddx.fill(0.0);
    }

    /// Zeroes both accumulators, leaving `x` untouched.
    pub fn clear(&mut self) {
        self.clear_dx();
        self.clear_ddx();
    }
}

/// Product of the dimension sizes.
pub fn product(shape: &[usize]) -> usize {
    shape.iter().product()
}
