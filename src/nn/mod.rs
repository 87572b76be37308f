//! # Trainable Modules
//!
//! Building blocks with the three-sweep [`Module`] contract. Each module reads
//! its input [`State`](crate::tensor::State)s during `fprop`, writes one
//! output State, and accumulates into the input `dx`/`ddx` buffers during the
//! backward sweeps.
//!
//! ## Available Modules
//!
//! - [`Linear`]: dense `W·x` over flattened input and output shapes
//! - [`Bias`]: additive bias, full-shape or per leading-dimension channel
//! - [`Multiplication`]: elementwise product of two States
//!
//! Energies live in [`crate::losses`]. [`ModuleConfig`] builds any of them
//! from JSON.
//!
//! ## Example
//!
//! ```ignore
//! use ebgraph::nn::{Linear, Module};
//! use ebgraph::tensor::State;
//!
//! let mut linear = Linear::new(&[3], &[2]);
//! linear.forget(&mut rng);
//! let input = State::from_shape_vec(&[3], vec![1.0, 2.0, 3.0])?;
//! let mut output = State::default();
//! linear.fprop(&[&input], &mut output)?;
//! ```

pub mod bias;
pub mod config;
pub mod linear;
pub mod module;
pub mod multiplication;
pub mod parameter;

pub use bias::{Bias, BiasConfig, BiasNormalization};
pub use config::{ConfigError, ModuleConfig};
pub use linear::{Linear, LinearConfig};
pub use module::{Module, ModuleError, ModuleResult};
pub use multiplication::Multiplication;
pub use parameter::{ForgetConfig, Parameter};
