//! # ebgraph: Energy-Based Learning Modules in Rust
//!
//! **ebgraph** is a small library of trainable modules for energy-based
//! learning. Every module runs three sweeps over shared
//! [`State`](tensor::State) buffers:
//!
//! - `fprop` computes outputs from inputs,
//! - `bprop` accumulates first derivatives of a scalar energy,
//! - `bbprop` accumulates diagonal Gauss-Newton second derivatives.
//!
//! ## Usage Example
//!
//! ```no_run
//! use ebgraph::losses::DistanceL2;
//! use ebgraph::nn::Linear;
//! use ebgraph::runtime::Graph;
//! use rand::SeedableRng;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = Graph::new();
//! let input = graph.add_state(&[3]);
//! let hidden = graph.add_state(&[2]);
//! let target = graph.add_state(&[2]);
//! let energy = graph.add_state(&[1]);
//!
//! graph.add_module(Box::new(Linear::new(&[3], &[2])), &[input], hidden)?;
//! graph.add_module(Box::new(DistanceL2::new(false)), &[hidden, target], energy)?;
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! graph.forget(&mut rng);
//! graph.state_mut(input)?.x.fill(1.0);
//!
//! graph.fprop()?;
//! graph.bprop(&[energy])?;
//! graph.bbprop(&[energy])?;
//! let weight = graph.parameters()[0];
//! println!("{} gradient {:?}", weight.name(), weight.dx);
//! # Ok(())
//! # }
//! ```

pub mod losses;
pub mod nn;
pub mod runtime;
pub mod serialization;
pub mod tensor;
