//! Execution of module graphs.
//!
//! [`Graph`] owns the states and modules of a network and runs the three
//! sweeps over them in dependency order.

pub mod graph;

pub use graph::{Graph, GraphError, GraphResult, NodeId, Phase, StateId};
