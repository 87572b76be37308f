//! Sweep driver for a graph of modules.
//!
//! `Graph` owns every `State` and every module. It visits modules in
//! topological order for `fprop` and in reverse order for the two backward
//! sweeps, and it owns the accumulator lifecycle: each sweep zeroes the
//! buffers it fills and seeds the energies before visiting any module.
//!
//! The backward sweeps take a list of energy states. The objective is their
//! sum, so a data term and its regularisers can be trained together without
//! a summing module.

use crate::nn::module::{Module, ModuleError, ModuleResult};
use crate::nn::parameter::Parameter;
use crate::tensor::State;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rand::RngCore;
use thiserror::Error;

/// Index of a state in a `Graph`.
pub type StateId = usize;
/// Index of a module node in a `Graph`.
pub type NodeId = usize;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    #[error("state {0} does not exist")]
    UnknownState(StateId),

    #[error("node {0} does not exist")]
    UnknownNode(NodeId),

    #[error("state {state} is already the output of node {producer}")]
    AlreadyProduced { state: StateId, producer: NodeId },

    #[error("state {0} is bound more than once by the same module")]
    AliasedState(StateId),

    #[error("adding node {0} would create a cycle")]
    Cycle(NodeId),

    #[error("cannot run the {requested:?} sweep in phase {current:?}")]
    PhaseOrder { requested: Phase, current: Phase },

    #[error("energy state {state} has shape {shape:?}, expected a single element")]
    NotScalar { state: StateId, shape: Vec<usize> },

    #[error("a backward sweep needs at least one energy state")]
    NoEnergy,

    #[error("energy state {0} is listed more than once")]
    DuplicateEnergy(StateId),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Last sweep completed since the states were last modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Forward,
    Gradient,
    Curvature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweep {
    Gradient,
    Curvature,
}

struct Node {
    module: Box<dyn Module>,
    inputs: Vec<StateId>,
    output: StateId,
}

/// A directed acyclic graph of modules connected by states.
pub struct Graph {
    states: Vec<State>,
    producers: Vec<Option<NodeId>>,
    nodes: Vec<Node>,
    order: Vec<NodeId>,
    phase: Phase,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            producers: Vec::new(),
            nodes: Vec::new(),
            order: Vec::new(),
            phase: Phase::Idle,
        }
    }

    /// Allocates a zero-filled state. Module outputs may start with any shape
    /// since `fprop` resizes them.
    pub fn add_state(&mut self, shape: &[usize]) -> StateId {
        self.states.push(State::new(shape));
        self.producers.push(None);
        self.phase = Phase::Idle;
        self.states.len() - 1
    }

    /// Connects `module` from `inputs` to `output`.
    pub fn add_module(
        &mut self,
        module: Box<dyn Module>,
        inputs: &[StateId],
        output: StateId,
    ) -> GraphResult<NodeId> {
        for &id in inputs.iter().chain(std::iter::once(&output)) {
            if id >= self.states.len() {
                return Err(GraphError::UnknownState(id));
            }
        }
        if module.arity() != inputs.len() {
            return Err(ModuleError::InputCount {
                module: module.name(),
                expected: module.arity(),
                actual: inputs.len(),
            }
            .into());
        }
        for (position, &id) in inputs.iter().enumerate() {
            if id == output || inputs[..position].contains(&id) {
                return Err(GraphError::AliasedState(id));
            }
        }
        if let Some(producer) = self.producers[output] {
            return Err(GraphError::AlreadyProduced {
                state: output,
                producer,
            });
        }

        let id = self.nodes.len();
        log::debug!("node {}: {} {:?} -> {}", id, module.name(), inputs, output);
        self.nodes.push(Node {
            module,
            inputs: inputs.to_vec(),
            output,
        });
        self.producers[output] = Some(id);
        match self.sorted() {
            Ok(order) => {
                self.order = order;
                self.phase = Phase::Idle;
                Ok(id)
            }
            Err(err) => {
                self.nodes.pop();
                self.producers[output] = None;
                Err(err)
            }
        }
    }

    /// Topological order of the nodes, producers before consumers.
    fn sorted(&self) -> GraphResult<Vec<NodeId>> {
        let mut dag: DiGraph<NodeId, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..self.nodes.len()).map(|id| dag.add_node(id)).collect();
        for (consumer, node) in self.nodes.iter().enumerate() {
            for &input in &node.inputs {
                if let Some(producer) = self.producers[input] {
                    dag.add_edge(indices[producer], indices[consumer], ());
                }
            }
        }
        toposort(&dag, None)
            .map(|sorted| sorted.into_iter().map(|index| dag[index]).collect())
            .map_err(|cycle| GraphError::Cycle(dag[cycle.node_id()]))
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self, id: StateId) -> GraphResult<&State> {
        self.states.get(id).ok_or(GraphError::UnknownState(id))
    }

    /// Mutable access to a state, e.g. to load an input. Invalidates the
    /// sweeps run so far.
    pub fn state_mut(&mut self, id: StateId) -> GraphResult<&mut State> {
        self.phase = Phase::Idle;
        self.states.get_mut(id).ok_or(GraphError::UnknownState(id))
    }

    pub fn module(&self, id: NodeId) -> GraphResult<&dyn Module> {
        self.nodes
            .get(id)
            .map(|node| node.module.as_ref())
            .ok_or(GraphError::UnknownNode(id))
    }

    /// Mutable access to a module. Invalidates the sweeps run so far.
    pub fn module_mut(&mut self, id: NodeId) -> GraphResult<&mut dyn Module> {
        self.phase = Phase::Idle;
        match self.nodes.get_mut(id) {
            Some(node) => Ok(node.module.as_mut()),
            None => Err(GraphError::UnknownNode(id)),
        }
    }

    /// Every parameter of every module, in node order.
    pub fn parameters(&self) -> Vec<&Parameter> {
        self.nodes
            .iter()
            .flat_map(|node| node.module.parameters())
            .collect()
    }

    pub fn forget(&mut self, rng: &mut dyn RngCore) {
        for node in &mut self.nodes {
            node.module.forget(rng);
        }
        self.phase = Phase::Idle;
    }

    pub fn normalize(&mut self) {
        for node in &mut self.nodes {
            node.module.normalize();
        }
        self.phase = Phase::Idle;
    }

    /// Runs every module's `fprop` in topological order.
    pub fn fprop(&mut self) -> GraphResult<()> {
        log::debug!("fprop over {} nodes", self.order.len());
        self.phase = Phase::Idle;
        let Self {
            states,
            nodes,
            order,
            ..
        } = self;
        for &id in order.iter() {
            let node = &mut nodes[id];
            log::trace!("fprop node {} ({})", id, node.module.name());
            forward(node, states)?;
        }
        self.phase = Phase::Forward;
        Ok(())
    }

    /// Gradient sweep of the summed `energies`.
    ///
    /// Zeroes every `dx` (states and parameters), sets `dx = 1` on each
    /// energy, then runs `bprop_input` and `bprop_param` in reverse
    /// topological order.
    pub fn bprop(&mut self, energies: &[StateId]) -> GraphResult<()> {
        if self.phase == Phase::Idle {
            return Err(GraphError::PhaseOrder {
                requested: Phase::Gradient,
                current: self.phase,
            });
        }
        self.check_energies(energies)?;
        for state in &mut self.states {
            state.clear_dx();
        }
        for node in &mut self.nodes {
            for param in node.module.parameters_mut() {
                param.clear_dx();
            }
        }
        for &energy in energies {
            self.states[energy].dx.fill(1.0);
        }
        self.run_backward(Sweep::Gradient)?;
        self.phase = Phase::Gradient;
        Ok(())
    }

    /// Curvature sweep of the summed `energies`; needs the gradients of a
    /// prior `bprop`.
    ///
    /// Zeroes every `ddx`, leaves each energy's `ddx = 0` (the Gauss-Newton
    /// seed), then runs `bbprop_input` and `bbprop_param` in reverse
    /// topological order.
    pub fn bbprop(&mut self, energies: &[StateId]) -> GraphResult<()> {
        if !matches!(self.phase, Phase::Gradient | Phase::Curvature) {
            return Err(GraphError::PhaseOrder {
                requested: Phase::Curvature,
                current: self.phase,
            });
        }
        self.check_energies(energies)?;
        for state in &mut self.states {
            state.clear_ddx();
        }
        for node in &mut self.nodes {
            for param in node.module.parameters_mut() {
                param.clear_ddx();
            }
        }
        self.run_backward(Sweep::Curvature)?;
        self.phase = Phase::Curvature;
        Ok(())
    }

    fn check_energies(&self, energies: &[StateId]) -> GraphResult<()> {
        if energies.is_empty() {
            return Err(GraphError::NoEnergy);
        }
        for (position, &energy) in energies.iter().enumerate() {
            let state = self.state(energy)?;
            if state.size() != 1 {
                return Err(GraphError::NotScalar {
                    state: energy,
                    shape: state.shape().to_vec(),
                });
            }
            if energies[..position].contains(&energy) {
                return Err(GraphError::DuplicateEnergy(energy));
            }
        }
        Ok(())
    }

    fn run_backward(&mut self, sweep: Sweep) -> GraphResult<()> {
        log::debug!("{:?} sweep over {} nodes", sweep, self.order.len());
        let Self {
            states,
            nodes,
            order,
            ..
        } = self;
        for &id in order.iter().rev() {
            let node = &mut nodes[id];
            log::trace!("{:?} node {} ({})", sweep, id, node.module.name());
            backward(node, states, sweep)?;
        }
        Ok(())
    }
}

fn forward(node: &mut Node, states: &mut [State]) -> ModuleResult<()> {
    let mut output = std::mem::take(&mut states[node.output]);
    let result = {
        let inputs: Vec<&State> = node.inputs.iter().map(|&id| &states[id]).collect();
        node.module.fprop(&inputs, &mut output)
    };
    states[node.output] = output;
    result
}

/// Moves the inputs out of `states` for the duration of the call so the
/// module can write them while reading the output.
fn backward(node: &mut Node, states: &mut [State], sweep: Sweep) -> ModuleResult<()> {
    let mut inputs: Vec<State> = node
        .inputs
        .iter()
        .map(|&id| std::mem::take(&mut states[id]))
        .collect();
    let output = &states[node.output];
    let module = node.module.as_mut();
    let result = {
        let mut targets: Vec<&mut State> = inputs.iter_mut().collect();
        match sweep {
            Sweep::Gradient => module.bprop_input(&mut targets, output),
            Sweep::Curvature => module.bbprop_input(&mut targets, output),
        }
    }
    .and_then(|()| {
        let sources: Vec<&State> = inputs.iter().collect();
        match sweep {
            Sweep::Gradient => module.bprop_param(&sources, output),
            Sweep::Curvature => module.bbprop_param(&sources, output),
        }
    });
    for (&id, state) in node.inputs.iter().zip(inputs) {
        states[id] = state;
    }
    result
}
