use crate::ir::{Graph, IrError, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error("{op} node {node} has {actual} operands, expected 3 to 6")]
    InvalidArity {
        node: NodeId,
        op: &'static str,
        actual: usize,
    },
    #[error("Node {node} is a {actual} node, not a recurrent node")]
    UnexpectedOp { node: NodeId, actual: &'static str },
    #[error("{op} node {node} declares {supplied} activation functions, at most {expected} allowed")]
    TooManyActivations {
        node: NodeId,
        op: &'static str,
        supplied: usize,
        expected: usize,
    },
    #[error("{op} node {node} has an empty input sequence")]
    EmptySequence { node: NodeId, op: &'static str },
}

pub trait OptimizationPass {
    fn name(&self) -> &'static str;

    fn apply(&self, graph: &mut Graph) -> Result<(), OptimizerError>;
}

pub mod rewrite_rnn;

#[derive(Default)]
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn optimize(&self, graph: &mut Graph) -> Result<(), OptimizerError> {
        for pass in &self.passes {
            tracing::debug!(pass = pass.name(), nodes = graph.len(), "running pass");
            pass.apply(graph)?;
        }
        Ok(())
    }
}
