use std::num::NonZeroUsize;

use crate::ir::{Activation, DataType, Graph, IrError, NodeId, Op, Shape};
use crate::optimizer::OptimizerError;

/// Inserts primitive nodes immediately before the node being lowered.
pub(crate) struct Emitter<'g> {
    graph: &'g mut Graph,
    anchor: NodeId,
}

impl<'g> Emitter<'g> {
    pub fn new(graph: &'g mut Graph, anchor: NodeId) -> Self {
        Self { graph, anchor }
    }

    pub fn anchor(&self) -> NodeId {
        self.anchor
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut *self.graph
    }

    pub fn shape(&self, id: NodeId) -> &Shape {
        self.graph.shape(id)
    }

    pub fn emit(&mut self, op: Op, inputs: Vec<NodeId>) -> Result<NodeId, IrError> {
        self.graph.insert_before(self.anchor, op, inputs)
    }

    /// Rewrites the anchor itself; its id and consumers are kept.
    pub fn replace_anchor(&mut self, op: Op, inputs: Vec<NodeId>) -> Result<(), IrError> {
        self.graph.replace(self.anchor, op, inputs)
    }

    pub fn splat(&mut self, data_type: DataType, dims: Vec<usize>, value: f32) -> Result<NodeId, IrError> {
        let shape = Shape::new(data_type, dims);
        let values = vec![value; shape.elements()];
        self.graph.add_literal(shape, values)
    }

    pub fn slice(&mut self, x: NodeId, axis: usize, start: usize, end: usize) -> Result<NodeId, IrError> {
        self.emit(
            Op::Slice {
                axes: vec![axis],
                starts: vec![start],
                ends: vec![end],
            },
            vec![x],
        )
    }

    pub fn squeeze(&mut self, x: NodeId, axes: &[usize]) -> Result<NodeId, IrError> {
        self.emit(Op::Squeeze { axes: axes.to_vec() }, vec![x])
    }

    pub fn unsqueeze(&mut self, x: NodeId, axes: &[usize]) -> Result<NodeId, IrError> {
        self.emit(Op::Unsqueeze { axes: axes.to_vec() }, vec![x])
    }

    pub fn transpose(&mut self, x: NodeId) -> Result<NodeId, IrError> {
        self.emit(Op::Transpose { perm: vec![1, 0] }, vec![x])
    }

    pub fn broadcast(&mut self, x: NodeId, axis: usize, dims: &[usize]) -> Result<NodeId, IrError> {
        self.emit(
            Op::Broadcast {
                axis,
                dims: dims.to_vec(),
            },
            vec![x],
        )
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, IrError> {
        self.emit(Op::Add, vec![lhs, rhs])
    }

    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, IrError> {
        self.emit(Op::Sub, vec![lhs, rhs])
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, IrError> {
        self.emit(Op::Mul, vec![lhs, rhs])
    }

    pub fn dot(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, IrError> {
        self.emit(Op::Dot, vec![lhs, rhs])
    }

    pub fn concat(&mut self, axis: usize, operands: &[NodeId]) -> Result<NodeId, IrError> {
        self.emit(Op::Concat { axis }, operands.to_vec())
    }

    pub fn activate(&mut self, activation: Activation, x: NodeId) -> Result<NodeId, IrError> {
        self.emit(Op::Activation(activation), vec![x])
    }

    /// `[batch, input]` slice of a `[seq_len, batch, input]` sequence.
    pub fn timestep(&mut self, sequence: NodeId, t: usize) -> Result<NodeId, IrError> {
        let x = self.slice(sequence, 0, t, t + 1)?;
        self.squeeze(x, &[0])
    }

    /// Squeezes the direction axis off a `[1, rows, cols]` weight and splits
    /// it into `parts` row blocks, each transposed to `[cols, rows / parts]`.
    pub fn split_weight(&mut self, weight: NodeId, parts: usize) -> Result<Vec<NodeId>, IrError> {
        let weight = self.squeeze(weight, &[0])?;
        let rows = self.shape(weight).dims[0] / parts;
        (0..parts)
            .map(|i| {
                let block = self.slice(weight, 0, i * rows, (i + 1) * rows)?;
                self.transpose(block)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SequenceOrder {
    Forward,
    Reverse,
}

impl SequenceOrder {
    /// Sequence index processed at logical step `step` of `seq_len`.
    pub fn timestep(self, step: usize, seq_len: usize) -> usize {
        match self {
            SequenceOrder::Forward => step,
            SequenceOrder::Reverse => seq_len - 1 - step,
        }
    }

    /// Orders two tensors, `first` computed before `next`, along real time.
    pub fn in_time_order(self, first: NodeId, next: NodeId) -> [NodeId; 2] {
        match self {
            SequenceOrder::Forward => [first, next],
            SequenceOrder::Reverse => [next, first],
        }
    }
}

/// Operands of one direction of a recurrent node; every tensor still carries
/// its direction axis of size 1.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CellInputs {
    pub seq_len: NonZeroUsize,
    pub sequence: NodeId,
    pub w: NodeId,
    pub r: NodeId,
    pub bias: Option<NodeId>,
    pub initial_hidden: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CellOutput {
    /// Every step except `last_output`, in time order; absent for a single step.
    pub hidden_states: Option<NodeId>,
    /// The most recently computed step, `[1, 1, batch, hidden]`.
    pub last_output: NodeId,
}

pub(crate) trait RecurrentCell {
    fn name(&self) -> &'static str;

    fn unroll(
        &self,
        emitter: &mut Emitter<'_>,
        inputs: &CellInputs,
        order: SequenceOrder,
    ) -> Result<CellOutput, OptimizerError>;
}

/// Collects unrolled steps into a time-ordered sequence.
///
/// Every step but the final one is folded into the running tensor as soon as
/// it is produced: appended when running forward, prepended when running in
/// reverse. The final step stays separate so the caller can end the rewrite
/// with a concat.
pub(crate) struct SequenceAccumulator {
    order: SequenceOrder,
    seq_len: NonZeroUsize,
}

impl SequenceAccumulator {
    pub fn new(order: SequenceOrder, seq_len: NonZeroUsize) -> Self {
        Self { order, seq_len }
    }

    /// Calls `step(emitter, t)` once per timestep `t`, in processing order.
    pub fn run<'g>(
        &self,
        emitter: &mut Emitter<'g>,
        mut step: impl FnMut(&mut Emitter<'g>, usize) -> Result<NodeId, OptimizerError>,
    ) -> Result<CellOutput, OptimizerError> {
        let seq_len = self.seq_len.get();
        let mut hidden_states = None;
        for i in 0..seq_len - 1 {
            let output = step(&mut *emitter, self.order.timestep(i, seq_len))?;
            hidden_states = Some(match hidden_states {
                Some(running) => emitter.concat(0, &self.order.in_time_order(running, output))?,
                None => output,
            });
        }
        let last_output = step(&mut *emitter, self.order.timestep(seq_len - 1, seq_len))?;
        Ok(CellOutput {
            hidden_states,
            last_output,
        })
    }
}
