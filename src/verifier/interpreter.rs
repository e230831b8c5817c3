use std::collections::HashMap;

use ndarray::{concatenate, ArrayD, ArrayViewD, Axis, Ix2, IxDyn, Slice, Zip};

use crate::ir::{Graph, Node, NodeId, Op};
use crate::verifier::reference::{self, Operands, RecurrentOutputs};
use crate::verifier::{shape_error, Feeds, VerifierError};

/// Evaluates a graph node by node in program order.
///
/// Recurrent nodes are evaluated directly, so a graph is evaluable both
/// before and after lowering.
pub struct Interpreter<'g> {
    graph: &'g Graph,
    values: HashMap<NodeId, ArrayD<f32>>,
    final_states: HashMap<NodeId, ArrayD<f32>>,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            values: HashMap::new(),
            final_states: HashMap::new(),
        }
    }

    pub fn run(&mut self, feeds: &Feeds) -> Result<(), VerifierError> {
        let graph = self.graph;
        for node in graph.iter() {
            let Some(value) = self.eval(node, feeds)? else {
                continue;
            };
            if value.shape() != node.shape.dims.as_slice() {
                return Err(VerifierError::InferenceError(format!(
                    "{} node {} evaluated to {:?}, expected {:?}",
                    node.op.name(),
                    node.id,
                    value.shape(),
                    node.shape.dims
                )));
            }
            self.values.insert(node.id, value);
        }
        Ok(())
    }

    pub fn value(&self, id: NodeId) -> Option<&ArrayD<f32>> {
        self.values.get(&id)
    }

    /// Values of the graph outputs, in declaration order.
    pub fn outputs(&self) -> Result<Vec<ArrayD<f32>>, VerifierError> {
        self.graph
            .outputs()
            .iter()
            .map(|&id| self.value_of(id).cloned())
            .collect()
    }

    fn value_of(&self, id: NodeId) -> Result<&ArrayD<f32>, VerifierError> {
        self.values
            .get(&id)
            .ok_or_else(|| VerifierError::InferenceError(format!("node {id} has no value")))
    }

    fn operand(&self, node: &Node, slot: usize) -> Result<&ArrayD<f32>, VerifierError> {
        let id = node.inputs.get(slot).ok_or_else(|| {
            VerifierError::InferenceError(format!(
                "{} node {} has no operand {slot}",
                node.op.name(),
                node.id
            ))
        })?;
        self.value_of(*id)
    }

    fn eval(&mut self, node: &Node, feeds: &Feeds) -> Result<Option<ArrayD<f32>>, VerifierError> {
        let value = match &node.op {
            Op::Parameter { name } => feeds.get(name).cloned().ok_or_else(|| {
                VerifierError::InferenceError(format!("no feed for parameter `{name}`"))
            })?,
            Op::Literal { values } => {
                ArrayD::from_shape_vec(IxDyn(&node.shape.dims), values.clone()).map_err(shape_error)?
            }
            Op::Undefined => return Ok(None),
            Op::Slice { axes, starts, ends } => {
                let mut view = self.operand(node, 0)?.view();
                for ((&axis, &start), &end) in axes.iter().zip(starts).zip(ends) {
                    view.slice_axis_inplace(Axis(axis), Slice::from(start..end));
                }
                view.to_owned()
            }
            Op::Squeeze { .. } | Op::Unsqueeze { .. } => {
                reshape(self.operand(node, 0)?, &node.shape.dims)?
            }
            Op::Transpose { perm } => self.operand(node, 0)?.view().permuted_axes(IxDyn(perm)).to_owned(),
            Op::Broadcast { axis, dims } => broadcast(self.operand(node, 0)?, *axis, dims)?,
            Op::Add => self.binary(node, |a, b| a + b)?,
            Op::Sub => self.binary(node, |a, b| a - b)?,
            Op::Mul => self.binary(node, |a, b| a * b)?,
            Op::Dot => {
                let lhs = self.operand(node, 0)?.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
                let rhs = self.operand(node, 1)?.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
                lhs.dot(&rhs).into_dyn()
            }
            Op::Concat { axis } => {
                let operands = node
                    .inputs
                    .iter()
                    .map(|&id| self.value_of(id).map(ArrayD::view))
                    .collect::<Result<Vec<ArrayViewD<'_, f32>>, _>>()?;
                concatenate(Axis(*axis), &operands).map_err(shape_error)?
            }
            Op::Activation(activation) => self
                .operand(node, 0)?
                .mapv(|v| reference::activate(*activation, v)),
            Op::Identity => self.operand(node, 0)?.clone(),
            Op::Rnn(_) | Op::Gru(_) => {
                let outputs = self.recurrent(node)?;
                self.final_states.insert(node.id, outputs.last_state);
                outputs.sequence
            }
            Op::RnnLastOutput => {
                let source = node.inputs.first().copied().unwrap_or(node.id);
                self.final_states.get(&source).cloned().ok_or_else(|| {
                    VerifierError::InferenceError(format!(
                        "rnn_last_output node {} does not consume a recurrent node",
                        node.id
                    ))
                })?
            }
        };
        Ok(Some(value))
    }

    fn binary(&self, node: &Node, f: impl Fn(f32, f32) -> f32) -> Result<ArrayD<f32>, VerifierError> {
        let dims = IxDyn(&node.shape.dims);
        let broadcast_to = |slot: usize| {
            let operand = self.operand(node, slot)?;
            operand.broadcast(dims.clone()).ok_or_else(|| {
                VerifierError::InferenceError(format!(
                    "cannot broadcast {:?} to {:?}",
                    operand.shape(),
                    node.shape.dims
                ))
            })
        };
        let (lhs, rhs) = (broadcast_to(0)?, broadcast_to(1)?);
        Ok(Zip::from(lhs).and(rhs).map_collect(|&a, &b| f(a, b)))
    }

    fn recurrent(&self, node: &Node) -> Result<RecurrentOutputs, VerifierError> {
        let optional = |slot: usize| {
            node.inputs
                .get(slot)
                .filter(|&&id| self.graph.op(id) != &Op::Undefined)
                .map(|&id| self.value_of(id))
                .transpose()
        };
        let operands = Operands {
            x: self.operand(node, 0)?,
            w: self.operand(node, 1)?,
            r: self.operand(node, 2)?,
            bias: optional(3)?,
            initial_hidden: optional(5)?,
        };
        match &node.op {
            Op::Rnn(rnn) => reference::rnn(rnn, &operands),
            Op::Gru(gru) => reference::gru(gru, &operands),
            other => Err(VerifierError::InferenceError(format!(
                "{} is not a recurrent op",
                other.name()
            ))),
        }
    }
}

fn reshape(array: &ArrayD<f32>, dims: &[usize]) -> Result<ArrayD<f32>, VerifierError> {
    ArrayD::from_shape_vec(IxDyn(dims), array.iter().copied().collect()).map_err(shape_error)
}

/// Places `array`'s dims at `axis` of `dims` and repeats along the others.
fn broadcast(array: &ArrayD<f32>, axis: usize, dims: &[usize]) -> Result<ArrayD<f32>, VerifierError> {
    let mut padded = vec![1; dims.len()];
    let end = axis + array.ndim();
    if end > dims.len() {
        return Err(VerifierError::InferenceError(format!(
            "cannot place {:?} at axis {axis} of {dims:?}",
            array.shape()
        )));
    }
    padded[axis..end].copy_from_slice(array.shape());
    let padded = reshape(array, &padded)?;
    let view = padded.broadcast(IxDyn(dims)).ok_or_else(|| {
        VerifierError::InferenceError(format!("cannot broadcast {:?} to {dims:?}", array.shape()))
    })?;
    Ok(view.to_owned())
}
