//! Lowering of RNN and GRU nodes into primitive tensor operations.
//!
//! Each recurrent node is unrolled over its sequence, one cell per direction.
//! The new nodes are inserted right before the recurrent node, which is then
//! rewritten in place into a concat producing the full output sequence, so
//! every existing reference to it stays valid. `RnnLastOutput` consumers are
//! pointed at the final hidden state.

mod activation;
mod cell;
mod gru_cell;
mod output;
mod rnn_cell;

pub use activation::{resolve_activations, ActivationOversupply, ActivationPolicy, CellKind};

use std::num::NonZeroUsize;

use crate::ir::{Activation, DataType, Direction, Graph, GruOp, IrError, NodeId, Op, RnnOp};
use crate::optimizer::{OptimizationPass, OptimizerError};
use cell::{CellInputs, Emitter, RecurrentCell, SequenceOrder};
use gru_cell::GruCell;
use output::DirectionOutputs;
use rnn_cell::VanillaRnnCell;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteRnnConfig {
    pub activation_policy: ActivationPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct RewriteRnn {
    config: RewriteRnnConfig,
}

impl RewriteRnn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RewriteRnnConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RewriteRnnConfig {
        &self.config
    }

    /// Lowers the RNN or GRU node `node`. Any other node is an error.
    pub fn lower(&self, graph: &mut Graph, node: NodeId) -> Result<(), OptimizerError> {
        let op = graph.get(node).map(|n| &n.op).ok_or(IrError::UnknownNode(node))?;
        let op = RecurrentOp::from_op(op).ok_or(OptimizerError::UnexpectedOp {
            node,
            actual: op.name(),
        })?;
        let args = RecurrentArgs::decode(graph, node, op.name())?;
        let extractors: Vec<NodeId> = graph
            .consumers(node)
            .iter()
            .copied()
            .filter(|&consumer| graph.op(consumer) == &Op::RnnLastOutput)
            .collect();

        let activations = resolve_activations(
            op.kind(),
            op.direction(),
            op.activations(),
            self.config.activation_policy,
        )
        .map_err(|err| OptimizerError::TooManyActivations {
            node,
            op: op.name(),
            supplied: err.supplied,
            expected: err.expected,
        })?;

        let seq_shape = graph.shape(args.sequence).clone();
        let batch = seq_shape.dims[1];
        let hidden = graph.shape(args.r).dims[2];
        let seq_len = NonZeroUsize::new(seq_shape.dims[0])
            .ok_or(OptimizerError::EmptySequence { node, op: op.name() })?;
        tracing::debug!(
            node,
            op = op.name(),
            direction = ?op.direction(),
            seq_len = seq_len.get(),
            batch,
            hidden,
            last_output_consumers = extractors.len(),
            "lowering recurrent node"
        );
        if args.sequence_lens.is_some() {
            tracing::debug!(node, "ignoring sequence lengths operand");
        }

        let zero_state_dims = vec![1, batch, hidden];
        let per_direction = op.kind().activations_per_direction();
        let mut emitter = Emitter::new(graph, node);
        let outputs = match op.direction() {
            Direction::Forward | Direction::Reverse => {
                let order = if op.direction() == Direction::Forward {
                    SequenceOrder::Forward
                } else {
                    SequenceOrder::Reverse
                };
                let initial_hidden = match args.initial_hidden {
                    Some(initial_hidden) => initial_hidden,
                    None => emitter.splat(seq_shape.data_type, zero_state_dims, 0.0)?,
                };
                let inputs = CellInputs {
                    seq_len,
                    sequence: args.sequence,
                    w: args.w,
                    r: args.r,
                    bias: args.bias,
                    initial_hidden,
                };
                let cell = op.cell(&activations[..per_direction]);
                DirectionOutputs::Single {
                    order,
                    output: cell.unroll(&mut emitter, &inputs, order)?,
                }
            }
            Direction::Bidirectional => {
                let mut halves = Vec::with_capacity(2);
                for (dir, order) in [SequenceOrder::Forward, SequenceOrder::Reverse]
                    .into_iter()
                    .enumerate()
                {
                    let inputs = args.direction(&mut emitter, dir, seq_len, seq_shape.data_type, &zero_state_dims)?;
                    let cell = op.cell(&activations[dir * per_direction..(dir + 1) * per_direction]);
                    halves.push(cell.unroll(&mut emitter, &inputs, order)?);
                }
                DirectionOutputs::Bidirectional {
                    forward: halves[0],
                    reverse: halves[1],
                }
            }
        };

        let last_state = output::reconcile(&mut emitter, outputs)?;
        output::rewire_last_outputs(emitter.graph_mut(), &extractors, last_state)?;
        Ok(())
    }
}

impl OptimizationPass for RewriteRnn {
    fn name(&self) -> &'static str {
        "rewrite_rnn"
    }

    fn apply(&self, graph: &mut Graph) -> Result<(), OptimizerError> {
        // Snapshot first: lowering inserts nodes that must not be visited.
        for node in graph.node_ids() {
            if graph.op(node).is_recurrent() {
                self.lower(graph, node)?;
            }
        }
        Ok(())
    }
}

enum RecurrentOp {
    Rnn(RnnOp),
    Gru(GruOp),
}

impl RecurrentOp {
    fn from_op(op: &Op) -> Option<Self> {
        match op {
            Op::Rnn(rnn) => Some(RecurrentOp::Rnn(rnn.clone())),
            Op::Gru(gru) => Some(RecurrentOp::Gru(gru.clone())),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            RecurrentOp::Rnn(_) => "rnn",
            RecurrentOp::Gru(_) => "gru",
        }
    }

    fn kind(&self) -> CellKind {
        match self {
            RecurrentOp::Rnn(_) => CellKind::Rnn,
            RecurrentOp::Gru(_) => CellKind::Gru,
        }
    }

    fn direction(&self) -> Direction {
        match self {
            RecurrentOp::Rnn(rnn) => rnn.direction,
            RecurrentOp::Gru(gru) => gru.direction,
        }
    }

    fn activations(&self) -> &[Activation] {
        match self {
            RecurrentOp::Rnn(rnn) => &rnn.activations,
            RecurrentOp::Gru(gru) => &gru.activations,
        }
    }

    /// Cell for one direction; `activations` holds exactly that direction's
    /// resolved functions.
    fn cell(&self, activations: &[Activation]) -> Box<dyn RecurrentCell> {
        match self {
            RecurrentOp::Rnn(_) => Box::new(VanillaRnnCell {
                activation: activations[0],
            }),
            RecurrentOp::Gru(gru) => Box::new(GruCell {
                gate: activations[0],
                candidate: activations[1],
                linear_before_reset: gru.linear_before_reset,
            }),
        }
    }
}

/// Positional operands of a recurrent node, with undefined slots as `None`.
#[derive(Debug)]
struct RecurrentArgs {
    sequence: NodeId,
    w: NodeId,
    r: NodeId,
    bias: Option<NodeId>,
    sequence_lens: Option<NodeId>,
    initial_hidden: Option<NodeId>,
}

impl RecurrentArgs {
    fn decode(graph: &Graph, node: NodeId, op: &'static str) -> Result<Self, OptimizerError> {
        let inputs = graph.inputs(node);
        if !(3..=6).contains(&inputs.len()) {
            return Err(OptimizerError::InvalidArity {
                node,
                op,
                actual: inputs.len(),
            });
        }
        let defined = |slot: usize| {
            inputs
                .get(slot)
                .copied()
                .filter(|&input| graph.op(input) != &Op::Undefined)
        };

        // Shape inference only admits shaped tensors in slots 0 to 2.
        Ok(Self {
            sequence: inputs[0],
            w: inputs[1],
            r: inputs[2],
            bias: defined(3),
            sequence_lens: defined(4),
            initial_hidden: defined(5),
        })
    }

    /// Slices direction `dir` out of W, R, bias and initial state.
    fn direction(
        &self,
        emitter: &mut Emitter<'_>,
        dir: usize,
        seq_len: NonZeroUsize,
        data_type: DataType,
        zero_state_dims: &[usize],
    ) -> Result<CellInputs, OptimizerError> {
        let bias = match self.bias {
            Some(bias) => Some(emitter.slice(bias, 0, dir, dir + 1)?),
            None => None,
        };
        let initial_hidden = match self.initial_hidden {
            Some(initial_hidden) => emitter.slice(initial_hidden, 0, dir, dir + 1)?,
            None => emitter.splat(data_type, zero_state_dims.to_vec(), 0.0)?,
        };
        Ok(CellInputs {
            seq_len,
            sequence: self.sequence,
            w: emitter.slice(self.w, 0, dir, dir + 1)?,
            r: emitter.slice(self.r, 0, dir, dir + 1)?,
            bias,
            initial_hidden,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Shape;
    use proptest::prelude::*;

    fn f32_shape(dims: &[usize]) -> Shape {
        Shape::new(DataType::F32, dims.to_vec())
    }

    struct Recurrent {
        graph: Graph,
        node: NodeId,
    }

    fn build(op: Op, seq_len: usize, batch: usize, hidden: usize, optional: bool) -> Recurrent {
        let (gates, direction) = match &op {
            Op::Rnn(rnn) => (1, rnn.direction),
            Op::Gru(gru) => (3, gru.direction),
            _ => unreachable!(),
        };
        let dirs = direction.num_directions();
        let input = 2;
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[seq_len, batch, input]));
        let w = graph.add_parameter("W", f32_shape(&[dirs, gates * hidden, input]));
        let r = graph.add_parameter("R", f32_shape(&[dirs, gates * hidden, hidden]));
        let mut inputs = vec![x, w, r];
        if optional {
            let b = graph.add_parameter("B", f32_shape(&[dirs, 2 * gates * hidden]));
            let lens = graph.add_undefined();
            let h0 = graph.add_parameter("H0", f32_shape(&[dirs, batch, hidden]));
            inputs.extend([b, lens, h0]);
        }
        let node = graph.add_node(op, inputs).unwrap();
        graph.add_output(node).unwrap();
        Recurrent { graph, node }
    }

    fn rnn(direction: Direction) -> Op {
        Op::Rnn(RnnOp {
            direction,
            activations: vec![],
        })
    }

    fn gru(direction: Direction, linear_before_reset: bool) -> Op {
        Op::Gru(GruOp {
            direction,
            activations: vec![],
            linear_before_reset,
        })
    }

    #[test]
    fn test_output_shapes_for_every_direction() {
        for direction in [Direction::Forward, Direction::Reverse, Direction::Bidirectional] {
            for op in [rnn(direction), gru(direction, false), gru(direction, true)] {
                for optional in [false, true] {
                    let mut rec = build(op.clone(), 3, 2, 4, optional);
                    let last = rec.graph.add_node(Op::RnnLastOutput, vec![rec.node]).unwrap();
                    RewriteRnn::new().apply(&mut rec.graph).unwrap();

                    let dirs = direction.num_directions();
                    assert_eq!(rec.graph.shape(rec.node).dims, vec![3, dirs, 2, 4]);
                    assert_eq!(rec.graph.shape(last).dims, vec![dirs, 2, 4]);
                    assert!(matches!(rec.graph.op(rec.node), Op::Concat { .. }));
                    assert!(rec.graph.iter().all(|node| !node.op.is_recurrent()));
                }
            }
        }
    }

    #[test]
    fn test_single_step_forward_rnn_is_one_operand_concat() {
        let mut rec = build(rnn(Direction::Forward), 1, 1, 3, false);
        RewriteRnn::new().apply(&mut rec.graph).unwrap();

        assert_eq!(rec.graph.op(rec.node), &Op::Concat { axis: 0 });
        assert_eq!(rec.graph.inputs(rec.node).len(), 1);
    }

    #[test]
    fn test_new_nodes_precede_rewritten_node() {
        let mut rec = build(gru(Direction::Bidirectional, false), 3, 2, 2, true);
        let consumer = rec
            .graph
            .add_node(Op::Activation(Activation::Relu), vec![rec.node])
            .unwrap();
        RewriteRnn::new().apply(&mut rec.graph).unwrap();

        let order = rec.graph.node_ids();
        let position = |id: NodeId| order.iter().position(|&n| n == id).unwrap();
        for node in rec.graph.iter() {
            for &input in &node.inputs {
                assert!(position(input) < position(node.id), "{input} must precede {}", node.id);
            }
        }
        assert_eq!(rec.graph.inputs(consumer), &[rec.node]);
    }

    #[test]
    fn test_last_output_consumers_are_rewired() {
        for count in 0..3 {
            let mut rec = build(rnn(Direction::Reverse), 4, 2, 3, true);
            let extractors: Vec<NodeId> = (0..count)
                .map(|_| rec.graph.add_node(Op::RnnLastOutput, vec![rec.node]).unwrap())
                .collect();
            RewriteRnn::new().apply(&mut rec.graph).unwrap();

            for &extractor in &extractors {
                assert_eq!(rec.graph.op(extractor), &Op::Identity);
                let state = rec.graph.inputs(extractor)[0];
                assert!(matches!(rec.graph.op(state), Op::Squeeze { .. }));
                assert!(!rec.graph.op(state).is_recurrent());
            }
            assert!(rec.graph.consumers(rec.node).is_empty());
        }
    }

    #[test]
    fn test_missing_initial_state_uses_zero_literal() {
        let mut rec = build(gru(Direction::Bidirectional, true), 2, 3, 4, false);
        RewriteRnn::new().apply(&mut rec.graph).unwrap();

        let zeros: Vec<_> = rec
            .graph
            .iter()
            .filter(|node| matches!(&node.op, Op::Literal { values } if values.iter().all(|&v| v == 0.0)))
            .collect();
        assert_eq!(zeros.len(), 2);
        assert!(zeros.iter().all(|node| node.shape.dims == vec![1, 3, 4]));
    }

    #[test]
    fn test_lowering_twice_visits_nothing() {
        let mut rec = build(rnn(Direction::Forward), 3, 1, 2, false);
        RewriteRnn::new().apply(&mut rec.graph).unwrap();
        let len = rec.graph.len();
        RewriteRnn::new().apply(&mut rec.graph).unwrap();

        assert_eq!(rec.graph.len(), len);
    }

    #[test]
    fn test_lower_rejects_non_recurrent_node() {
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[2]));
        let err = RewriteRnn::new().lower(&mut graph, x).unwrap_err();

        assert!(matches!(
            err,
            OptimizerError::UnexpectedOp {
                actual: "parameter",
                ..
            }
        ));
        assert!(matches!(
            RewriteRnn::new().lower(&mut graph, 99),
            Err(OptimizerError::Ir(IrError::UnknownNode(99)))
        ));
    }

    #[test]
    fn test_strict_policy_rejects_extra_activations() {
        let op = Op::Rnn(RnnOp {
            direction: Direction::Forward,
            activations: vec![Activation::Relu, Activation::Tanh],
        });
        let mut rec = build(op.clone(), 2, 1, 2, false);
        let strict = RewriteRnn::with_config(RewriteRnnConfig {
            activation_policy: ActivationPolicy::Strict,
        });
        let err = strict.apply(&mut rec.graph).unwrap_err();
        assert!(matches!(
            err,
            OptimizerError::TooManyActivations {
                supplied: 2,
                expected: 1,
                ..
            }
        ));

        let mut rec = build(op, 2, 1, 2, false);
        RewriteRnn::new().apply(&mut rec.graph).unwrap();
        let relus = rec
            .graph
            .iter()
            .filter(|node| node.op == Op::Activation(Activation::Relu))
            .count();
        assert_eq!(relus, 2);
    }

    #[test]
    fn test_empty_sequence_is_rejected_before_emitting() {
        let mut rec = build(gru(Direction::Bidirectional, false), 0, 1, 2, false);
        let len = rec.graph.len();
        let err = RewriteRnn::new().apply(&mut rec.graph).unwrap_err();

        assert!(matches!(err, OptimizerError::EmptySequence { op: "gru", .. }));
        assert_eq!(rec.graph.len(), len);
        assert!(rec.graph.op(rec.node).is_recurrent());
    }

    #[test]
    fn test_decode_optional_slots_and_arity() {
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[2, 1, 2]));
        let w = graph.add_parameter("W", f32_shape(&[1, 3, 2]));
        let r = graph.add_parameter("R", f32_shape(&[1, 3, 3]));
        let node = graph.add_node(rnn(Direction::Forward), vec![x, w, r]).unwrap();
        let args = RecurrentArgs::decode(&graph, node, "rnn").unwrap();
        assert_eq!((args.sequence, args.w, args.r), (x, w, r));
        assert_eq!((args.bias, args.sequence_lens, args.initial_hidden), (None, None, None));

        let undef = graph.add_undefined();
        let h0 = graph.add_parameter("H0", f32_shape(&[1, 1, 3]));
        let node = graph
            .add_node(rnn(Direction::Forward), vec![x, w, r, undef, undef, h0])
            .unwrap();
        let args = RecurrentArgs::decode(&graph, node, "rnn").unwrap();
        assert_eq!((args.bias, args.sequence_lens, args.initial_hidden), (None, None, Some(h0)));

        let err = RecurrentArgs::decode(&graph, undef, "rnn").unwrap_err();
        assert!(matches!(err, OptimizerError::InvalidArity { actual: 0, .. }));
    }

    #[test]
    fn test_required_operands_cannot_be_undefined() {
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[2, 1, 2]));
        let w = graph.add_parameter("W", f32_shape(&[1, 3, 2]));
        let r = graph.add_parameter("R", f32_shape(&[1, 3, 3]));
        let undef = graph.add_undefined();

        for inputs in [vec![undef, w, r], vec![x, undef, r], vec![x, w, undef]] {
            let slot = inputs.iter().position(|&input| input == undef).unwrap();
            let err = graph.add_node(rnn(Direction::Forward), inputs).unwrap_err();
            assert!(
                matches!(err, IrError::RecurrentOperand { slot: s, .. } if s == slot),
                "{err:?}"
            );
        }
    }

    #[test]
    fn test_zero_state_follows_sequence_data_type() {
        let f64_shape = |dims: &[usize]| Shape::new(DataType::F64, dims.to_vec());
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f64_shape(&[2, 1, 2]));
        let w = graph.add_parameter("W", f64_shape(&[1, 3, 2]));
        let r = graph.add_parameter("R", f64_shape(&[1, 3, 3]));
        let node = graph.add_node(rnn(Direction::Forward), vec![x, w, r]).unwrap();
        RewriteRnn::new().apply(&mut graph).unwrap();

        let literals: Vec<_> = graph
            .iter()
            .filter(|node| matches!(node.op, Op::Literal { .. }))
            .collect();
        assert_eq!(literals.len(), 1);
        assert_eq!(literals[0].shape, f64_shape(&[1, 1, 3]));
        assert_eq!(literals[0].op, Op::Literal { values: vec![0.0; 3] });
        assert_eq!(graph.shape(node).data_type, DataType::F64);
    }

    proptest! {
        #[test]
        fn prop_lowered_shapes(
            seq_len in 1usize..5,
            batch in 1usize..4,
            hidden in 1usize..5,
            direction in prop_oneof![
                Just(Direction::Forward),
                Just(Direction::Reverse),
                Just(Direction::Bidirectional),
            ],
            is_gru in any::<bool>(),
            optional in any::<bool>(),
        ) {
            let op = if is_gru { gru(direction, seq_len % 2 == 0) } else { rnn(direction) };
            let mut rec = build(op, seq_len, batch, hidden, optional);
            let last = rec.graph.add_node(Op::RnnLastOutput, vec![rec.node]).unwrap();
            RewriteRnn::new().apply(&mut rec.graph).unwrap();

            let dirs = direction.num_directions();
            prop_assert_eq!(&rec.graph.shape(rec.node).dims, &vec![seq_len, dirs, batch, hidden]);
            prop_assert_eq!(&rec.graph.shape(last).dims, &vec![dirs, batch, hidden]);
            prop_assert!(rec.graph.iter().all(|node| !node.op.is_recurrent()));
        }
    }
}
