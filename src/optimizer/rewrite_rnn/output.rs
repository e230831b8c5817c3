use crate::ir::{Graph, IrError, NodeId, Op};
use crate::optimizer::rewrite_rnn::cell::{CellOutput, Emitter, SequenceOrder};

pub(crate) enum DirectionOutputs {
    Single {
        order: SequenceOrder,
        output: CellOutput,
    },
    Bidirectional {
        forward: CellOutput,
        reverse: CellOutput,
    },
}

/// Rewrites the anchor into the full `[seq_len, dirs, batch, hidden]` sequence
/// and returns the `[dirs, batch, hidden]` final hidden state.
///
/// The anchor always becomes a concat, even when it only has one operand:
/// consumers of the recurrent node must keep observing the whole sequence.
pub(crate) fn reconcile(
    emitter: &mut Emitter<'_>,
    outputs: DirectionOutputs,
) -> Result<NodeId, IrError> {
    match outputs {
        DirectionOutputs::Single { order, output } => {
            let last_state = emitter.squeeze(output.last_output, &[0])?;
            let sequence = match output.hidden_states {
                Some(running) => order.in_time_order(running, output.last_output).to_vec(),
                None => vec![output.last_output],
            };
            emitter.replace_anchor(Op::Concat { axis: 0 }, sequence)?;
            Ok(last_state)
        }
        DirectionOutputs::Bidirectional { forward, reverse } => {
            let last = emitter.concat(1, &[forward.last_output, reverse.last_output])?;
            let last_state = emitter.squeeze(last, &[0])?;
            match (forward.hidden_states, reverse.hidden_states) {
                (Some(forward_running), Some(reverse_running)) => {
                    let forward_full = emitter.concat(
                        0,
                        &SequenceOrder::Forward.in_time_order(forward_running, forward.last_output),
                    )?;
                    let reverse_full = emitter.concat(
                        0,
                        &SequenceOrder::Reverse.in_time_order(reverse_running, reverse.last_output),
                    )?;
                    emitter.replace_anchor(Op::Concat { axis: 1 }, vec![forward_full, reverse_full])?;
                }
                _ => emitter.replace_anchor(
                    Op::Concat { axis: 1 },
                    vec![forward.last_output, reverse.last_output],
                )?,
            }
            Ok(last_state)
        }
    }
}

/// Points every final-state extractor at `last_state`.
///
/// Each extractor keeps its id and becomes an identity of the final hidden
/// state, so its own consumers and graph outputs stay valid.
pub(crate) fn rewire_last_outputs(
    graph: &mut Graph,
    extractors: &[NodeId],
    last_state: NodeId,
) -> Result<(), IrError> {
    for &extractor in extractors {
        tracing::trace!(extractor, last_state, "rewiring last output consumer");
        graph.replace(extractor, Op::Identity, vec![last_state])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, Shape};

    struct Fixture {
        graph: Graph,
        anchor: NodeId,
        steps: Vec<NodeId>,
    }

    /// Four `[1, 1, 2, 3]` steps standing in for cell outputs and an anchor
    /// shaped like a recurrent node's output.
    fn fixture(anchor_dims: &[usize]) -> Fixture {
        let mut graph = Graph::new();
        let steps: Vec<NodeId> = (0..4)
            .map(|i| graph.add_parameter(format!("s{i}"), Shape::new(DataType::F32, vec![1, 1, 2, 3])))
            .collect();
        let anchor_shape = Shape::new(DataType::F32, anchor_dims.to_vec());
        let seed = graph.add_parameter("Y", anchor_shape);
        let anchor = graph.add_node(Op::Identity, vec![seed]).unwrap();
        Fixture { graph, anchor, steps }
    }

    #[test]
    fn test_single_step_is_one_operand_concat() {
        let mut f = fixture(&[1, 1, 2, 3]);
        let mut emitter = Emitter::new(&mut f.graph, f.anchor);
        let outputs = DirectionOutputs::Single {
            order: SequenceOrder::Forward,
            output: CellOutput {
                hidden_states: None,
                last_output: f.steps[0],
            },
        };
        let last_state = reconcile(&mut emitter, outputs).unwrap();

        assert_eq!(f.graph.op(f.anchor), &Op::Concat { axis: 0 });
        assert_eq!(f.graph.inputs(f.anchor), &[f.steps[0]]);
        assert_eq!(f.graph.shape(last_state).dims, vec![1, 2, 3]);
    }

    #[test]
    fn test_reverse_places_last_step_first() {
        let mut f = fixture(&[2, 1, 2, 3]);
        let mut emitter = Emitter::new(&mut f.graph, f.anchor);
        let outputs = DirectionOutputs::Single {
            order: SequenceOrder::Reverse,
            output: CellOutput {
                hidden_states: Some(f.steps[0]),
                last_output: f.steps[1],
            },
        };
        reconcile(&mut emitter, outputs).unwrap();

        assert_eq!(f.graph.inputs(f.anchor), &[f.steps[1], f.steps[0]]);
    }

    #[test]
    fn test_bidirectional_assembles_each_direction() {
        let mut f = fixture(&[2, 2, 2, 3]);
        let mut emitter = Emitter::new(&mut f.graph, f.anchor);
        let outputs = DirectionOutputs::Bidirectional {
            forward: CellOutput {
                hidden_states: Some(f.steps[0]),
                last_output: f.steps[1],
            },
            reverse: CellOutput {
                hidden_states: Some(f.steps[2]),
                last_output: f.steps[3],
            },
        };
        let last_state = reconcile(&mut emitter, outputs).unwrap();

        assert_eq!(f.graph.op(f.anchor), &Op::Concat { axis: 1 });
        let [forward_full, reverse_full] = [f.graph.inputs(f.anchor)[0], f.graph.inputs(f.anchor)[1]];
        assert_eq!(f.graph.inputs(forward_full), &[f.steps[0], f.steps[1]]);
        assert_eq!(f.graph.inputs(reverse_full), &[f.steps[3], f.steps[2]]);
        assert_eq!(f.graph.shape(last_state).dims, vec![2, 2, 3]);
    }

    #[test]
    fn test_bidirectional_single_step() {
        let mut f = fixture(&[1, 2, 2, 3]);
        let mut emitter = Emitter::new(&mut f.graph, f.anchor);
        let outputs = DirectionOutputs::Bidirectional {
            forward: CellOutput {
                hidden_states: None,
                last_output: f.steps[0],
            },
            reverse: CellOutput {
                hidden_states: None,
                last_output: f.steps[1],
            },
        };
        reconcile(&mut emitter, outputs).unwrap();

        assert_eq!(f.graph.op(f.anchor), &Op::Concat { axis: 1 });
        assert_eq!(f.graph.inputs(f.anchor), &[f.steps[0], f.steps[1]]);
    }

    #[test]
    fn test_rewire_many_extractors() {
        let mut graph = Graph::new();
        let y = graph.add_parameter("Y", Shape::new(DataType::F32, vec![3, 1, 2, 4]));
        let state = graph.add_parameter("H", Shape::new(DataType::F32, vec![1, 2, 4]));
        let first = graph.add_node(Op::RnnLastOutput, vec![y]).unwrap();
        let second = graph.add_node(Op::RnnLastOutput, vec![y]).unwrap();

        rewire_last_outputs(&mut graph, &[first, second], state).unwrap();

        for extractor in [first, second] {
            assert_eq!(graph.op(extractor), &Op::Identity);
            assert_eq!(graph.inputs(extractor), &[state]);
        }
        assert!(graph.consumers(y).is_empty());
        assert_eq!(graph.consumers(state), &[first, second]);
    }
}
