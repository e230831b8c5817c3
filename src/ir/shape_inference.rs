use crate::ir::{Direction, IrError, Node, Op, Shape};

/// Computes the output shape of `op` applied to `operands`.
///
/// Every computed node goes through here when it is created or replaced, so
/// shape-inconsistent operands surface as an `IrError` at construction time.
pub fn infer_shape(op: &Op, operands: &[&Node]) -> Result<Shape, IrError> {
    match op {
        Op::Parameter { .. } | Op::Literal { .. } | Op::Undefined => Err(IrError::LeafOp(op.name())),
        Op::Slice { axes, starts, ends } => {
            let input = unary(op, operands)?;
            if axes.len() != starts.len() || axes.len() != ends.len() {
                return Err(IrError::SliceSpec {
                    axes: axes.len(),
                    starts: starts.len(),
                    ends: ends.len(),
                });
            }
            let mut dims = input.dims.clone();
            for ((&axis, &start), &end) in axes.iter().zip(starts).zip(ends) {
                let dim = *input.dims.get(axis).ok_or(IrError::AxisOutOfRange {
                    op: op.name(),
                    axis,
                    rank: input.rank(),
                })?;
                if start > end || end > dim {
                    return Err(IrError::SliceOutOfBounds { axis, start, end, dim });
                }
                dims[axis] = end - start;
            }
            Ok(Shape::new(input.data_type, dims))
        }
        Op::Squeeze { axes } => {
            let input = unary(op, operands)?;
            let axes = if axes.is_empty() {
                (0..input.rank()).filter(|&axis| input.dims[axis] == 1).collect()
            } else {
                check_axes(op, axes, input.rank())?;
                for &axis in axes {
                    if input.dims[axis] != 1 {
                        return Err(IrError::SqueezeNonUnit { axis, dim: input.dims[axis] });
                    }
                }
                axes.clone()
            };
            let dims = input
                .dims
                .iter()
                .enumerate()
                .filter(|(axis, _)| !axes.contains(axis))
                .map(|(_, &dim)| dim)
                .collect();
            Ok(Shape::new(input.data_type, dims))
        }
        Op::Unsqueeze { axes } => {
            let input = unary(op, operands)?;
            let rank = input.rank() + axes.len();
            check_axes(op, axes, rank)?;
            let mut source = input.dims.iter();
            let dims = (0..rank)
                .map(|axis| {
                    if axes.contains(&axis) {
                        1
                    } else {
                        source.next().copied().unwrap_or(1)
                    }
                })
                .collect();
            Ok(Shape::new(input.data_type, dims))
        }
        Op::Transpose { perm } => {
            let input = unary(op, operands)?;
            let mut sorted = perm.clone();
            sorted.sort_unstable();
            if sorted != (0..input.rank()).collect::<Vec<_>>() {
                return Err(IrError::InvalidPermutation {
                    perm: perm.clone(),
                    rank: input.rank(),
                });
            }
            let dims = perm.iter().map(|&p| input.dims[p]).collect();
            Ok(Shape::new(input.data_type, dims))
        }
        Op::Broadcast { axis, dims } => {
            let input = unary(op, operands)?;
            let end = axis + input.rank();
            let fits = end <= dims.len()
                && input
                    .dims
                    .iter()
                    .zip(&dims[*axis..end])
                    .all(|(&from, &to)| from == to || from == 1);
            if !fits {
                return Err(IrError::BroadcastMismatch {
                    from: input.dims.clone(),
                    to: dims.clone(),
                    axis: *axis,
                });
            }
            Ok(Shape::new(input.data_type, dims.clone()))
        }
        Op::Add | Op::Sub | Op::Mul => {
            let (lhs, rhs) = binary(op, operands)?;
            let dims = broadcast_dims(op.name(), &lhs.dims, &rhs.dims)?;
            Ok(Shape::new(lhs.data_type, dims))
        }
        Op::Dot => {
            let (lhs, rhs) = binary(op, operands)?;
            if lhs.rank() != 2 || rhs.rank() != 2 || lhs.dims[1] != rhs.dims[0] {
                return Err(IrError::IncompatibleShapes {
                    op: op.name(),
                    lhs: lhs.dims.clone(),
                    rhs: rhs.dims.clone(),
                });
            }
            Ok(Shape::new(lhs.data_type, vec![lhs.dims[0], rhs.dims[1]]))
        }
        Op::Concat { axis } => {
            let first = match operands.first() {
                Some(node) => &node.shape,
                None => {
                    return Err(IrError::Arity {
                        op: op.name(),
                        expected: "at least 1",
                        actual: 0,
                    })
                }
            };
            if *axis >= first.rank() {
                return Err(IrError::AxisOutOfRange {
                    op: op.name(),
                    axis: *axis,
                    rank: first.rank(),
                });
            }
            let mut dims = first.dims.clone();
            for node in &operands[1..] {
                let other = &node.shape;
                check_data_type(first, other)?;
                let compatible = other.rank() == first.rank()
                    && (0..first.rank()).all(|i| i == *axis || other.dims[i] == first.dims[i]);
                if !compatible {
                    return Err(IrError::IncompatibleShapes {
                        op: op.name(),
                        lhs: first.dims.clone(),
                        rhs: other.dims.clone(),
                    });
                }
                dims[*axis] += other.dims[*axis];
            }
            Ok(Shape::new(first.data_type, dims))
        }
        Op::Activation(_) | Op::Identity => Ok(unary(op, operands)?.clone()),
        Op::Rnn(rnn) => recurrent(op.name(), rnn.direction, 1, operands),
        Op::Gru(gru) => recurrent(op.name(), gru.direction, 3, operands),
        Op::RnnLastOutput => {
            let input = unary(op, operands)?;
            if input.rank() != 4 {
                return Err(IrError::RecurrentOperand {
                    op: op.name(),
                    slot: 0,
                    actual: input.dims.clone(),
                    expected: "[seq_len, dirs, batch, hidden]".to_string(),
                });
            }
            Ok(Shape::new(input.data_type, input.dims[1..].to_vec()))
        }
    }
}

fn unary<'a>(op: &Op, operands: &[&'a Node]) -> Result<&'a Shape, IrError> {
    match operands {
        [input] => Ok(&input.shape),
        _ => Err(IrError::Arity {
            op: op.name(),
            expected: "1",
            actual: operands.len(),
        }),
    }
}

fn binary<'a>(op: &Op, operands: &[&'a Node]) -> Result<(&'a Shape, &'a Shape), IrError> {
    match operands {
        [lhs, rhs] => {
            check_data_type(&lhs.shape, &rhs.shape)?;
            Ok((&lhs.shape, &rhs.shape))
        }
        _ => Err(IrError::Arity {
            op: op.name(),
            expected: "2",
            actual: operands.len(),
        }),
    }
}

fn check_data_type(lhs: &Shape, rhs: &Shape) -> Result<(), IrError> {
    if lhs.data_type == rhs.data_type {
        Ok(())
    } else {
        Err(IrError::DataTypeMismatch {
            lhs: lhs.data_type,
            rhs: rhs.data_type,
        })
    }
}

fn check_axes(op: &Op, axes: &[usize], rank: usize) -> Result<(), IrError> {
    for (i, &axis) in axes.iter().enumerate() {
        if axis >= rank {
            return Err(IrError::AxisOutOfRange {
                op: op.name(),
                axis,
                rank,
            });
        }
        if axes[..i].contains(&axis) {
            return Err(IrError::DuplicateAxis { op: op.name(), axis });
        }
    }
    Ok(())
}

/// Numpy-style broadcasting of two dim lists, aligned from the trailing axis.
fn broadcast_dims(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, IrError> {
    let rank = lhs.len().max(rhs.len());
    let mut dims = vec![1; rank];
    for k in 0..rank {
        let l = lhs.len().checked_sub(k + 1).map_or(1, |i| lhs[i]);
        let r = rhs.len().checked_sub(k + 1).map_or(1, |i| rhs[i]);
        dims[rank - 1 - k] = if l == r || r == 1 {
            l
        } else if l == 1 {
            r
        } else {
            return Err(IrError::IncompatibleShapes {
                op,
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
            });
        };
    }
    Ok(dims)
}

fn recurrent(
    op: &'static str,
    direction: Direction,
    gates: usize,
    operands: &[&Node],
) -> Result<Shape, IrError> {
    if !(3..=6).contains(&operands.len()) {
        return Err(IrError::Arity {
            op,
            expected: "3 to 6",
            actual: operands.len(),
        });
    }
    if let Some(slot) = operands[..3].iter().position(|node| node.op == Op::Undefined) {
        return Err(IrError::RecurrentOperand {
            op,
            slot,
            actual: Vec::new(),
            expected: "a defined operand".to_string(),
        });
    }
    let seq = &operands[0].shape;
    expect_rank(op, 0, seq, 3, "[seq_len, batch, input_size]")?;
    let r = &operands[2].shape;
    expect_rank(op, 2, r, 3, "[dirs, gates * hidden, hidden]")?;

    let dirs = direction.num_directions();
    let (seq_len, batch, input_size) = (seq.dims[0], seq.dims[1], seq.dims[2]);
    let hidden = r.dims[2];

    expect_dims(op, 1, &operands[1].shape, &[dirs, gates * hidden, input_size])?;
    expect_dims(op, 2, r, &[dirs, gates * hidden, hidden])?;
    if let Some(bias) = operands.get(3).filter(|node| node.op != Op::Undefined) {
        expect_dims(op, 3, &bias.shape, &[dirs, 2 * gates * hidden])?;
    }
    if let Some(initial) = operands.get(5).filter(|node| node.op != Op::Undefined) {
        expect_dims(op, 5, &initial.shape, &[dirs, batch, hidden])?;
    }
    for node in &operands[1..3] {
        check_data_type(seq, &node.shape)?;
    }

    Ok(Shape::new(seq.data_type, vec![seq_len, dirs, batch, hidden]))
}

fn expect_rank(
    op: &'static str,
    slot: usize,
    shape: &Shape,
    rank: usize,
    layout: &str,
) -> Result<(), IrError> {
    if shape.rank() == rank {
        Ok(())
    } else {
        Err(IrError::RecurrentOperand {
            op,
            slot,
            actual: shape.dims.clone(),
            expected: layout.to_string(),
        })
    }
}

fn expect_dims(op: &'static str, slot: usize, shape: &Shape, dims: &[usize]) -> Result<(), IrError> {
    if shape.dims == dims {
        Ok(())
    } else {
        Err(IrError::RecurrentOperand {
            op,
            slot,
            actual: shape.dims.clone(),
            expected: format!("{dims:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, Graph, GruOp, RnnOp};

    fn f32_shape(dims: &[usize]) -> Shape {
        Shape::new(DataType::F32, dims.to_vec())
    }

    #[test]
    fn test_infer_add_shape() {
        let mut graph = Graph::new();
        let a = graph.add_parameter("A", f32_shape(&[1, 3, 224, 224]));
        let b = graph.add_parameter("B", f32_shape(&[1, 3, 224, 224]));
        let c = graph.add_node(Op::Add, vec![a, b]).unwrap();

        assert_eq!(graph.shape(c).dims, vec![1, 3, 224, 224]);
    }

    #[test]
    fn test_infer_add_broadcasts_both_sides() {
        let mut graph = Graph::new();
        let a = graph.add_parameter("A", f32_shape(&[4, 1]));
        let b = graph.add_parameter("B", f32_shape(&[3]));
        let c = graph.add_node(Op::Sub, vec![a, b]).unwrap();

        assert_eq!(graph.shape(c).dims, vec![4, 3]);
    }

    #[test]
    fn test_infer_add_rejects_incompatible() {
        let mut graph = Graph::new();
        let a = graph.add_parameter("A", f32_shape(&[4, 2]));
        let b = graph.add_parameter("B", f32_shape(&[3]));

        assert!(matches!(
            graph.add_node(Op::Add, vec![a, b]),
            Err(IrError::IncompatibleShapes { op: "add", .. })
        ));
    }

    #[test]
    fn test_infer_add_rejects_data_type_mismatch() {
        let mut graph = Graph::new();
        let a = graph.add_parameter("A", f32_shape(&[3]));
        let b = graph.add_parameter("B", Shape::new(DataType::F64, vec![3]));

        assert_eq!(
            graph.add_node(Op::Mul, vec![a, b]).unwrap_err(),
            IrError::DataTypeMismatch {
                lhs: DataType::F32,
                rhs: DataType::F64
            }
        );
    }

    #[test]
    fn test_infer_dot_shape() {
        let mut graph = Graph::new();
        let a = graph.add_parameter("A", f32_shape(&[5, 10]));
        let b = graph.add_parameter("B", f32_shape(&[10, 3]));
        let y = graph.add_node(Op::Dot, vec![a, b]).unwrap();

        assert_eq!(graph.shape(y).dims, vec![5, 3]);
        assert!(graph.add_node(Op::Dot, vec![b, b]).is_err());
    }

    #[test]
    fn test_infer_transpose_shape() {
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[1, 2, 3]));
        let y = graph
            .add_node(Op::Transpose { perm: vec![0, 2, 1] }, vec![x])
            .unwrap();

        assert_eq!(graph.shape(y).dims, vec![1, 3, 2]);
        assert!(matches!(
            graph.add_node(Op::Transpose { perm: vec![0, 0, 1] }, vec![x]),
            Err(IrError::InvalidPermutation { .. })
        ));
    }

    #[test]
    fn test_infer_slice_squeeze_unsqueeze() {
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[4, 2, 5]));
        let s = graph
            .add_node(
                Op::Slice {
                    axes: vec![0],
                    starts: vec![1],
                    ends: vec![2],
                },
                vec![x],
            )
            .unwrap();
        let q = graph.add_node(Op::Squeeze { axes: vec![0] }, vec![s]).unwrap();
        let u = graph.add_node(Op::Unsqueeze { axes: vec![0, 1] }, vec![q]).unwrap();

        assert_eq!(graph.shape(s).dims, vec![1, 2, 5]);
        assert_eq!(graph.shape(q).dims, vec![2, 5]);
        assert_eq!(graph.shape(u).dims, vec![1, 1, 2, 5]);
    }

    #[test]
    fn test_infer_slice_out_of_bounds() {
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[4]));

        assert_eq!(
            graph
                .add_node(
                    Op::Slice {
                        axes: vec![0],
                        starts: vec![3],
                        ends: vec![5],
                    },
                    vec![x],
                )
                .unwrap_err(),
            IrError::SliceOutOfBounds {
                axis: 0,
                start: 3,
                end: 5,
                dim: 4
            }
        );
    }

    #[test]
    fn test_infer_squeeze_non_unit() {
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[2, 1]));

        assert_eq!(
            graph.add_node(Op::Squeeze { axes: vec![0] }, vec![x]).unwrap_err(),
            IrError::SqueezeNonUnit { axis: 0, dim: 2 }
        );
        let all = graph.add_node(Op::Squeeze { axes: vec![] }, vec![x]).unwrap();
        assert_eq!(graph.shape(all).dims, vec![2]);
    }

    #[test]
    fn test_infer_broadcast_shape() {
        let mut graph = Graph::new();
        let b = graph.add_parameter("B", f32_shape(&[3]));
        let y = graph
            .add_node(
                Op::Broadcast {
                    axis: 1,
                    dims: vec![4, 3],
                },
                vec![b],
            )
            .unwrap();

        assert_eq!(graph.shape(y).dims, vec![4, 3]);
        assert!(graph
            .add_node(
                Op::Broadcast {
                    axis: 0,
                    dims: vec![4, 3],
                },
                vec![b],
            )
            .is_err());
    }

    #[test]
    fn test_infer_concat_shape() {
        let mut graph = Graph::new();
        let a = graph.add_parameter("A", f32_shape(&[1, 1, 2, 3]));
        let b = graph.add_parameter("B", f32_shape(&[2, 1, 2, 3]));
        let single = graph.add_node(Op::Concat { axis: 0 }, vec![a]).unwrap();
        let joined = graph.add_node(Op::Concat { axis: 0 }, vec![a, b]).unwrap();

        assert_eq!(graph.shape(single).dims, vec![1, 1, 2, 3]);
        assert_eq!(graph.shape(joined).dims, vec![3, 1, 2, 3]);
        assert!(graph.add_node(Op::Concat { axis: 1 }, vec![a, b]).is_err());
        assert!(graph.add_node(Op::Concat { axis: 0 }, vec![]).is_err());
    }

    #[test]
    fn test_infer_recurrent_shapes() {
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[5, 2, 4]));
        let w = graph.add_parameter("W", f32_shape(&[2, 9, 4]));
        let r = graph.add_parameter("R", f32_shape(&[2, 9, 3]));
        let b = graph.add_parameter("B", f32_shape(&[2, 18]));
        let undef = graph.add_undefined();
        let h0 = graph.add_parameter("H0", f32_shape(&[2, 2, 3]));
        let gru = graph
            .add_node(
                Op::Gru(GruOp {
                    direction: Direction::Bidirectional,
                    activations: vec![],
                    linear_before_reset: false,
                }),
                vec![x, w, r, b, undef, h0],
            )
            .unwrap();
        let last = graph.add_node(Op::RnnLastOutput, vec![gru]).unwrap();

        assert_eq!(graph.shape(gru).dims, vec![5, 2, 2, 3]);
        assert_eq!(graph.shape(last).dims, vec![2, 2, 3]);
    }

    #[test]
    fn test_infer_recurrent_rejects_bad_operands() {
        let mut graph = Graph::new();
        let x = graph.add_parameter("X", f32_shape(&[5, 2, 4]));
        let w = graph.add_parameter("W", f32_shape(&[1, 3, 4]));
        let r = graph.add_parameter("R", f32_shape(&[1, 3, 3]));
        let b = graph.add_parameter("B", f32_shape(&[1, 5]));
        let rnn = Op::Rnn(RnnOp {
            direction: Direction::Forward,
            activations: vec![],
        });

        assert!(matches!(
            graph.add_node(rnn.clone(), vec![x, w]),
            Err(IrError::Arity { op: "rnn", actual: 2, .. })
        ));
        assert!(matches!(
            graph.add_node(rnn.clone(), vec![x, w, r, b]),
            Err(IrError::RecurrentOperand { slot: 3, .. })
        ));
        let bidirectional = Op::Rnn(RnnOp {
            direction: Direction::Bidirectional,
            activations: vec![],
        });
        assert!(matches!(
            graph.add_node(bidirectional, vec![x, w, r]),
            Err(IrError::RecurrentOperand { slot: 1, .. })
        ));
    }
}
