use ndarray::{s, Array1, Array2, Array3, Array4, ArrayD, ArrayView1, ArrayView2, ArrayView3, Axis, Ix2, Ix3};

use crate::ir::{Activation, Direction, GruOp, RnnOp};
use crate::optimizer::rewrite_rnn::{resolve_activations, ActivationPolicy, CellKind};
use crate::verifier::{shape_error, VerifierError};

pub fn activate(activation: Activation, x: f32) -> f32 {
    match activation {
        Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        Activation::Tanh => x.tanh(),
        Activation::Relu => x.max(0.0),
        Activation::LeakyRelu { alpha } => {
            if x >= 0.0 {
                x
            } else {
                alpha * x
            }
        }
        Activation::Elu { alpha } => {
            if x >= 0.0 {
                x
            } else {
                alpha * (x.exp() - 1.0)
            }
        }
        Activation::HardSigmoid { alpha, beta } => (alpha * x + beta).clamp(0.0, 1.0),
        Activation::Softsign => x / (1.0 + x.abs()),
        Activation::Softplus => x.exp().ln_1p(),
    }
}

/// Evaluated operands of a recurrent node.
pub(crate) struct Operands<'a> {
    pub x: &'a ArrayD<f32>,
    pub w: &'a ArrayD<f32>,
    pub r: &'a ArrayD<f32>,
    pub bias: Option<&'a ArrayD<f32>>,
    pub initial_hidden: Option<&'a ArrayD<f32>>,
}

pub(crate) struct RecurrentOutputs {
    /// `[seq_len, dirs, batch, hidden]`
    pub sequence: ArrayD<f32>,
    /// `[dirs, batch, hidden]`
    pub last_state: ArrayD<f32>,
}

struct DirectionWeights<'a> {
    w: ArrayView2<'a, f32>,
    r: ArrayView2<'a, f32>,
    bias: Option<ArrayView1<'a, f32>>,
    hidden: usize,
}

impl DirectionWeights<'_> {
    fn input_block(&self, gate: usize) -> ArrayView2<'_, f32> {
        self.w.slice(s![gate * self.hidden..(gate + 1) * self.hidden, ..])
    }

    fn recurrence_block(&self, gate: usize) -> ArrayView2<'_, f32> {
        self.r.slice(s![gate * self.hidden..(gate + 1) * self.hidden, ..])
    }

    /// Segment `i` of the packed bias, zeros when there is none.
    fn bias(&self, i: usize) -> Array1<f32> {
        match self.bias {
            Some(bias) => bias.slice(s![i * self.hidden..(i + 1) * self.hidden]).to_owned(),
            None => Array1::zeros(self.hidden),
        }
    }
}

pub(crate) fn rnn(op: &RnnOp, operands: &Operands<'_>) -> Result<RecurrentOutputs, VerifierError> {
    let activations = resolve(CellKind::Rnn, op.direction, &op.activations)?;
    unroll(op.direction, operands, |x, h, weights, dir| {
        let pre = x.dot(&weights.input_block(0).t())
            + h.dot(&weights.recurrence_block(0).t())
            + &weights.bias(0)
            + &weights.bias(1);
        pre.mapv_into(|v| activate(activations[dir], v))
    })
}

pub(crate) fn gru(op: &GruOp, operands: &Operands<'_>) -> Result<RecurrentOutputs, VerifierError> {
    let activations = resolve(CellKind::Gru, op.direction, &op.activations)?;
    unroll(op.direction, operands, |x, h, weights, dir| {
        let (g1, g2) = (activations[2 * dir], activations[2 * dir + 1]);
        let gate = |i: usize, activation: Activation| {
            let pre = x.dot(&weights.input_block(i).t())
                + h.dot(&weights.recurrence_block(i).t())
                + &weights.bias(i)
                + &weights.bias(i + 3);
            pre.mapv_into(|v| activate(activation, v))
        };
        let z = gate(0, g1);
        let r = gate(1, g1);

        let xh = x.dot(&weights.input_block(2).t());
        let pre = if op.linear_before_reset {
            let hr = h.dot(&weights.recurrence_block(2).t()) + &weights.bias(5);
            xh + &r * &hr + &weights.bias(2)
        } else {
            let reset = &r * h;
            xh + reset.dot(&weights.recurrence_block(2).t()) + &weights.bias(2) + &weights.bias(5)
        };
        let c = pre.mapv_into(|v| activate(g2, v));
        z.mapv(|v| 1.0 - v) * &c + &z * h
    })
}

fn resolve(
    kind: CellKind,
    direction: Direction,
    declared: &[Activation],
) -> Result<Vec<Activation>, VerifierError> {
    resolve_activations(kind, direction, declared, ActivationPolicy::Truncate).map_err(|err| {
        VerifierError::InferenceError(format!(
            "{} activations supplied, {} expected",
            err.supplied, err.expected
        ))
    })
}

/// Runs `step(x_t, h_prev, weights, dir)` over every timestep of every
/// direction, the second direction of a bidirectional node in reverse.
fn unroll(
    direction: Direction,
    operands: &Operands<'_>,
    mut step: impl FnMut(ArrayView2<'_, f32>, &Array2<f32>, &DirectionWeights<'_>, usize) -> Array2<f32>,
) -> Result<RecurrentOutputs, VerifierError> {
    let x = view3(operands.x)?;
    let w = view3(operands.w)?;
    let r = view3(operands.r)?;
    let bias = operands
        .bias
        .map(|bias| bias.view().into_dimensionality::<Ix2>())
        .transpose()
        .map_err(shape_error)?;
    let initial_hidden = operands.initial_hidden.map(view3).transpose()?;

    let (seq_len, batch, hidden) = (x.len_of(Axis(0)), x.len_of(Axis(1)), r.len_of(Axis(2)));
    let dirs = direction.num_directions();
    let mut sequence = Array4::<f32>::zeros((seq_len, dirs, batch, hidden));
    let mut last_state = Array3::<f32>::zeros((dirs, batch, hidden));

    for dir in 0..dirs {
        let weights = DirectionWeights {
            w: w.index_axis(Axis(0), dir),
            r: r.index_axis(Axis(0), dir),
            bias: bias.map(|bias| bias.index_axis_move(Axis(0), dir)),
            hidden,
        };
        let mut h = match initial_hidden {
            Some(h0) => h0.index_axis(Axis(0), dir).to_owned(),
            None => Array2::zeros((batch, hidden)),
        };
        let reverse = direction == Direction::Reverse || dir == 1;
        for i in 0..seq_len {
            let t = if reverse { seq_len - 1 - i } else { i };
            h = step(x.index_axis(Axis(0), t), &h, &weights, dir);
            sequence.slice_mut(s![t, dir, .., ..]).assign(&h);
        }
        last_state.slice_mut(s![dir, .., ..]).assign(&h);
    }

    Ok(RecurrentOutputs {
        sequence: sequence.into_dyn(),
        last_state: last_state.into_dyn(),
    })
}

fn view3(array: &ArrayD<f32>) -> Result<ArrayView3<'_, f32>, VerifierError> {
    array.view().into_dimensionality::<Ix3>().map_err(shape_error)
}
