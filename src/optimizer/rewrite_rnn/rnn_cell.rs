use crate::ir::{Activation, NodeId};
use crate::optimizer::rewrite_rnn::cell::{
    CellInputs, CellOutput, Emitter, RecurrentCell, SequenceAccumulator, SequenceOrder,
};
use crate::optimizer::OptimizerError;

/// `h_t = f(x_t . W^T + h_{t-1} . R^T + Wb + Rb)`
pub(crate) struct VanillaRnnCell {
    pub activation: Activation,
}

impl RecurrentCell for VanillaRnnCell {
    fn name(&self) -> &'static str {
        "rnn"
    }

    fn unroll(
        &self,
        emitter: &mut Emitter<'_>,
        inputs: &CellInputs,
        order: SequenceOrder,
    ) -> Result<CellOutput, OptimizerError> {
        let hidden = emitter.shape(inputs.r).dims[2];

        let w = emitter.split_weight(inputs.w, 1)?[0];
        let r = emitter.split_weight(inputs.r, 1)?[0];
        let mut h = emitter.squeeze(inputs.initial_hidden, &[0])?;
        let state_dims = emitter.shape(h).dims.clone();

        let bias = match inputs.bias {
            Some(bias) => Some(combined_bias(emitter, bias, hidden, &state_dims)?),
            None => None,
        };

        SequenceAccumulator::new(order, inputs.seq_len).run(emitter, |emitter, t| {
            tracing::trace!(node = emitter.anchor(), cell = self.name(), timestep = t, "unrolling step");
            let x = emitter.timestep(inputs.sequence, t)?;
            let xw = emitter.dot(x, w)?;
            let hr = emitter.dot(h, r)?;
            let mut pre = emitter.add(xw, hr)?;
            if let Some(bias) = bias {
                pre = emitter.add(pre, bias)?;
            }
            h = emitter.activate(self.activation, pre)?;
            Ok(emitter.unsqueeze(h, &[0, 1])?)
        })
    }
}

/// `Wb + Rb` from a `[1, 2 * hidden]` bias, broadcast to the state shape.
fn combined_bias(
    emitter: &mut Emitter<'_>,
    bias: NodeId,
    hidden: usize,
    state_dims: &[usize],
) -> Result<NodeId, OptimizerError> {
    let bias = emitter.squeeze(bias, &[0])?;
    let wb = emitter.slice(bias, 0, 0, hidden)?;
    let rb = emitter.slice(bias, 0, hidden, 2 * hidden)?;
    let b = emitter.add(wb, rb)?;
    Ok(emitter.broadcast(b, 1, state_dims)?)
}
