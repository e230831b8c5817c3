use crate::ir::{Activation, NodeId};
use crate::optimizer::rewrite_rnn::cell::{
    CellInputs, CellOutput, Emitter, RecurrentCell, SequenceAccumulator, SequenceOrder,
};
use crate::optimizer::OptimizerError;

/// Update/reset/candidate recurrence.
///
/// ```text
/// zt = g1(xt.Wz^T + ht-1.Rz^T + Wbz + Rbz)
/// rt = g1(xt.Wr^T + ht-1.Rr^T + Wbr + Rbr)
/// ct = g2(xt.Wh^T + (rt * ht-1).Rh^T + Wbh + Rbh)     linear_before_reset = false
/// ct = g2(xt.Wh^T + rt * (ht-1.Rh^T + Rbh) + Wbh)     linear_before_reset = true
/// ht = (1 - zt) * ct + zt * ht-1
/// ```
pub(crate) struct GruCell {
    pub gate: Activation,
    pub candidate: Activation,
    pub linear_before_reset: bool,
}

/// Gate weights, each transposed to `[input or hidden, hidden]`.
struct GateWeights {
    z: NodeId,
    r: NodeId,
    h: NodeId,
}

enum CandidateBias {
    /// `Wbh + Rbh`, added after the recurrent projection.
    Combined(NodeId),
    /// `Wbh` and `Rbh` kept apart so `Rbh` can be reset-scaled.
    Split { input: NodeId, recurrent: NodeId },
}

struct GruBias {
    z: NodeId,
    r: NodeId,
    candidate: CandidateBias,
}

impl GruCell {
    fn bias(
        &self,
        emitter: &mut Emitter<'_>,
        bias: NodeId,
        hidden: usize,
        state_dims: &[usize],
    ) -> Result<GruBias, OptimizerError> {
        let bias = emitter.squeeze(bias, &[0])?;
        let mut chunks = Vec::with_capacity(6);
        for i in 0..6 {
            chunks.push(emitter.slice(bias, 0, i * hidden, (i + 1) * hidden)?);
        }
        let (wbz, wbr, wbh) = (chunks[0], chunks[1], chunks[2]);
        let (rbz, rbr, rbh) = (chunks[3], chunks[4], chunks[5]);

        let bz = emitter.add(wbz, rbz)?;
        let br = emitter.add(wbr, rbr)?;
        let candidate = if self.linear_before_reset {
            CandidateBias::Split {
                input: emitter.broadcast(wbh, 1, state_dims)?,
                recurrent: emitter.broadcast(rbh, 1, state_dims)?,
            }
        } else {
            let bh = emitter.add(wbh, rbh)?;
            CandidateBias::Combined(emitter.broadcast(bh, 1, state_dims)?)
        };

        Ok(GruBias {
            z: emitter.broadcast(bz, 1, state_dims)?,
            r: emitter.broadcast(br, 1, state_dims)?,
            candidate,
        })
    }

    /// `g1(x.W^T + h.R^T [+ b])`
    fn gate(
        &self,
        emitter: &mut Emitter<'_>,
        x: NodeId,
        h: NodeId,
        w: NodeId,
        r: NodeId,
        bias: Option<NodeId>,
    ) -> Result<NodeId, OptimizerError> {
        let xw = emitter.dot(x, w)?;
        let hr = emitter.dot(h, r)?;
        let mut pre = emitter.add(xw, hr)?;
        if let Some(bias) = bias {
            pre = emitter.add(pre, bias)?;
        }
        Ok(emitter.activate(self.gate, pre)?)
    }

    fn candidate(
        &self,
        emitter: &mut Emitter<'_>,
        x: NodeId,
        h: NodeId,
        rt: NodeId,
        weights: (NodeId, NodeId),
        bias: Option<&CandidateBias>,
    ) -> Result<NodeId, OptimizerError> {
        let (w, r) = weights;
        let xw = emitter.dot(x, w)?;
        let pre = if self.linear_before_reset {
            let mut hr = emitter.dot(h, r)?;
            if let Some(CandidateBias::Split { recurrent, .. }) = bias {
                hr = emitter.add(hr, *recurrent)?;
            }
            let reset = emitter.mul(rt, hr)?;
            let mut pre = emitter.add(xw, reset)?;
            if let Some(CandidateBias::Split { input, .. }) = bias {
                pre = emitter.add(pre, *input)?;
            }
            pre
        } else {
            let reset = emitter.mul(rt, h)?;
            let hr = emitter.dot(reset, r)?;
            let mut pre = emitter.add(xw, hr)?;
            if let Some(CandidateBias::Combined(bh)) = bias {
                pre = emitter.add(pre, *bh)?;
            }
            pre
        };
        Ok(emitter.activate(self.candidate, pre)?)
    }
}

impl RecurrentCell for GruCell {
    fn name(&self) -> &'static str {
        "gru"
    }

    fn unroll(
        &self,
        emitter: &mut Emitter<'_>,
        inputs: &CellInputs,
        order: SequenceOrder,
    ) -> Result<CellOutput, OptimizerError> {
        let data_type = emitter.shape(inputs.sequence).data_type;
        let hidden = emitter.shape(inputs.r).dims[2];

        let w = gate_weights(emitter, inputs.w)?;
        let r = gate_weights(emitter, inputs.r)?;
        let mut h = emitter.squeeze(inputs.initial_hidden, &[0])?;
        let state_dims = emitter.shape(h).dims.clone();
        let ones = emitter.splat(data_type, state_dims.clone(), 1.0)?;

        let bias = match inputs.bias {
            Some(bias) => Some(self.bias(emitter, bias, hidden, &state_dims)?),
            None => None,
        };

        SequenceAccumulator::new(order, inputs.seq_len).run(emitter, |emitter, t| {
            tracing::trace!(node = emitter.anchor(), cell = self.name(), timestep = t, "unrolling step");
            let x = emitter.timestep(inputs.sequence, t)?;
            let zt = self.gate(emitter, x, h, w.z, r.z, bias.as_ref().map(|b| b.z))?;
            let rt = self.gate(emitter, x, h, w.r, r.r, bias.as_ref().map(|b| b.r))?;
            let ct = self.candidate(
                emitter,
                x,
                h,
                rt,
                (w.h, r.h),
                bias.as_ref().map(|b| &b.candidate),
            )?;

            let keep = emitter.sub(ones, zt)?;
            let fresh = emitter.mul(keep, ct)?;
            let carried = emitter.mul(zt, h)?;
            h = emitter.add(fresh, carried)?;

            Ok(emitter.unsqueeze(h, &[0, 1])?)
        })
    }
}

fn gate_weights(emitter: &mut Emitter<'_>, weight: NodeId) -> Result<GateWeights, OptimizerError> {
    let blocks = emitter.split_weight(weight, 3)?;
    Ok(GateWeights {
        z: blocks[0],
        r: blocks[1],
        h: blocks[2],
    })
}
