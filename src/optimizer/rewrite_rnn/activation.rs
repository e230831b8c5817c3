use crate::ir::{Activation, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Rnn,
    Gru,
}

impl CellKind {
    pub fn activations_per_direction(self) -> usize {
        match self {
            CellKind::Rnn => 1,
            CellKind::Gru => 2,
        }
    }
}

/// What to do with activation lists longer than the cell needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActivationPolicy {
    /// Extra entries are ignored.
    #[default]
    Truncate,
    /// Extra entries are an error, in every direction mode.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationOversupply {
    pub supplied: usize,
    pub expected: usize,
}

/// Fills a possibly short activation list up to exactly
/// `kind.activations_per_direction() * direction.num_directions()` entries.
///
/// For bidirectional cells the first half belongs to the forward pass and the
/// second half to the reverse pass.
pub fn resolve_activations(
    kind: CellKind,
    direction: Direction,
    declared: &[Activation],
    policy: ActivationPolicy,
) -> Result<Vec<Activation>, ActivationOversupply> {
    let expected = kind.activations_per_direction() * direction.num_directions();
    if policy == ActivationPolicy::Strict && declared.len() > expected {
        return Err(ActivationOversupply {
            supplied: declared.len(),
            expected,
        });
    }

    use Activation::{Sigmoid, Tanh};
    let bidirectional = direction == Direction::Bidirectional;
    let resolved = match (kind, bidirectional, declared) {
        (CellKind::Rnn, false, []) => vec![Tanh],
        (CellKind::Rnn, true, []) => vec![Tanh, Tanh],
        (CellKind::Rnn, true, [f]) => vec![*f, *f],
        (CellKind::Gru, false, []) => vec![Sigmoid, Tanh],
        (CellKind::Gru, false, [f]) => vec![*f, *f],
        (CellKind::Gru, true, []) => vec![Sigmoid, Tanh, Sigmoid, Tanh],
        (CellKind::Gru, true, [f]) => vec![*f; 4],
        (CellKind::Gru, true, [f, g]) => vec![*f, *g, *f, *g],
        (CellKind::Gru, true, [f, g, h]) => vec![*f, *g, *h, *f],
        (_, _, supplied) => supplied.iter().take(expected).copied().collect(),
    };
    Ok(resolved)
}
