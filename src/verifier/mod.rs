use std::collections::HashMap;

use ndarray::{ArrayD, ShapeError};
use thiserror::Error;

use crate::ir::{Graph, IrError};

mod interpreter;
mod reference;

pub use interpreter::Interpreter;
pub use reference::activate;

#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("Inference error: {0}")]
    InferenceError(String),
    #[error("Parity error: {0}")]
    ParityError(String),
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Parameter values by name.
pub type Feeds = HashMap<String, ArrayD<f32>>;

pub(crate) fn shape_error(err: ShapeError) -> VerifierError {
    VerifierError::InferenceError(err.to_string())
}

/// Evaluates `graph` and returns the values of its outputs.
pub fn evaluate(graph: &Graph, feeds: &Feeds) -> Result<Vec<ArrayD<f32>>, VerifierError> {
    let mut interpreter = Interpreter::new(graph);
    interpreter.run(feeds)?;
    interpreter.outputs()
}

/// Fails unless both tensors have the same shape and every element pair is
/// within `epsilon`.
pub fn check_parity(
    expected: &ArrayD<f32>,
    actual: &ArrayD<f32>,
    epsilon: f32,
) -> Result<(), VerifierError> {
    if expected.shape() != actual.shape() {
        return Err(VerifierError::ParityError(format!(
            "shape mismatch: expected {:?}, got {:?}",
            expected.shape(),
            actual.shape()
        )));
    }
    for (index, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
        let diff = (e - a).abs();
        if diff > epsilon || diff.is_nan() {
            return Err(VerifierError::ParityError(format!(
                "element {index}: expected {e}, got {a} (epsilon {epsilon})"
            )));
        }
    }
    Ok(())
}

/// Evaluates both graphs on the same feeds and compares their outputs
/// pairwise.
pub fn verify_lowering(
    original: &Graph,
    lowered: &Graph,
    feeds: &Feeds,
    epsilon: f32,
) -> Result<(), VerifierError> {
    let expected = evaluate(original, feeds)?;
    let actual = evaluate(lowered, feeds)?;
    if expected.len() != actual.len() {
        return Err(VerifierError::ParityError(format!(
            "{} outputs before lowering, {} after",
            expected.len(),
            actual.len()
        )));
    }
    for (i, (e, a)) in expected.iter().zip(&actual).enumerate() {
        check_parity(e, a, epsilon).map_err(|err| match err {
            VerifierError::ParityError(msg) => VerifierError::ParityError(format!("output {i}: {msg}")),
            other => other,
        })?;
    }
    tracing::debug!(outputs = expected.len(), epsilon, "lowered graph matches reference");
    Ok(())
}
