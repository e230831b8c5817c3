pub mod ir;
pub mod optimizer;
pub mod verifier;

pub use ir::{Graph, NodeId};
pub use optimizer::rewrite_rnn::{ActivationPolicy, RewriteRnn, RewriteRnnConfig};
pub use optimizer::{OptimizationPass, Optimizer, OptimizerError};
