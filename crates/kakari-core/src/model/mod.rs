//! Arc and relation scorers.

pub mod biaffine;
pub mod scorer;

pub use biaffine::{BiaffineConfig, BiaffineScorer, TaskOutput, gather_scores};
pub use scorer::{ArcScorer, FixedScorer, pack_arc_grads, pack_rel_grads, split_scores};
