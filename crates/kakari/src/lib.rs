//! # Kakari
//!
//! Facade over the kakari workspace: tree inference, losses and scorers from
//! `kakari-core`, batch orchestration from `kakari-trainer`.
//!
//! ```rust
//! use kakari::{DecodeConfig, TreeDecoder, ScoreMatrix};
//! use kakari::inference::word_mask;
//!
//! let mut arcs = ScoreMatrix::filled(3, 0.0);
//! arcs.set(0, 2, 3.0);
//! arcs.set(2, 1, 3.0);
//!
//! let decoder = TreeDecoder::new(DecodeConfig::new().with_tree(true));
//! let heads = decoder.heads(&arcs, &word_mask(3)).unwrap();
//! assert_eq!(heads, vec![None, Some(2), Some(0)]);
//! ```
pub use kakari_core::*;
pub use kakari_trainer::{Evaluation, ModelBundle, Optim, Orchestrator, TrainConfig, cmds};
