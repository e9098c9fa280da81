//! # Kakari Core
//!
//! Projective dependency tree inference for biaffine parsers: Eisner
//! decoding, inside/outside over projective trees, tree-CRF losses with
//! partial supervision, plus the corpus, vocabulary and scorer plumbing
//! around them.
//!
//! ## Quick Start
//!
//! ```rust
//! use kakari_core::inference::EisnerDecoder;
//! use kakari_core::types::ScoreMatrix;
//!
//! // Root plus three words; a chain 0 -> 1 -> 2 -> 3 scores best.
//! let mut scores = ScoreMatrix::filled(4, -10.0);
//! scores.set(0, 1, 5.0);
//! scores.set(1, 2, 5.0);
//! scores.set(2, 3, 5.0);
//!
//! let heads = EisnerDecoder::new().decode(&scores).unwrap();
//! assert_eq!(heads, vec![None, Some(0), Some(1), Some(2)]);
//! ```
pub mod corpus;
pub mod error;
pub mod inference;
pub mod loss;
pub mod metric;
pub mod model;
pub mod types;

// Re-export primary API
pub use corpus::{Batch, Corpus, TextDataset, Vocab};
pub use error::{KakariError, Result};
pub use inference::{
    ArcView, DecodeConfig, EisnerDecoder, Marginals, TreeDecoder, constrained_log_partition,
    log_partition, marginals,
};
pub use loss::{BatchLoss, LossAssembler, LossMode, SentenceLoss, TaskArena};
pub use metric::Metric;
pub use model::{ArcScorer, BiaffineConfig, BiaffineScorer, FixedScorer};
pub use types::{
    DecodedTree, GoldTree, Instance, RelScores, ScoreMatrix, Sentence, SentenceScores,
};
