pub mod scores;
pub mod sentence;
pub mod tree;

pub use scores::{RelScores, ScoreMatrix, SentenceScores};
pub use sentence::{ConllToken, GoldTree, Instance, Sentence};
pub use tree::{DecodedTree, TreeViolation, check_heads};
