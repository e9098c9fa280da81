use thiserror::Error;

/// Errors that can occur during Kakari core operations.
#[derive(Debug, Error)]
pub enum KakariError {
    /// A sentence or batch without any token was handed to an operation that needs one.
    #[error("input is empty")]
    EmptyInput,

    /// Score, mask or gold arrays disagree on their dimensions.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The requested task is not part of the loaded vocabulary.
    #[error("unknown task {0:?}")]
    UnknownTask(String),

    /// A corpus line could not be parsed into CoNLL columns.
    #[error("malformed corpus at line {line}: {reason}")]
    MalformedCorpus {
        /// 1-based line number in the source file.
        line: usize,
        /// What was wrong with the line.
        reason: String,
    },

    /// A head index points outside of its sentence.
    #[error("head {head} of token {dependent} is outside a sentence of length {len}")]
    InvalidHead {
        /// Offending dependent position.
        dependent: usize,
        /// Head index found for it.
        head: i64,
        /// Sentence length including the root.
        len: usize,
    },

    /// The score matrix admits no projective tree (every tree has score -inf).
    #[error("no valid tree exists under the given scores and constraints")]
    DegenerateScores,

    /// I/O failure while reading or writing corpora and artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A regex pattern failed to compile (should not happen with static patterns).
    #[error("regex compilation error: {0}")]
    Regex(#[from] regex::Error),

    /// The model weights could not be loaded.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Candle ML framework error.
    #[error("ML framework error: {0}")]
    Candle(String),
}

impl From<candle_core::Error> for KakariError {
    fn from(err: candle_core::Error) -> Self {
        KakariError::Candle(err.to_string())
    }
}

/// Result type alias for Kakari operations.
pub type Result<T> = std::result::Result<T, KakariError>;
