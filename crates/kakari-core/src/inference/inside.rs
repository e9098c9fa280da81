//! # Inside Algorithm
//!
//! Log-partition function over all projective trees, optionally restricted
//! to trees that agree with a partial gold annotation.

use crate::error::{KakariError, Result};
use crate::inference::chart::Chart;
use crate::inference::semiring::LogSemiring;
use crate::types::ScoreMatrix;

/// Inside chart in the log semiring.
pub type InsideChart = Chart<LogSemiring>;

/// Fill the inside chart for `scores`.
pub fn inside(scores: &ScoreMatrix) -> Result<InsideChart> {
    if scores.is_empty() {
        return Err(KakariError::EmptyInput);
    }
    Ok(Chart::<LogSemiring>::fill(scores))
}

/// `logZ`: log of the summed exponentiated score of every projective tree.
///
/// Returns `-inf` (never NaN) when no tree has a finite score.
pub fn log_partition(scores: &ScoreMatrix) -> Result<f64> {
    Ok(inside(scores)?.root_score())
}

/// `logZ` restricted to trees containing every annotated arc of `heads`.
///
/// `heads[j] = None` leaves token `j` free, so only the unannotated part of
/// the sentence contributes uncertainty. With a complete annotation this is
/// exactly the gold tree score (or `-inf` if the gold tree is not projective).
pub fn constrained_log_partition(scores: &ScoreMatrix, heads: &[Option<usize>]) -> Result<f64> {
    log_partition(&scores.constrained(heads)?)
}
