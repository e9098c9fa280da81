//! # Eisner Decoding
//!
//! Implements the Eisner algorithm for finding the maximum-weight projective
//! dependency tree given a dense arc score matrix, plus the unconstrained
//! per-token argmax used when no tree is required.

use tracing::debug;

use crate::error::{KakariError, Result};
use crate::inference::chart::Chart;
use crate::inference::semiring::MaxSemiring;
use crate::types::ScoreMatrix;
use crate::types::scores::argmax;

/// Eisner decoder for projective dependency trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct EisnerDecoder;

impl EisnerDecoder {
    /// Create a new Eisner decoder.
    pub fn new() -> Self {
        Self
    }

    /// Decode the highest scoring projective tree rooted at position 0.
    ///
    /// # Arguments
    /// * `scores` - Matrix of shape [n, n], `scores.get(head, dep)`
    ///
    /// # Returns
    /// Heads indexed by position; the root gets `None`.
    pub fn decode(&self, scores: &ScoreMatrix) -> Result<Vec<Option<usize>>> {
        if scores.is_empty() {
            return Err(KakariError::EmptyInput);
        }
        let chart = Chart::<MaxSemiring>::fill(scores);
        if chart.root_score() == f64::NEG_INFINITY && scores.len() > 1 {
            return Err(KakariError::DegenerateScores);
        }
        Ok(chart.backtrack())
    }

    /// Decode with a token mask.
    ///
    /// Masked positions are dropped, the remaining sub-sentence is decoded and
    /// the dropped positions come back as `None`. Tokens left without any
    /// finite incoming arc are dropped as well.
    pub fn decode_masked(&self, scores: &ScoreMatrix, mask: &[bool]) -> Result<Vec<Option<usize>>> {
        let kept = admissible_positions(scores, mask)?;
        let mut heads = vec![None; scores.len()];
        if kept.len() < 2 {
            return Ok(heads);
        }
        if kept.len() < scores.len() {
            debug!(
                kept = kept.len(),
                total = scores.len(),
                "decoding masked sub-sentence"
            );
        }
        let sub = self.decode(&scores.select(&kept))?;
        for (local_dep, local_head) in sub.into_iter().enumerate() {
            if let Some(local_head) = local_head {
                heads[kept[local_dep]] = Some(kept[local_head]);
            }
        }
        Ok(heads)
    }
}

/// Per-token argmax over candidate heads, without any tree guarantee.
///
/// Self loops and masked heads are never selected; the root gets `None`.
pub fn argmax_heads(scores: &ScoreMatrix, mask: &[bool]) -> Result<Vec<Option<usize>>> {
    check_mask(scores, mask)?;
    let n = scores.len();
    let mut heads = vec![None; n];
    let mut column = vec![f64::NEG_INFINITY; n];
    for dep in 1..n {
        if !mask[dep] {
            continue;
        }
        for (head, value) in column.iter_mut().enumerate() {
            *value = if head == dep || (head != 0 && !mask[head]) {
                f64::NEG_INFINITY
            } else {
                scores.get(head, dep)
            };
        }
        heads[dep] = argmax(&column);
    }
    Ok(heads)
}

fn check_mask(scores: &ScoreMatrix, mask: &[bool]) -> Result<()> {
    if mask.len() != scores.len() {
        return Err(KakariError::ShapeMismatch(format!(
            "mask of length {} for {} positions",
            mask.len(),
            scores.len()
        )));
    }
    Ok(())
}

/// Positions that survive the mask, root first.
///
/// A word whose every candidate head is `-inf` or masked cannot be attached;
/// it is dropped, which may in turn strand words that could only attach to it.
fn admissible_positions(scores: &ScoreMatrix, mask: &[bool]) -> Result<Vec<usize>> {
    check_mask(scores, mask)?;
    if scores.is_empty() {
        return Err(KakariError::EmptyInput);
    }
    let n = scores.len();
    let mut alive: Vec<bool> = (0..n).map(|i| i == 0 || mask[i]).collect();
    loop {
        let mut changed = false;
        for dep in 1..n {
            if !alive[dep] {
                continue;
            }
            let attachable = (0..n).any(|head| {
                head != dep && alive[head] && scores.get(head, dep) > f64::NEG_INFINITY
            });
            if !attachable {
                alive[dep] = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    Ok((0..n).filter(|&i| alive[i]).collect())
}
