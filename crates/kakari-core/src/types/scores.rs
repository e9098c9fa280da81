//! # Score Tables
//!
//! Dense per-sentence arc and relation scores. Both are head-major:
//! `arcs.get(head, dep)` is the score of `head` governing `dep`.

use crate::error::{KakariError, Result};

/// Square matrix of arc scores for one sentence (root at index 0).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMatrix {
    n: usize,
    data: Vec<f64>,
}

impl ScoreMatrix {
    /// Create an `n x n` matrix filled with `value`.
    pub fn filled(n: usize, value: f64) -> Self {
        Self {
            n,
            data: vec![value; n * n],
        }
    }

    /// Build a matrix from `f(head, dep)`.
    pub fn from_fn(n: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(n * n);
        for head in 0..n {
            for dep in 0..n {
                data.push(f(head, dep));
            }
        }
        Self { n, data }
    }

    /// Build a matrix from rows indexed by head.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let n = rows.len();
        if let Some(bad) = rows.iter().find(|row| row.len() != n) {
            return Err(KakariError::ShapeMismatch(format!(
                "arc score row of length {} in a {n}x{n} matrix",
                bad.len()
            )));
        }
        Ok(Self {
            n,
            data: rows.iter().flatten().copied().collect(),
        })
    }

    /// Number of positions, root included.
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    pub fn get(&self, head: usize, dep: usize) -> f64 {
        self.data[head * self.n + dep]
    }

    #[inline]
    pub fn set(&mut self, head: usize, dep: usize, value: f64) {
        self.data[head * self.n + dep] = value;
    }

    /// Scores of every candidate head for `dep`.
    pub fn column(&self, dep: usize) -> impl Iterator<Item = f64> + '_ {
        (0..self.n).map(move |head| self.get(head, dep))
    }

    /// Keep only `positions` (in order), renumbering them `0..positions.len()`.
    pub fn select(&self, positions: &[usize]) -> Self {
        Self::from_fn(positions.len(), |h, d| self.get(positions[h], positions[d]))
    }

    /// Restrict the matrix to arcs compatible with a partial gold tree.
    ///
    /// Tokens with a known head keep only that incoming arc; every other
    /// candidate head gets `-inf`. Unannotated tokens are left untouched.
    pub fn constrained(&self, heads: &[Option<usize>]) -> Result<Self> {
        if heads.len() != self.n {
            return Err(KakariError::ShapeMismatch(format!(
                "{} gold heads for a sentence of length {}",
                heads.len(),
                self.n
            )));
        }
        let mut out = self.clone();
        for (dep, head) in heads.iter().enumerate().skip(1) {
            let Some(head) = *head else { continue };
            if head >= self.n {
                return Err(KakariError::InvalidHead {
                    dependent: dep,
                    head: head as i64,
                    len: self.n,
                });
            }
            for other in 0..self.n {
                if other != head {
                    out.set(other, dep, f64::NEG_INFINITY);
                }
            }
        }
        Ok(out)
    }

    /// Per-dependent softmax over candidate heads.
    pub fn softmax_heads(&self) -> Self {
        let mut out = Self::filled(self.n, 0.0);
        for dep in 0..self.n {
            let max = self.column(dep).fold(f64::NEG_INFINITY, f64::max);
            if max == f64::NEG_INFINITY {
                continue;
            }
            let total: f64 = self.column(dep).map(|s| (s - max).exp()).sum();
            for head in 0..self.n {
                out.set(head, dep, (self.get(head, dep) - max).exp() / total);
            }
        }
        out
    }

    /// Raw storage, row `head`, column `dep`.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

/// Relation-label scores for every (head, dependent) pair of one sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct RelScores {
    n: usize,
    labels: usize,
    data: Vec<f64>,
}

impl RelScores {
    pub fn filled(n: usize, labels: usize, value: f64) -> Self {
        Self {
            n,
            labels,
            data: vec![value; n * n * labels],
        }
    }

    /// Wrap flat `[head][dep][label]` storage.
    pub fn from_flat(n: usize, labels: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n * n * labels {
            return Err(KakariError::ShapeMismatch(format!(
                "{} relation scores for {n}x{n}x{labels}",
                data.len()
            )));
        }
        Ok(Self { n, labels, data })
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Size of the relation vocabulary these scores are over.
    pub fn num_labels(&self) -> usize {
        self.labels
    }

    /// Label scores for the arc `head -> dep`.
    #[inline]
    pub fn labels_for(&self, head: usize, dep: usize) -> &[f64] {
        let start = (head * self.n + dep) * self.labels;
        &self.data[start..start + self.labels]
    }

    #[inline]
    pub fn set(&mut self, head: usize, dep: usize, label: usize, value: f64) {
        self.data[(head * self.n + dep) * self.labels + label] = value;
    }

    /// Highest scoring label for `head -> dep`, lowest index on ties.
    pub fn best_label(&self, head: usize, dep: usize) -> Option<usize> {
        argmax(self.labels_for(head, dep))
    }

    /// Keep only `positions`, renumbering them like [`ScoreMatrix::select`].
    pub fn select(&self, positions: &[usize]) -> Self {
        let n = positions.len();
        let mut data = Vec::with_capacity(n * n * self.labels);
        for &head in positions {
            for &dep in positions {
                data.extend_from_slice(self.labels_for(head, dep));
            }
        }
        Self {
            n,
            labels: self.labels,
            data,
        }
    }
}

/// Scores for one unpadded sentence, as handed out of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceScores {
    pub arcs: ScoreMatrix,
    pub rels: RelScores,
}

impl SentenceScores {
    pub fn new(arcs: ScoreMatrix, rels: RelScores) -> Result<Self> {
        if arcs.len() != rels.len() {
            return Err(KakariError::ShapeMismatch(format!(
                "arc scores cover {} tokens, relation scores {}",
                arcs.len(),
                rels.len()
            )));
        }
        Ok(Self { arcs, rels })
    }

    pub fn len(&self) -> usize {
        self.arcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arcs.is_empty()
    }
}

/// Index of the largest non-NaN value, first one on ties.
pub(crate) fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if value <= b => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rows_rejects_ragged_input() {
        let rows = vec![vec![0.0, 1.0], vec![0.0]];
        assert!(ScoreMatrix::from_rows(&rows).is_err());
    }

    #[test]
    fn constrained_keeps_only_gold_head() {
        let scores = ScoreMatrix::filled(3, 1.0);
        let out = scores.constrained(&[None, Some(2), None]).unwrap();
        assert_eq!(out.get(2, 1), 1.0);
        assert_eq!(out.get(0, 1), f64::NEG_INFINITY);
        assert_eq!(out.get(1, 2), 1.0);
    }

    #[test]
    fn constrained_rejects_out_of_range_head() {
        let scores = ScoreMatrix::filled(3, 0.0);
        let err = scores.constrained(&[None, Some(7), None]).unwrap_err();
        assert!(matches!(err, KakariError::InvalidHead { dependent: 1, .. }));
    }

    #[test]
    fn softmax_columns_sum_to_one() {
        let scores = ScoreMatrix::from_fn(4, |h, d| (h * 3 + d) as f64 * 0.5);
        let probs = scores.softmax_heads();
        for dep in 0..4 {
            let total: f64 = probs.column(dep).sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn select_renumbers_positions() {
        let scores = ScoreMatrix::from_fn(4, |h, d| (h * 10 + d) as f64);
        let sub = scores.select(&[0, 2, 3]);
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.get(1, 2), 23.0);
    }

    #[test]
    fn best_label_prefers_lowest_index_on_ties() {
        let mut rels = RelScores::filled(2, 3, 0.0);
        rels.set(0, 1, 1, 2.0);
        rels.set(0, 1, 2, 2.0);
        assert_eq!(rels.best_label(0, 1), Some(1));
    }

    #[test]
    fn argmax_skips_nan() {
        assert_eq!(argmax(&[f64::NAN, 1.0, 0.5]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
