//! # Outside Pass and Arc Marginals
//!
//! Explicit dual recursion to the inside pass. Outside values are pushed from
//! every item to its children in order of decreasing span width; an arc's
//! marginal is `exp(inside + outside - logZ)` of the incomplete item that
//! introduces it.

use crate::error::Result;
use crate::inference::chart::{Chart, Direction, Shape};
use crate::inference::inside::{InsideChart, inside};
use crate::inference::semiring::{LogSemiring, log_add};
use crate::types::ScoreMatrix;

/// Arc marginals of one sentence together with its `logZ`.
#[derive(Debug, Clone, PartialEq)]
pub struct Marginals {
    pub log_z: f64,
    /// `probs.get(head, dep)` is the probability of the arc `head -> dep`.
    pub probs: ScoreMatrix,
}

impl Marginals {
    /// Returns `true` when no tree is possible and every marginal is zero.
    pub fn is_degenerate(&self) -> bool {
        self.log_z == f64::NEG_INFINITY
    }
}

struct OutsideTable {
    n: usize,
    values: Vec<f64>,
}

impl OutsideTable {
    fn new(n: usize) -> Self {
        Self {
            n,
            values: vec![f64::NEG_INFINITY; 4 * n * n],
        }
    }

    #[inline]
    fn index(&self, shape: Shape, dir: Direction, s: usize, t: usize) -> usize {
        let table = match (shape, dir) {
            (Shape::Complete, Direction::Left) => 0,
            (Shape::Complete, Direction::Right) => 1,
            (Shape::Incomplete, Direction::Left) => 2,
            (Shape::Incomplete, Direction::Right) => 3,
        };
        (table * self.n + s) * self.n + t
    }

    #[inline]
    fn get(&self, shape: Shape, dir: Direction, s: usize, t: usize) -> f64 {
        self.values[self.index(shape, dir, s, t)]
    }

    #[inline]
    fn add(&mut self, shape: Shape, dir: Direction, s: usize, t: usize, value: f64) {
        let idx = self.index(shape, dir, s, t);
        self.values[idx] = log_add(self.values[idx], value);
    }
}

/// Arc marginals under the global softmax over projective trees.
pub fn marginals(scores: &ScoreMatrix) -> Result<Marginals> {
    let chart = inside(scores)?;
    Ok(marginals_from_chart(scores, &chart))
}

/// Arc marginals for trees agreeing with a partial annotation.
pub fn constrained_marginals(scores: &ScoreMatrix, heads: &[Option<usize>]) -> Result<Marginals> {
    marginals(&scores.constrained(heads)?)
}

pub(crate) fn marginals_from_chart(scores: &ScoreMatrix, chart: &InsideChart) -> Marginals {
    use Direction::{Left, Right};
    use Shape::{Complete, Incomplete};

    let n = scores.len();
    let log_z = chart.root_score();
    let mut probs = ScoreMatrix::filled(n, 0.0);
    if n < 2 || log_z == f64::NEG_INFINITY {
        return Marginals { log_z, probs };
    }

    let mut outside = OutsideTable::new(n);
    outside.add(Complete, Right, 0, n - 1, 0.0);

    for width in (1..n).rev() {
        // complete items hand outside mass to narrower items and to the
        // incomplete item of the same span, so they go first
        for s in 0..n - width {
            let t = s + width;

            let out = outside.get(Complete, Right, s, t);
            if out > f64::NEG_INFINITY && !Chart::<LogSemiring>::root_blocked(n, s, t) {
                for r in s + 1..=t {
                    outside.add(Incomplete, Right, s, r, out + chart.score(Complete, Right, r, t));
                    outside.add(Complete, Right, r, t, out + chart.score(Incomplete, Right, s, r));
                }
            }

            let out = outside.get(Complete, Left, s, t);
            if out > f64::NEG_INFINITY {
                for r in s..t {
                    outside.add(Complete, Left, s, r, out + chart.score(Incomplete, Left, r, t));
                    outside.add(Incomplete, Left, r, t, out + chart.score(Complete, Left, s, r));
                }
            }
        }

        for s in 0..n - width {
            let t = s + width;
            for (dir, arc) in [(Right, scores.get(s, t)), (Left, scores.get(t, s))] {
                let out = outside.get(Incomplete, dir, s, t);
                if out == f64::NEG_INFINITY {
                    continue;
                }
                let marginal = (chart.score(Incomplete, dir, s, t) + out - log_z).exp();
                match dir {
                    Right => probs.set(s, t, marginal),
                    Left => probs.set(t, s, marginal),
                }
                let out = out + arc;
                for r in s..t {
                    outside.add(Complete, Right, s, r, out + chart.score(Complete, Left, r + 1, t));
                    outside.add(Complete, Left, r + 1, t, out + chart.score(Complete, Right, s, r));
                }
            }
        }
    }

    Marginals { log_z, probs }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_sum(m: &Marginals, dep: usize) -> f64 {
        m.probs.column(dep).sum()
    }

    #[test]
    fn uniform_two_word_marginals() {
        // trees: 0->1->2 and 0->2->1, equally likely
        let m = marginals(&ScoreMatrix::filled(3, 0.0)).unwrap();
        assert!((m.probs.get(0, 1) - 0.5).abs() < 1e-9);
        assert!((m.probs.get(2, 1) - 0.5).abs() < 1e-9);
        assert!((m.probs.get(0, 2) - 0.5).abs() < 1e-9);
        assert!((m.probs.get(1, 2) - 0.5).abs() < 1e-9);
        assert_eq!(m.probs.get(1, 0), 0.0);
    }

    #[test]
    fn columns_sum_to_one() {
        let scores = ScoreMatrix::from_fn(6, |h, d| ((h * 7 + d * 3) % 5) as f64 - 2.0);
        let m = marginals(&scores).unwrap();
        for dep in 1..6 {
            assert!((column_sum(&m, dep) - 1.0).abs() < 1e-9, "dep {dep}");
        }
        assert_eq!(column_sum(&m, 0), 0.0);
    }

    #[test]
    fn root_has_exactly_one_expected_child() {
        let scores = ScoreMatrix::from_fn(5, |h, d| (h as f64 - d as f64).sin());
        let m = marginals(&scores).unwrap();
        let expected_children: f64 = (1..5).map(|d| m.probs.get(0, d)).sum();
        assert!((expected_children - 1.0).abs() < 1e-9);
    }

    #[test]
    fn forced_arc_has_probability_one() {
        let scores = ScoreMatrix::filled(4, 0.0);
        let m = constrained_marginals(&scores, &[None, None, Some(3), None]).unwrap();
        assert!((m.probs.get(3, 2) - 1.0).abs() < 1e-9);
        assert!(m.probs.get(1, 2).abs() < 1e-12);
    }

    #[test]
    fn degenerate_scores_give_zero_marginals() {
        let m = marginals(&ScoreMatrix::filled(3, f64::NEG_INFINITY)).unwrap();
        assert!(m.is_degenerate());
        assert!(m.probs.as_slice().iter().all(|p| *p == 0.0));
    }

    #[test]
    fn marginal_argmax_follows_dominant_arcs() {
        use crate::inference::{argmax_heads, word_mask};

        let mut scores = ScoreMatrix::filled(4, -10.0);
        scores.set(0, 2, 5.0);
        scores.set(2, 1, 5.0);
        scores.set(2, 3, 5.0);
        let m = marginals(&scores).unwrap();
        let heads = argmax_heads(&m.probs, &word_mask(4)).unwrap();
        assert_eq!(heads, vec![None, Some(2), Some(0), Some(2)]);
    }
}
