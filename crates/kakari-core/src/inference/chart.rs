//! # Span Chart
//!
//! Index-addressed table of Eisner items `(shape, direction, start, end)`.
//! Every cell stores its semiring value next to the split point of its best
//! term, so the same arena serves decoding (max semiring) and the inside pass
//! (log semiring).
//!
//! Item semantics for a span `[s, t]`:
//! - complete right: subtree headed at `s` covering `[s, t]`
//! - complete left: subtree headed at `t` covering `[s, t]`
//! - incomplete right: arc `s -> t` plus both halves between them
//! - incomplete left: arc `t -> s` plus both halves between them
//!
//! The root (position 0) may take a single dependent: complete right items
//! starting at 0 are only allowed over the full sentence.

use std::marker::PhantomData;

use crate::inference::semiring::Semiring;
use crate::types::ScoreMatrix;

/// Whether an item still waits for its span to be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Complete,
    Incomplete,
}

/// Side of the span holding the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Head at the right end (`t`).
    Left,
    /// Head at the left end (`s`).
    Right,
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    score: f64,
    split: u32,
}

/// Filled Eisner chart for one sentence.
#[derive(Debug, Clone)]
pub struct Chart<S> {
    n: usize,
    cells: Vec<Cell>,
    _semiring: PhantomData<S>,
}

#[inline]
fn slot(n: usize, shape: Shape, dir: Direction, s: usize, t: usize) -> usize {
    let table = match (shape, dir) {
        (Shape::Complete, Direction::Left) => 0,
        (Shape::Complete, Direction::Right) => 1,
        (Shape::Incomplete, Direction::Left) => 2,
        (Shape::Incomplete, Direction::Right) => 3,
    };
    (table * n + s) * n + t
}

/// Running semiring sum that remembers the split of its best term.
struct Accumulator<S> {
    value: f64,
    best: f64,
    split: usize,
    _semiring: PhantomData<S>,
}

impl<S: Semiring> Accumulator<S> {
    fn new(first_split: usize) -> Self {
        Self {
            value: S::ZERO,
            best: f64::NEG_INFINITY,
            split: first_split,
            _semiring: PhantomData,
        }
    }

    #[inline]
    fn push(&mut self, term: f64, split: usize) {
        self.value = S::plus(self.value, term);
        if term > self.best {
            self.best = term;
            self.split = split;
        }
    }
}

impl<S: Semiring> Chart<S> {
    /// Fill the chart bottom-up by increasing span width.
    pub fn fill(scores: &ScoreMatrix) -> Self {
        let n = scores.len();
        let mut chart = Self {
            n,
            cells: vec![
                Cell {
                    score: S::ZERO,
                    split: 0,
                };
                4 * n * n
            ],
            _semiring: PhantomData,
        };
        for s in 0..n {
            chart.set(Shape::Complete, Direction::Left, s, s, S::ONE, s);
            chart.set(Shape::Complete, Direction::Right, s, s, S::ONE, s);
        }

        for width in 1..n {
            for s in 0..n - width {
                let t = s + width;

                // both incomplete items share the sum over their two halves
                let mut halves = Accumulator::<S>::new(s);
                for r in s..t {
                    halves.push(
                        chart.score(Shape::Complete, Direction::Right, s, r)
                            + chart.score(Shape::Complete, Direction::Left, r + 1, t),
                        r,
                    );
                }
                chart.set(
                    Shape::Incomplete,
                    Direction::Right,
                    s,
                    t,
                    halves.value + scores.get(s, t),
                    halves.split,
                );
                chart.set(
                    Shape::Incomplete,
                    Direction::Left,
                    s,
                    t,
                    halves.value + scores.get(t, s),
                    halves.split,
                );

                let mut left = Accumulator::<S>::new(s);
                for r in s..t {
                    left.push(
                        chart.score(Shape::Complete, Direction::Left, s, r)
                            + chart.score(Shape::Incomplete, Direction::Left, r, t),
                        r,
                    );
                }
                chart.set(
                    Shape::Complete,
                    Direction::Left,
                    s,
                    t,
                    left.value,
                    left.split,
                );

                let mut right = Accumulator::<S>::new(s + 1);
                if !Self::root_blocked(n, s, t) {
                    for r in s + 1..=t {
                        right.push(
                            chart.score(Shape::Incomplete, Direction::Right, s, r)
                                + chart.score(Shape::Complete, Direction::Right, r, t),
                            r,
                        );
                    }
                }
                chart.set(
                    Shape::Complete,
                    Direction::Right,
                    s,
                    t,
                    right.value,
                    right.split,
                );
            }
        }
        chart
    }

    /// Complete right items from the root over a partial span would give the
    /// root more than one dependent.
    #[inline]
    pub(crate) fn root_blocked(n: usize, s: usize, t: usize) -> bool {
        s == 0 && t + 1 != n
    }

    /// Number of positions, root included.
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    pub fn score(&self, shape: Shape, dir: Direction, s: usize, t: usize) -> f64 {
        self.cells[slot(self.n, shape, dir, s, t)].score
    }

    #[inline]
    pub fn split(&self, shape: Shape, dir: Direction, s: usize, t: usize) -> usize {
        self.cells[slot(self.n, shape, dir, s, t)].split as usize
    }

    #[inline]
    fn set(&mut self, shape: Shape, dir: Direction, s: usize, t: usize, score: f64, split: usize) {
        let idx = slot(self.n, shape, dir, s, t);
        self.cells[idx] = Cell {
            score,
            split: split as u32,
        };
    }

    /// Value of the whole sentence: best tree score or `logZ`.
    pub fn root_score(&self) -> f64 {
        if self.n == 0 {
            return S::ZERO;
        }
        self.score(Shape::Complete, Direction::Right, 0, self.n - 1)
    }

    /// Walk the backpointers from the root item and collect heads.
    ///
    /// Always yields in-range heads, even if every tree scored `-inf`.
    pub fn backtrack(&self) -> Vec<Option<usize>> {
        let mut heads = vec![None; self.n];
        if self.n < 2 {
            return heads;
        }
        let mut stack = vec![(Shape::Complete, Direction::Right, 0, self.n - 1)];
        while let Some((shape, dir, s, t)) = stack.pop() {
            if s == t {
                continue;
            }
            let r = self.split(shape, dir, s, t);
            match (shape, dir) {
                (Shape::Complete, Direction::Right) => {
                    stack.push((Shape::Incomplete, Direction::Right, s, r));
                    stack.push((Shape::Complete, Direction::Right, r, t));
                }
                (Shape::Complete, Direction::Left) => {
                    stack.push((Shape::Complete, Direction::Left, s, r));
                    stack.push((Shape::Incomplete, Direction::Left, r, t));
                }
                (Shape::Incomplete, dir) => {
                    if dir == Direction::Right {
                        heads[t] = Some(s);
                    } else {
                        heads[s] = Some(t);
                    }
                    stack.push((Shape::Complete, Direction::Right, s, r));
                    stack.push((Shape::Complete, Direction::Left, r + 1, t));
                }
            }
        }
        heads
    }
}
