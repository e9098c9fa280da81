use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-8;

/// Unlabeled and labeled attachment counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub total: usize,
    pub correct_arcs: usize,
    pub correct_rels: usize,
}

impl Metric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one scored token.
    pub fn record(
        &mut self,
        pred_head: Option<usize>,
        pred_rel: Option<usize>,
        gold_head: usize,
        gold_rel: Option<usize>,
    ) {
        self.total += 1;
        if pred_head == Some(gold_head) {
            self.correct_arcs += 1;
            if pred_rel.is_some() && pred_rel == gold_rel {
                self.correct_rels += 1;
            }
        }
    }

    /// Unlabeled attachment score in `[0, 1]`.
    pub fn uas(&self) -> f64 {
        self.correct_arcs as f64 / (self.total as f64 + EPS)
    }

    /// Labeled attachment score in `[0, 1]`.
    pub fn las(&self) -> f64 {
        self.correct_rels as f64 / (self.total as f64 + EPS)
    }

    /// Model selection score.
    pub fn score(&self) -> f64 {
        self.las()
    }
}

impl AddAssign for Metric {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.correct_arcs += other.correct_arcs;
        self.correct_rels += other.correct_rels;
    }
}

impl Add for Metric {
    type Output = Metric;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl PartialOrd for Metric {
    /// LAS first, UAS to break ties.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.las().partial_cmp(&other.las())? {
            Ordering::Equal => self.uas().partial_cmp(&other.uas()),
            ord => Some(ord),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UAS: {:6.2}% LAS: {:6.2}%",
            self.uas() * 100.0,
            self.las() * 100.0
        )
    }
}
