//! # Decoded Trees
//!
//! Output of the decoders plus the structural checks that a well-formed
//! dependency tree has to pass.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Predicted heads and relations for one sentence, root at index 0.
///
/// The root and any position excluded by the mask carry `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecodedTree {
    pub heads: Vec<Option<usize>>,
    pub rels: Vec<Option<usize>>,
}

impl DecodedTree {
    /// An empty prediction over `len` positions.
    pub fn empty(len: usize) -> Self {
        Self {
            heads: vec![None; len],
            rels: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Runs every structural check at once.
    pub fn check(&self) -> Result<(), TreeViolation> {
        check_heads(&self.heads)
    }
}

/// Ways in which a head array can fail to be a projective tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeViolation {
    /// The root was given a head.
    RootHasHead,
    /// A head index is outside the sentence.
    HeadOutOfRange(usize),
    /// The number of tokens attached to the root is not one.
    RootChildren(usize),
    /// Following heads from this token never reaches the root.
    Cycle(usize),
    /// These two dependents have crossing arcs.
    Crossing(usize, usize),
}

impl fmt::Display for TreeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RootHasHead => write!(f, "root has a head"),
            Self::HeadOutOfRange(dep) => write!(f, "token {dep} has an out-of-range head"),
            Self::RootChildren(n) => write!(f, "root has {n} children"),
            Self::Cycle(dep) => write!(f, "token {dep} is on a cycle"),
            Self::Crossing(a, b) => write!(f, "arcs of tokens {a} and {b} cross"),
        }
    }
}

/// Checks that `heads` (root at 0, `None` for skipped positions) form a
/// single-rooted, acyclic, projective tree over the positions it covers.
pub fn check_heads(heads: &[Option<usize>]) -> Result<(), TreeViolation> {
    if heads.first().copied().flatten().is_some() {
        return Err(TreeViolation::RootHasHead);
    }
    let n = heads.len();
    for (dep, head) in heads.iter().enumerate().skip(1) {
        if let Some(h) = *head {
            if h >= n || h == dep || (h != 0 && heads[h].is_none()) {
                return Err(TreeViolation::HeadOutOfRange(dep));
            }
        }
    }
    let root_children = heads.iter().skip(1).filter(|h| **h == Some(0)).count();
    if n > 1 && heads.iter().skip(1).any(Option::is_some) && root_children != 1 {
        return Err(TreeViolation::RootChildren(root_children));
    }
    if let Some(dep) = find_cycle(heads) {
        return Err(TreeViolation::Cycle(dep));
    }
    if let Some((a, b)) = find_crossing(heads) {
        return Err(TreeViolation::Crossing(a, b));
    }
    Ok(())
}

/// First token whose head chain does not end at the root.
pub fn find_cycle(heads: &[Option<usize>]) -> Option<usize> {
    let n = heads.len();
    for start in 1..n {
        if heads[start].is_none() {
            continue;
        }
        let mut current = start;
        let mut steps = 0;
        while let Some(h) = heads[current] {
            if h == 0 {
                break;
            }
            current = h;
            steps += 1;
            if steps > n {
                return Some(start);
            }
        }
    }
    None
}

/// First pair of dependents whose arcs cross when drawn above the sentence.
pub fn find_crossing(heads: &[Option<usize>]) -> Option<(usize, usize)> {
    let arcs: Vec<(usize, usize, usize)> = heads
        .iter()
        .enumerate()
        .filter_map(|(dep, head)| head.map(|h| (dep, h.min(dep), h.max(dep))))
        .collect();
    for (i, &(dep_a, lo_a, hi_a)) in arcs.iter().enumerate() {
        for &(dep_b, lo_b, hi_b) in &arcs[i + 1..] {
            let crosses = (lo_a < lo_b && lo_b < hi_a && hi_a < hi_b)
                || (lo_b < lo_a && lo_a < hi_b && hi_b < hi_a);
            if crosses {
                return Some((dep_a, dep_b));
            }
        }
    }
    None
}
