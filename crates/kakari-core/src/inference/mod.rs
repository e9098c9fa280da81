//! # Tree Inference
//!
//! Decoding and partition-function machinery shared by training and
//! prediction. Everything here works on one unpadded sentence at a time; the
//! batch orchestrator loops over sentences.

pub mod chart;
pub mod eisner;
pub mod inside;
pub mod outside;
pub mod semiring;

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{KakariError, Result};
use crate::types::{DecodedTree, RelScores, ScoreMatrix, SentenceScores};

pub use chart::{Chart, Direction, Shape};
pub use eisner::{EisnerDecoder, argmax_heads};
pub use inside::{constrained_log_partition, inside, log_partition};
pub use outside::{Marginals, constrained_marginals, marginals};
pub use semiring::{LogSemiring, MaxSemiring, Semiring, log_add, log_sum_exp};

/// Configuration for turning scores into trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Force a projective tree with the Eisner decoder instead of per-token argmax.
    pub tree: bool,
    /// Decode from CRF arc marginals instead of the scorer's arc scores.
    pub marg: bool,
}

impl DecodeConfig {
    /// Create a new decode configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable tree decoding.
    pub fn with_tree(mut self, tree: bool) -> Self {
        self.tree = tree;
        self
    }

    /// Enable or disable marginal decoding.
    pub fn with_marg(mut self, marg: bool) -> Self {
        self.marg = marg;
        self
    }
}

/// Which arc matrix the decoder should search over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcView {
    /// Scores exactly as produced by the scorer.
    Raw,
    /// Per-dependent softmax over candidate heads.
    HeadSoftmax,
    /// Tree-CRF arc marginals.
    Marginal,
}

/// Turns sentence scores into heads and relation labels.
#[derive(Debug, Clone, Default)]
pub struct TreeDecoder {
    config: DecodeConfig,
    eisner: EisnerDecoder,
}

impl TreeDecoder {
    pub fn new(config: DecodeConfig) -> Self {
        Self {
            config,
            eisner: EisnerDecoder::new(),
        }
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    /// The arc view a caller gets when it has no preference of its own.
    pub fn default_view(&self, fallback: ArcView) -> ArcView {
        if self.config.marg {
            ArcView::Marginal
        } else {
            fallback
        }
    }

    /// Materialize the requested arc view, reusing `cached` marginals if given.
    pub fn arc_view<'a>(
        &self,
        scores: &'a ScoreMatrix,
        view: ArcView,
        cached: Option<&'a Marginals>,
    ) -> Result<Cow<'a, ScoreMatrix>> {
        Ok(match view {
            ArcView::Raw => Cow::Borrowed(scores),
            ArcView::HeadSoftmax => Cow::Owned(scores.softmax_heads()),
            ArcView::Marginal => match cached {
                Some(m) => Cow::Borrowed(&m.probs),
                None => Cow::Owned(marginals(scores)?.probs),
            },
        })
    }

    /// Heads for `arcs` under `mask`.
    ///
    /// In tree mode a sentence that admits no finite tree falls back to the
    /// per-token argmax so that every unmasked word still gets a head.
    pub fn heads(&self, arcs: &ScoreMatrix, mask: &[bool]) -> Result<Vec<Option<usize>>> {
        if !self.config.tree {
            return argmax_heads(arcs, mask);
        }
        match self.eisner.decode_masked(arcs, mask) {
            Err(KakariError::DegenerateScores) => {
                warn!(len = arcs.len(), "no finite projective tree, using argmax heads");
                argmax_heads(arcs, mask)
            }
            other => other,
        }
    }

    /// Full decode: heads from the chosen arc view, then the best relation of
    /// every selected arc.
    pub fn decode(
        &self,
        scores: &SentenceScores,
        mask: &[bool],
        view: ArcView,
        cached: Option<&Marginals>,
    ) -> Result<DecodedTree> {
        let arcs = self.arc_view(&scores.arcs, view, cached)?;
        let heads = self.heads(&arcs, mask)?;
        let rels = attach_relations(&heads, &scores.rels);
        Ok(DecodedTree { heads, rels })
    }
}

/// Best relation label for every selected arc.
pub fn attach_relations(heads: &[Option<usize>], rels: &RelScores) -> Vec<Option<usize>> {
    heads
        .iter()
        .enumerate()
        .map(|(dep, head)| head.and_then(|h| rels.best_label(h, dep)))
        .collect()
}

/// Mask over an unpadded sentence: every word, never the root.
pub fn word_mask(len: usize) -> Vec<bool> {
    (0..len).map(|i| i > 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_scores() -> SentenceScores {
        let mut arcs = ScoreMatrix::filled(4, -10.0);
        arcs.set(0, 1, 5.0);
        arcs.set(1, 2, 5.0);
        arcs.set(2, 3, 5.0);
        let mut rels = RelScores::filled(4, 2, 0.0);
        rels.set(0, 1, 1, 1.0);
        rels.set(1, 2, 0, 1.0);
        rels.set(2, 3, 1, 1.0);
        SentenceScores::new(arcs, rels).unwrap()
    }

    #[test]
    fn test_decode_config_builder() {
        let config = DecodeConfig::new().with_tree(true).with_marg(true);
        assert!(config.tree);
        assert!(config.marg);
        assert_eq!(DecodeConfig::default(), DecodeConfig { tree: false, marg: false });
    }

    #[test]
    fn test_tree_decode_with_relations() {
        let decoder = TreeDecoder::new(DecodeConfig::new().with_tree(true));
        let tree = decoder
            .decode(&chain_scores(), &word_mask(4), ArcView::Raw, None)
            .unwrap();
        assert_eq!(tree.heads, vec![None, Some(0), Some(1), Some(2)]);
        assert_eq!(tree.rels, vec![None, Some(1), Some(0), Some(1)]);
    }

    #[test]
    fn test_every_view_agrees_on_clear_winner() {
        let decoder = TreeDecoder::new(DecodeConfig::new().with_tree(true));
        let scores = chain_scores();
        for view in [ArcView::Raw, ArcView::HeadSoftmax, ArcView::Marginal] {
            let tree = decoder.decode(&scores, &word_mask(4), view, None).unwrap();
            assert_eq!(tree.heads, vec![None, Some(0), Some(1), Some(2)], "{view:?}");
        }
    }

    #[test]
    fn test_degenerate_tree_falls_back_to_argmax() {
        let mut arcs = ScoreMatrix::filled(3, f64::NEG_INFINITY);
        arcs.set(2, 1, 0.0);
        arcs.set(1, 2, 0.0);
        let decoder = TreeDecoder::new(DecodeConfig::new().with_tree(true));
        let heads = decoder.heads(&arcs, &word_mask(3)).unwrap();
        assert_eq!(heads, vec![None, Some(2), Some(1)]);
    }

    #[test]
    fn test_default_view_honours_marg() {
        let plain = TreeDecoder::new(DecodeConfig::new());
        assert_eq!(plain.default_view(ArcView::Raw), ArcView::Raw);
        let marg = TreeDecoder::new(DecodeConfig::new().with_marg(true));
        assert_eq!(marg.default_view(ArcView::Raw), ArcView::Marginal);
    }
}
