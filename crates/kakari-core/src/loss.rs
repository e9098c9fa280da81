//! # Loss Assembly
//!
//! Pointwise cross-entropy or tree-CRF negative log-likelihood over a batch
//! that may mix sentences from several tasks. Alongside the scalar losses the
//! assembler hands back gradients with respect to the scores, so any scorer
//! can back-propagate them without differentiating through the charts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{KakariError, Result};
use crate::inference::outside::{Marginals, constrained_marginals, marginals};
use crate::inference::semiring::log_sum_exp;
use crate::types::{GoldTree, RelScores, ScoreMatrix, SentenceScores};

/// How arc scores are turned into a training signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossMode {
    /// Independent per-token cross-entropy, no tree constraint.
    Pointwise,
    /// Global softmax over projective trees.
    ///
    /// With `partial`, sentences with unannotated heads are trained towards
    /// every tree consistent with the annotated arcs; without it they are
    /// left out of the arc loss.
    Structured { partial: bool },
}

impl LossMode {
    pub fn from_flags(crf: bool, partial: bool) -> Self {
        if crf {
            LossMode::Structured { partial }
        } else {
            LossMode::Pointwise
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, LossMode::Structured { .. })
    }
}

/// Batch positions grouped by task id, built once per batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskArena {
    groups: BTreeMap<usize, Vec<usize>>,
}

impl TaskArena {
    /// Partition batch positions by the task id of each sentence.
    pub fn partition(tasks: &[usize]) -> Self {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, &task) in tasks.iter().enumerate() {
            groups.entry(task).or_default().push(idx);
        }
        Self { groups }
    }

    /// `(task, batch positions)` in ascending task order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize])> {
        self.groups.iter().map(|(task, idx)| (*task, idx.as_slice()))
    }

    pub fn tasks(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups.keys().copied()
    }

    pub fn positions(&self, task: usize) -> Option<&[usize]> {
        self.groups.get(&task).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Loss terms of one sentence before normalization.
#[derive(Debug, Clone)]
pub struct SentenceLoss {
    /// Summed arc loss (NLL of the gold tree in structured mode).
    pub arc: f64,
    /// Summed relation cross-entropy over annotated tokens.
    pub rel: f64,
    /// Words whose arc term entered the loss; zero when `skipped`.
    pub tokens: usize,
    /// Whether the arc term was dropped (degenerate or unusable annotation).
    pub skipped: bool,
    /// d(arc) / d(arc scores), if requested.
    pub arc_grad: Option<ScoreMatrix>,
    /// d(rel) / d(relation scores), if requested.
    pub rel_grad: Option<RelScores>,
    /// Unconstrained arc marginals (structured mode only).
    pub marginals: Option<Marginals>,
}

/// Aggregated losses of a batch, merged across task partitions.
#[derive(Debug, Clone, Default)]
pub struct BatchLoss {
    pub arc_sum: f64,
    pub rel_sum: f64,
    pub tokens: usize,
    pub sentences: usize,
    pub skipped: usize,
    /// Per-sentence results, in batch order.
    pub per_sentence: Vec<Option<SentenceLoss>>,
}

impl BatchLoss {
    /// Arc loss per token plus relation loss per sentence.
    pub fn total(&self) -> f64 {
        let arc = if self.tokens > 0 {
            self.arc_sum / self.tokens as f64
        } else {
            0.0
        };
        let rel = if self.sentences > 0 {
            self.rel_sum / self.sentences as f64
        } else {
            0.0
        };
        arc + rel
    }

    /// Factor the per-sentence arc gradients must be multiplied by.
    pub fn arc_scale(&self) -> f64 {
        if self.tokens > 0 {
            1.0 / self.tokens as f64
        } else {
            0.0
        }
    }

    /// Factor the per-sentence relation gradients must be multiplied by.
    pub fn rel_scale(&self) -> f64 {
        if self.sentences > 0 {
            1.0 / self.sentences as f64
        } else {
            0.0
        }
    }
}

/// Computes losses (and optionally score gradients) for sentences and batches.
#[derive(Debug, Clone, Copy)]
pub struct LossAssembler {
    mode: LossMode,
    gradients: bool,
}

impl LossAssembler {
    pub fn new(mode: LossMode) -> Self {
        Self {
            mode,
            gradients: false,
        }
    }

    /// Also produce gradients with respect to the scores.
    pub fn with_gradients(mut self, enabled: bool) -> Self {
        self.gradients = enabled;
        self
    }

    pub fn mode(&self) -> LossMode {
        self.mode
    }

    /// Loss of one unpadded sentence.
    pub fn sentence(&self, scores: &SentenceScores, gold: &GoldTree) -> Result<SentenceLoss> {
        if gold.len() != scores.len() {
            return Err(KakariError::ShapeMismatch(format!(
                "gold tree over {} positions, scores over {}",
                gold.len(),
                scores.len()
            )));
        }
        let (rel, rel_grad) = self.relation_loss(&scores.rels, gold)?;
        let mut out = SentenceLoss {
            arc: 0.0,
            rel,
            tokens: 0,
            skipped: false,
            arc_grad: None,
            rel_grad,
            marginals: None,
        };
        match self.mode {
            LossMode::Pointwise => {
                let (arc, tokens, grad) = self.pointwise_arc_loss(&scores.arcs, gold)?;
                out.arc = arc;
                out.tokens = tokens;
                out.skipped = tokens == 0;
                out.arc_grad = grad;
            }
            LossMode::Structured { partial } => {
                self.structured_arc_loss(&scores.arcs, gold, partial, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Loss of a whole batch.
    ///
    /// `scores[i]` and `golds[i]` describe batch position `i`; the arena
    /// decides which positions belong to which task.
    pub fn batch(
        &self,
        arena: &TaskArena,
        scores: &[SentenceScores],
        golds: &[GoldTree],
    ) -> Result<BatchLoss> {
        if scores.len() != golds.len() {
            return Err(KakariError::ShapeMismatch(format!(
                "{} score tables for {} gold trees",
                scores.len(),
                golds.len()
            )));
        }
        let mut total = BatchLoss {
            per_sentence: vec![None; scores.len()],
            ..BatchLoss::default()
        };
        for (task, positions) in arena.iter() {
            let mut arc_sum = 0.0;
            let mut rel_sum = 0.0;
            for &idx in positions {
                let (Some(sentence_scores), Some(gold)) = (scores.get(idx), golds.get(idx)) else {
                    return Err(KakariError::ShapeMismatch(format!(
                        "task {task} refers to batch position {idx} of {}",
                        scores.len()
                    )));
                };
                let loss = self.sentence(sentence_scores, gold)?;
                arc_sum += loss.arc;
                rel_sum += loss.rel;
                total.tokens += loss.tokens;
                total.sentences += 1;
                if loss.skipped {
                    total.skipped += 1;
                }
                total.per_sentence[idx] = Some(loss);
            }
            debug!(task, sentences = positions.len(), arc_sum, rel_sum, "task loss");
            total.arc_sum += arc_sum;
            total.rel_sum += rel_sum;
        }
        Ok(total)
    }

    fn pointwise_arc_loss(
        &self,
        arcs: &ScoreMatrix,
        gold: &GoldTree,
    ) -> Result<(f64, usize, Option<ScoreMatrix>)> {
        let n = arcs.len();
        let mut loss = 0.0;
        let mut tokens = 0;
        let mut grad = self.gradients.then(|| ScoreMatrix::filled(n, 0.0));
        for (dep, head) in gold.annotated() {
            check_head(dep, head, n)?;
            let column: Vec<f64> = arcs.column(dep).collect();
            let log_norm = log_sum_exp(&column);
            let term = log_norm - column[head];
            if !term.is_finite() {
                warn!(dep, head, "non-finite arc cross-entropy, token skipped");
                continue;
            }
            loss += term;
            tokens += 1;
            if let Some(grad) = grad.as_mut() {
                for (h, score) in column.iter().enumerate() {
                    let p = (score - log_norm).exp();
                    grad.set(h, dep, if h == head { p - 1.0 } else { p });
                }
            }
        }
        Ok((loss, tokens, grad))
    }

    fn structured_arc_loss(
        &self,
        arcs: &ScoreMatrix,
        gold: &GoldTree,
        partial: bool,
        out: &mut SentenceLoss,
    ) -> Result<()> {
        let all = marginals(arcs)?;
        if !gold.is_complete() && !partial {
            debug!("partially annotated sentence left out of the arc loss");
            out.skipped = true;
            out.marginals = Some(all);
            return Ok(());
        }
        let n = arcs.len();
        // A complete tree is scored directly, so non-projective gold trees
        // still train. Partial trees marginalize over the missing heads.
        let (gold_score, restricted) = if gold.is_complete() {
            let mut score = 0.0;
            for (dep, head) in gold.annotated() {
                check_head(dep, head, n)?;
                score += arcs.get(head, dep);
            }
            (score, None)
        } else {
            let restricted = constrained_marginals(arcs, &gold.heads)?;
            (restricted.log_z, Some(restricted))
        };
        let loss = all.log_z - gold_score;
        if !loss.is_finite() {
            warn!(
                log_z = all.log_z,
                gold = gold_score,
                "degenerate tree distribution, sentence skipped"
            );
            out.skipped = true;
            out.marginals = Some(all);
            return Ok(());
        }
        out.arc = loss;
        out.tokens = n.saturating_sub(1);
        if self.gradients {
            out.arc_grad = Some(match &restricted {
                Some(restricted) => ScoreMatrix::from_fn(n, |h, d| {
                    all.probs.get(h, d) - restricted.probs.get(h, d)
                }),
                None => ScoreMatrix::from_fn(n, |h, d| {
                    let gold_arc = gold.heads.get(d).copied().flatten() == Some(h);
                    all.probs.get(h, d) - if gold_arc { 1.0 } else { 0.0 }
                }),
            });
        }
        out.marginals = Some(all);
        Ok(())
    }

    fn relation_loss(&self, rels: &RelScores, gold: &GoldTree) -> Result<(f64, Option<RelScores>)> {
        let n = rels.len();
        let labels = rels.num_labels();
        let mut loss = 0.0;
        let mut grad = self.gradients.then(|| RelScores::filled(n, labels, 0.0));
        for (dep, head) in gold.annotated() {
            check_head(dep, head, n)?;
            let Some(rel) = gold.rels.get(dep).copied().flatten() else {
                continue;
            };
            if rel >= labels {
                return Err(KakariError::ShapeMismatch(format!(
                    "relation {rel} of token {dep} outside {labels} labels"
                )));
            }
            let row = rels.labels_for(head, dep);
            let log_norm = log_sum_exp(row);
            let term = log_norm - row[rel];
            if !term.is_finite() {
                continue;
            }
            loss += term;
            if let Some(grad) = grad.as_mut() {
                for (label, score) in row.iter().enumerate() {
                    let p = (score - log_norm).exp();
                    grad.set(head, dep, label, if label == rel { p - 1.0 } else { p });
                }
            }
        }
        Ok((loss, grad))
    }
}

fn check_head(dep: usize, head: usize, len: usize) -> Result<()> {
    if head >= len {
        return Err(KakariError::InvalidHead {
            dependent: dep,
            head: head as i64,
            len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::inside::log_partition;

    fn scores(n: usize, labels: usize) -> SentenceScores {
        let arcs = ScoreMatrix::from_fn(n, |h, d| ((h * 5 + d * 3) % 7) as f64 * 0.3);
        let mut rels = RelScores::filled(n, labels, 0.0);
        for h in 0..n {
            for d in 0..n {
                for r in 0..labels {
                    rels.set(h, d, r, ((h + 2 * d + r) % 4) as f64 * 0.5);
                }
            }
        }
        SentenceScores::new(arcs, rels).unwrap()
    }

    fn chain_gold(n: usize) -> GoldTree {
        let mut gold = GoldTree::unannotated(n);
        for dep in 1..n {
            gold.heads[dep] = Some(dep - 1);
            gold.rels[dep] = Some(dep % 2);
        }
        gold
    }

    #[test]
    fn test_loss_mode_flags() {
        assert_eq!(LossMode::from_flags(false, true), LossMode::Pointwise);
        assert_eq!(
            LossMode::from_flags(true, true),
            LossMode::Structured { partial: true }
        );
        assert!(LossMode::from_flags(true, false).is_structured());
    }

    #[test]
    fn test_task_arena_partition() {
        let arena = TaskArena::partition(&[1, 0, 1, 2]);
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.positions(1), Some(&[0usize, 2][..]));
        assert_eq!(arena.tasks().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_structured_loss_non_negative() {
        let assembler = LossAssembler::new(LossMode::Structured { partial: true });
        let loss = assembler.sentence(&scores(5, 2), &chain_gold(5)).unwrap();
        assert!(loss.arc >= 0.0);
        assert!(!loss.skipped);
        assert!(loss.marginals.is_some());
    }

    #[test]
    fn test_pointwise_loss_matches_manual_cross_entropy() {
        let s = scores(3, 2);
        let gold = chain_gold(3);
        let loss = LossAssembler::new(LossMode::Pointwise)
            .sentence(&s, &gold)
            .unwrap();
        let mut expected = 0.0;
        for dep in 1..3 {
            let column: Vec<f64> = s.arcs.column(dep).collect();
            expected += log_sum_exp(&column) - column[dep - 1];
        }
        assert!((loss.arc - expected).abs() < 1e-9);
    }

    #[test]
    fn test_structured_gradient_columns_sum_to_zero() {
        let assembler =
            LossAssembler::new(LossMode::Structured { partial: true }).with_gradients(true);
        let loss = assembler.sentence(&scores(5, 2), &chain_gold(5)).unwrap();
        let grad = loss.arc_grad.unwrap();
        for dep in 1..5 {
            let total: f64 = grad.column(dep).sum();
            assert!(total.abs() < 1e-9);
        }
    }

    #[test]
    fn test_structured_gradient_matches_finite_difference() {
        let s = scores(4, 2);
        let gold = chain_gold(4);
        let assembler =
            LossAssembler::new(LossMode::Structured { partial: true }).with_gradients(true);
        let base = assembler.sentence(&s, &gold).unwrap();
        let grad = base.arc_grad.clone().unwrap();
        let eps = 1e-5;
        for (h, d) in [(0, 2), (2, 1), (1, 3), (3, 2)] {
            let mut bumped = s.clone();
            bumped.arcs.set(h, d, s.arcs.get(h, d) + eps);
            let up = assembler.sentence(&bumped, &gold).unwrap().arc;
            let numeric = (up - base.arc) / eps;
            assert!((numeric - grad.get(h, d)).abs() < 1e-4, "arc {h}->{d}");
        }
    }

    #[test]
    fn test_partial_sentence_skipped_without_partial_flag() {
        let mut gold = chain_gold(4);
        gold.heads[2] = None;
        let loss = LossAssembler::new(LossMode::Structured { partial: false })
            .sentence(&scores(4, 2), &gold)
            .unwrap();
        assert!(loss.skipped);
        assert_eq!(loss.arc, 0.0);

        let loss = LossAssembler::new(LossMode::Structured { partial: true })
            .sentence(&scores(4, 2), &gold)
            .unwrap();
        assert!(!loss.skipped);
        assert!(loss.arc >= 0.0);
    }

    #[test]
    fn test_non_projective_gold_still_trains() {
        let s = scores(5, 2);
        let mut gold = chain_gold(5);
        // 0 -> 2 -> 4 -> 1 -> 3, where 4 -> 1 crosses 0 -> 2.
        gold.heads = vec![None, Some(4), Some(0), Some(1), Some(2)];
        let gold_score: f64 = gold.annotated().map(|(d, h)| s.arcs.get(h, d)).sum();
        let expected = log_partition(&s.arcs).unwrap() - gold_score;
        for partial in [false, true] {
            let assembler =
                LossAssembler::new(LossMode::Structured { partial }).with_gradients(true);
            let loss = assembler.sentence(&s, &gold).unwrap();
            assert!(!loss.skipped);
            assert_eq!(loss.tokens, 4);
            assert!((loss.arc - expected).abs() < 1e-9);

            let grad = loss.arc_grad.unwrap();
            for dep in 1..5 {
                assert!(grad.column(dep).sum::<f64>().abs() < 1e-9);
            }
            let eps = 1e-5;
            let mut bumped = s.clone();
            bumped.arcs.set(4, 1, s.arcs.get(4, 1) + eps);
            let numeric = (assembler.sentence(&bumped, &gold).unwrap().arc - loss.arc) / eps;
            assert!((numeric - grad.get(4, 1)).abs() < 1e-4);
        }
    }

    #[test]
    fn test_skipped_sentences_do_not_count_tokens() {
        let mut partial = chain_gold(4);
        partial.heads[2] = None;
        let batch = vec![scores(4, 2), scores(5, 2)];
        let golds = vec![partial, chain_gold(5)];
        let arena = TaskArena::partition(&[0, 0]);

        let loss = LossAssembler::new(LossMode::Structured { partial: false })
            .batch(&arena, &batch, &golds)
            .unwrap();
        assert_eq!(loss.skipped, 1);
        assert_eq!(loss.tokens, 4);
        assert_eq!(loss.sentences, 2);
        assert!((loss.arc_scale() - 0.25).abs() < 1e-12);

        // Pointwise counts annotated tokens only.
        let loss = LossAssembler::new(LossMode::Pointwise)
            .batch(&arena, &batch, &golds)
            .unwrap();
        assert_eq!(loss.skipped, 0);
        assert_eq!(loss.tokens, 2 + 4);
    }

    #[test]
    fn test_degenerate_sentence_skipped() {
        let mut s = scores(3, 2);
        s.arcs = ScoreMatrix::filled(3, f64::NEG_INFINITY);
        let loss = LossAssembler::new(LossMode::Structured { partial: true })
            .sentence(&s, &chain_gold(3))
            .unwrap();
        assert!(loss.skipped);
        assert!(!loss.arc.is_nan());
    }

    #[test]
    fn test_batch_normalization() {
        let assembler = LossAssembler::new(LossMode::Pointwise);
        let batch = vec![scores(3, 2), scores(4, 3), scores(4, 2)];
        let golds = vec![chain_gold(3), chain_gold(4), chain_gold(4)];
        let arena = TaskArena::partition(&[0, 1, 0]);
        let loss = assembler.batch(&arena, &batch, &golds).unwrap();
        assert_eq!(loss.tokens, 2 + 3 + 3);
        assert_eq!(loss.sentences, 3);
        let expected = loss.arc_sum / 8.0 + loss.rel_sum / 3.0;
        assert!((loss.total() - expected).abs() < 1e-12);
        assert!(loss.per_sentence.iter().all(Option::is_some));
    }

    #[test]
    fn test_batch_rejects_length_mismatch() {
        let assembler = LossAssembler::new(LossMode::Pointwise);
        let arena = TaskArena::partition(&[0, 0]);
        let result = assembler.batch(&arena, &[scores(3, 2)], &[chain_gold(3)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_relation_label_out_of_range() {
        let mut gold = chain_gold(3);
        gold.rels[1] = Some(9);
        let result = LossAssembler::new(LossMode::Pointwise).sentence(&scores(3, 2), &gold);
        assert!(result.is_err());
    }
}
