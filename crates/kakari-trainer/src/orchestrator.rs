//! Batch orchestration for training, evaluation and prediction.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use kakari_core::corpus::{TextDataset, Vocab};
use kakari_core::inference::{ArcView, DecodeConfig, TreeDecoder};
use kakari_core::loss::{BatchLoss, LossAssembler, LossMode, TaskArena};
use kakari_core::metric::Metric;
use kakari_core::model::{
    ArcScorer, BiaffineScorer, TaskOutput, gather_scores, pack_arc_grads, pack_rel_grads,
};
use kakari_core::types::{DecodedTree, GoldTree};
use oorandom::Rand32;
use tracing::debug;

use crate::config::TrainConfig;

/// Loss and attachment scores of one evaluated dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub metric: Metric,
}

/// Drives a scorer over batches: losses, decoding and metrics.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    decoder: TreeDecoder,
    loss: LossAssembler,
    punct: bool,
}

impl Orchestrator {
    pub fn new(mode: LossMode, decode: DecodeConfig) -> Self {
        Self {
            decoder: TreeDecoder::new(decode),
            loss: LossAssembler::new(mode),
            punct: false,
        }
    }

    /// Count punctuation in evaluation metrics.
    pub fn with_punct(mut self, punct: bool) -> Self {
        self.punct = punct;
        self
    }

    pub fn decoder(&self) -> &TreeDecoder {
        &self.decoder
    }

    /// One pass over `dataset`, updating the scorer's parameters batch by batch.
    ///
    /// Returns the mean batch loss.
    pub fn train_epoch(
        &self,
        model: &BiaffineScorer,
        optim: &mut Optim,
        dataset: &TextDataset,
        rng: &mut Rand32,
    ) -> Result<f64> {
        let assembler = self.loss.with_gradients(true);
        let batches = dataset.batches(Some(rng));
        let mut total = 0.0;
        for (step, indices) in batches.iter().enumerate() {
            let batch = dataset.collate(indices)?;
            let arena = TaskArena::partition(&batch.tasks);
            let outputs = model.forward(&batch, &arena)?;
            let scores = gather_scores(&outputs, &batch.lens)?;
            let loss = assembler.batch(&arena, &scores, &batch.golds)?;
            let surrogate = surrogate_loss(&outputs, &loss, batch.max_len, model.device())?;
            let norm = optim.step(&surrogate)?;
            total += loss.total();
            debug!(
                step,
                loss = loss.total(),
                norm,
                skipped = loss.skipped,
                lr = optim.learning_rate(),
                "train batch"
            );
        }
        Ok(total / batches.len().max(1) as f64)
    }

    /// Loss and UAS/LAS of `scorer` on `dataset`.
    ///
    /// The loss is the summed arc and relation loss per word.
    pub fn evaluate<S: ArcScorer + ?Sized>(
        &self,
        scorer: &S,
        dataset: &TextDataset,
        vocab: &Vocab,
    ) -> Result<Evaluation> {
        let mut metric = Metric::new();
        let mut loss_sum = 0.0;
        let mut words = 0;
        let batches = dataset.batches(None);
        let view = self.decoder.default_view(ArcView::HeadSoftmax);
        for indices in &batches {
            let batch = dataset.collate(indices)?;
            let scores = scorer.score(&batch)?;
            let arena = TaskArena::partition(&batch.tasks);
            let loss = self.loss.batch(&arena, &scores, &batch.golds)?;
            loss_sum += loss.arc_sum + loss.rel_sum;
            words += batch.n_tokens();
            for (b, sentence) in scores.iter().enumerate() {
                let cached = loss.per_sentence[b]
                    .as_ref()
                    .and_then(|l| l.marginals.as_ref());
                let tree = self.decoder.decode(sentence, &batch.mask(b), view, cached)?;
                self.record(&mut metric, &tree, &batch.golds[b], batch.words_of(b), vocab);
            }
        }
        Ok(Evaluation {
            loss: loss_sum / words.max(1) as f64,
            metric,
        })
    }

    fn record(
        &self,
        metric: &mut Metric,
        tree: &DecodedTree,
        gold: &GoldTree,
        words: &[u32],
        vocab: &Vocab,
    ) {
        for (dep, gold_head) in gold.annotated() {
            if !self.punct && words.get(dep).is_some_and(|&w| vocab.is_punct(w as usize)) {
                continue;
            }
            metric.record(tree.heads[dep], tree.rels[dep], gold_head, gold.rels[dep]);
        }
    }

    /// Decoded trees for every sentence of `dataset`, in dataset order.
    pub fn predict<S: ArcScorer + ?Sized>(
        &self,
        scorer: &S,
        dataset: &TextDataset,
    ) -> Result<Vec<DecodedTree>> {
        let view = self.decoder.default_view(ArcView::Raw);
        let mut trees: Vec<Option<DecodedTree>> = vec![None; dataset.len()];
        for indices in dataset.batches(None) {
            let batch = dataset.collate(&indices)?;
            let scores = scorer.score(&batch)?;
            for (b, sentence) in scores.iter().enumerate() {
                let tree = self.decoder.decode(sentence, &batch.mask(b), view, None)?;
                trees[batch.indices[b]] = Some(tree);
            }
        }
        trees
            .into_iter()
            .enumerate()
            .map(|(i, tree)| tree.with_context(|| format!("sentence {i} was never decoded")))
            .collect()
    }
}

/// A scalar whose gradient with respect to the score tensors equals the
/// assembler's (already normalized) score gradients.
fn surrogate_loss(
    outputs: &[TaskOutput],
    loss: &BatchLoss,
    max_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for output in outputs {
        let sentences: Vec<_> = output
            .positions
            .iter()
            .map(|&p| loss.per_sentence.get(p).and_then(Option::as_ref))
            .collect();
        let arc_grads: Vec<_> = sentences
            .iter()
            .map(|s| s.and_then(|s| s.arc_grad.as_ref()))
            .collect();
        let rel_grads: Vec<_> = sentences
            .iter()
            .map(|s| s.and_then(|s| s.rel_grad.as_ref()))
            .collect();
        let labels = output.rel.dim(3)?;
        let g_arc = pack_arc_grads(&arc_grads, max_len, loss.arc_scale(), device)?;
        let g_rel = pack_rel_grads(&rel_grads, max_len, labels, loss.rel_scale(), device)?;
        let arc_term = (&output.arc * &g_arc)?.sum_all()?;
        let rel_term = (&output.rel * &g_rel)?.sum_all()?;
        total = ((total + arc_term)? + rel_term)?;
    }
    Ok(total)
}

/// AdamW with exponential learning rate decay and global norm clipping.
pub struct Optim {
    inner: AdamW,
    vars: Vec<Var>,
    schedule: TrainConfig,
    steps: usize,
}

impl Optim {
    pub fn new(vars: Vec<Var>, config: &TrainConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        };
        Ok(Self {
            inner: AdamW::new(vars.clone(), params)?,
            vars,
            schedule: config.clone(),
            steps: 0,
        })
    }

    /// Back-propagate `loss`, clip, update and advance the schedule.
    ///
    /// Returns the gradient norm before clipping.
    pub fn step(&mut self, loss: &Tensor) -> Result<f64> {
        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(&self.vars, &mut grads, self.schedule.clip)?;
        self.inner.step(&grads)?;
        self.steps += 1;
        self.inner.set_learning_rate(self.schedule.lr_at(self.steps));
        Ok(norm)
    }

    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut squared = 0.0;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            squared += grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = squared.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let factor = max_norm / (norm + 1e-6);
        for var in vars {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => grad.affine(factor, 0.0)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kakari_core::model::FixedScorer;
    use kakari_core::types::{Instance, RelScores, ScoreMatrix, SentenceScores};

    /// Root plus three words, gold chain 0 -> 1 -> 2 -> 3 with relation 0.
    fn chain(task: usize) -> Instance {
        Instance {
            words: vec![Vocab::ROOT_INDEX, 3, 4, 5],
            chars: vec![vec![2]; 4],
            gold: GoldTree {
                heads: vec![None, Some(0), Some(1), Some(2)],
                rels: vec![None, Some(0), Some(0), Some(0)],
            },
            task,
        }
    }

    fn chain_scores(correct: bool) -> SentenceScores {
        let mut arcs = ScoreMatrix::filled(4, -5.0);
        if correct {
            arcs.set(0, 1, 5.0);
            arcs.set(1, 2, 5.0);
            arcs.set(2, 3, 5.0);
        } else {
            arcs.set(0, 3, 5.0);
            arcs.set(3, 2, 5.0);
            arcs.set(2, 1, 5.0);
        }
        let mut rels = RelScores::filled(4, 2, 0.0);
        for h in 0..4 {
            for d in 0..4 {
                rels.set(h, d, 0, 1.0);
            }
        }
        SentenceScores::new(arcs, rels).unwrap()
    }

    fn vocab() -> Vocab {
        let text = "1\ta\t_\t_\t_\t_\t0\tx\t_\t_\n\
                    2\tb\t_\t_\t_\t_\t1\ty\t_\t_\n\
                    3\tc\t_\t_\t_\t_\t2\tx\t_\t_\n";
        let corpus = kakari_core::corpus::Corpus::read(text.as_bytes(), 0).unwrap();
        Vocab::build(vec!["t".into()], &[&corpus], 1).unwrap()
    }

    #[test]
    fn test_evaluate_perfect_scores() {
        let dataset = TextDataset::new(vec![chain(0), chain(0)], 1, 100).unwrap();
        let scorer = FixedScorer::new(vec![chain_scores(true), chain_scores(true)]);
        for tree in [false, true] {
            for crf in [false, true] {
                let orchestrator = Orchestrator::new(
                    LossMode::from_flags(crf, false),
                    DecodeConfig::new().with_tree(tree),
                );
                let eval = orchestrator.evaluate(&scorer, &dataset, &vocab()).unwrap();
                assert_eq!(eval.metric.total, 6);
                assert_eq!(eval.metric.correct_arcs, 6);
                assert_eq!(eval.metric.correct_rels, 6);
                assert!(eval.loss >= 0.0);
            }
        }
    }

    #[test]
    fn test_evaluate_wrong_tree() {
        let dataset = TextDataset::new(vec![chain(0)], 1, 100).unwrap();
        let scorer = FixedScorer::new(vec![chain_scores(false)]);
        let orchestrator =
            Orchestrator::new(LossMode::Pointwise, DecodeConfig::new().with_tree(true));
        let eval = orchestrator.evaluate(&scorer, &dataset, &vocab()).unwrap();
        assert_eq!(eval.metric.correct_arcs, 0);
        assert!(eval.loss > 1.0);
    }

    #[test]
    fn test_evaluate_loss_is_per_word() {
        let dataset = TextDataset::new(vec![chain(0), chain(0)], 2, 4).unwrap();
        let scorer = FixedScorer::new(vec![chain_scores(false), chain_scores(false)]);
        let orchestrator = Orchestrator::new(LossMode::Pointwise, DecodeConfig::new());
        let eval = orchestrator.evaluate(&scorer, &dataset, &vocab()).unwrap();

        let single = LossAssembler::new(LossMode::Pointwise)
            .sentence(&chain_scores(false), &chain(0).gold)
            .unwrap();
        let expected = 2.0 * (single.arc + single.rel) / 6.0;
        assert!((eval.loss - expected).abs() < 1e-9);
    }

    #[test]
    fn test_predict_in_dataset_order() {
        let dataset = TextDataset::new(vec![chain(0), chain(0)], 2, 4).unwrap();
        let scorer = FixedScorer::new(vec![chain_scores(true), chain_scores(false)]);
        let orchestrator = Orchestrator::new(
            LossMode::Pointwise,
            DecodeConfig::new().with_tree(true).with_marg(true),
        );
        let trees = orchestrator.predict(&scorer, &dataset).unwrap();
        assert_eq!(trees[0].heads, vec![None, Some(0), Some(1), Some(2)]);
        assert_eq!(trees[1].heads, vec![None, Some(2), Some(3), Some(0)]);
        assert_eq!(trees[1].rels[1], Some(0));
    }

    #[test]
    fn test_clip_scales_large_gradients() {
        let var = Var::new(&[3f32, 4.0], &Device::Cpu).unwrap();
        let loss = (var.as_tensor() * &Tensor::new(&[3f32, 4.0], &Device::Cpu).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = loss.backward().unwrap();
        let norm = clip_grad_norm(&[var.clone()], &mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let clipped: Vec<f32> = grads.get(var.as_tensor()).unwrap().to_vec1().unwrap();
        let clipped_norm = clipped.iter().map(|g| g * g).sum::<f32>().sqrt();
        assert!((clipped_norm - 1.0).abs() < 1e-4);
    }
}
