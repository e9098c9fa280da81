//! # Biaffine Scorer
//!
//! A compact candle implementation of the biaffine arc/relation scorer:
//! word embeddings plus mean-pooled character embeddings, a window over the
//! neighbouring tokens, then one pair of MLPs and one biaffine layer per task.

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::corpus::Batch;
use crate::error::{KakariError, Result};
use crate::loss::TaskArena;
use crate::model::scorer::{ArcScorer, split_scores};
use crate::types::SentenceScores;

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const SCORER_FILE: &str = "scorer.json";

/// Layer sizes of a [`BiaffineScorer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiaffineConfig {
    pub n_words: usize,
    pub n_chars: usize,
    pub word_dim: usize,
    pub char_dim: usize,
    pub hidden_dim: usize,
    pub arc_mlp: usize,
    pub rel_mlp: usize,
    /// Relation label count of every task, indexed by task id.
    pub n_rels: Vec<usize>,
}

impl BiaffineConfig {
    pub fn n_tasks(&self) -> usize {
        self.n_rels.len()
    }
}

/// Scores of the sentences of one task within a batch.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub task: usize,
    /// Batch positions covered, in the row order of the tensors.
    pub positions: Vec<usize>,
    /// `[b_t, L, L]`, head-major.
    pub arc: Tensor,
    /// `[b_t, L, L, R_t]`, head-major.
    pub rel: Tensor,
}

struct TaskHead {
    arc_dep: Linear,
    arc_head: Linear,
    rel_dep: Linear,
    rel_head: Linear,
    /// `[d + 1, d]`: bias on the dependent side only.
    arc_weight: Tensor,
    /// `[R, d + 1, d + 1]`.
    rel_weight: Tensor,
}

impl TaskHead {
    fn load(vb: VarBuilder, config: &BiaffineConfig, n_rels: usize) -> Result<Self> {
        let input = config.hidden_dim;
        Ok(Self {
            arc_dep: candle_nn::linear(input, config.arc_mlp, vb.pp("arc_dep"))?,
            arc_head: candle_nn::linear(input, config.arc_mlp, vb.pp("arc_head"))?,
            rel_dep: candle_nn::linear(input, config.rel_mlp, vb.pp("rel_dep"))?,
            rel_head: candle_nn::linear(input, config.rel_mlp, vb.pp("rel_head"))?,
            arc_weight: vb.pp("arc_attn").get_with_hints(
                (config.arc_mlp + 1, config.arc_mlp),
                "weight",
                candle_nn::init::ZERO,
            )?,
            rel_weight: vb.pp("rel_attn").get_with_hints(
                (n_rels, config.rel_mlp + 1, config.rel_mlp + 1),
                "weight",
                candle_nn::init::ZERO,
            )?,
        })
    }

    /// `x`: `[b, L, hidden]`.
    fn forward(&self, x: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let (b, len, _) = x.dims3()?;
        let arc_d = with_bias(&self.arc_dep.forward(x)?.relu()?)?;
        let arc_h = self.arc_head.forward(x)?.relu()?;
        let (d_in, d_out) = self.arc_weight.dims2()?;
        let arc_weight = self
            .arc_weight
            .unsqueeze(0)?
            .broadcast_as((b, d_in, d_out))?
            .contiguous()?;
        // [b, dep, head] -> [b, head, dep]
        let arc = arc_d
            .matmul(&arc_weight)?
            .matmul(&arc_h.transpose(1, 2)?.contiguous()?)?
            .transpose(1, 2)?
            .contiguous()?;

        let (n_rels, d, _) = self.rel_weight.dims3()?;
        let rel_d = with_bias(&self.rel_dep.forward(x)?.relu()?)?
            .unsqueeze(1)?
            .broadcast_as((b, n_rels, len, d))?
            .contiguous()?;
        let rel_h = with_bias(&self.rel_head.forward(x)?.relu()?)?
            .transpose(1, 2)?
            .unsqueeze(1)?
            .broadcast_as((b, n_rels, d, len))?
            .contiguous()?;
        let rel_weight = self
            .rel_weight
            .unsqueeze(0)?
            .broadcast_as((b, n_rels, d, d))?
            .contiguous()?;
        // [b, R, dep, head] -> [b, head, dep, R]
        let rel = rel_d
            .matmul(&rel_weight)?
            .matmul(&rel_h)?
            .permute((0, 3, 2, 1))?
            .contiguous()?;
        Ok((arc, rel))
    }
}

/// Append a column of ones to the last dimension.
fn with_bias(x: &Tensor) -> candle_core::Result<Tensor> {
    let mut dims = x.dims().to_vec();
    if let Some(last) = dims.last_mut() {
        *last = 1;
    }
    let ones = Tensor::ones(dims, x.dtype(), x.device())?;
    Tensor::cat(&[x, &ones], x.rank() - 1)
}

/// Biaffine parser scorer with all parameters in one [`VarMap`].
pub struct BiaffineScorer {
    config: BiaffineConfig,
    varmap: VarMap,
    device: Device,
    word_embed: Embedding,
    char_embed: Embedding,
    encoder: Linear,
    tasks: Vec<TaskHead>,
}

impl BiaffineScorer {
    /// Fresh, randomly initialized parameters.
    pub fn new(config: BiaffineConfig, device: Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let word_embed =
            candle_nn::embedding(config.n_words, config.word_dim, vb.pp("word_embed"))?;
        let char_embed =
            candle_nn::embedding(config.n_chars, config.char_dim, vb.pp("char_embed"))?;
        let encoder = candle_nn::linear(
            3 * (config.word_dim + config.char_dim),
            config.hidden_dim,
            vb.pp("encoder"),
        )?;
        let tasks = config
            .n_rels
            .iter()
            .enumerate()
            .map(|(t, &n_rels)| TaskHead::load(vb.pp(format!("task{t}")), &config, n_rels))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            varmap,
            device,
            word_embed,
            char_embed,
            encoder,
            tasks,
        })
    }

    /// Load a scorer saved with [`BiaffineScorer::save`].
    pub fn load<P: AsRef<Path>>(dir: P, device: Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config_path = dir.join(SCORER_FILE);
        let text = fs::read_to_string(&config_path).map_err(|e| {
            KakariError::ModelLoad(format!("{}: {e}", config_path.display()))
        })?;
        let config: BiaffineConfig = serde_json::from_str(&text)?;
        let mut scorer = Self::new(config, device)?;
        let weights = dir.join(WEIGHTS_FILE);
        scorer
            .varmap
            .load(&weights)
            .map_err(|e| KakariError::ModelLoad(format!("{}: {e}", weights.display())))?;
        info!(path = %dir.display(), tasks = scorer.config.n_tasks(), "loaded biaffine scorer");
        Ok(scorer)
    }

    /// Write weights and layer sizes into `dir`.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        fs::write(dir.join(SCORER_FILE), serde_json::to_string_pretty(&self.config)?)?;
        self.varmap.save(dir.join(WEIGHTS_FILE))?;
        Ok(())
    }

    pub fn config(&self) -> &BiaffineConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Shared token representations, `[b, L, hidden]`.
    fn encode(&self, batch: &Batch) -> Result<Tensor> {
        let (b, len, chars) = (batch.size(), batch.max_len, batch.max_chars);
        let words = Tensor::from_slice(&batch.words, (b, len), &self.device)?;
        let char_ids = Tensor::from_slice(&batch.chars, (b, len, chars), &self.device)?;

        let word_emb = self.word_embed.forward(&words)?;
        // Mean over the real characters of every token.
        let char_mask = char_ids.ne(0u32)?.to_dtype(DType::F32)?.unsqueeze(3)?;
        let char_sum = self
            .char_embed
            .forward(&char_ids)?
            .broadcast_mul(&char_mask)?
            .sum(2)?;
        let char_count = char_mask.sum(2)?.clamp(1f32, f32::MAX)?;
        let char_emb = char_sum.broadcast_div(&char_count)?;

        let token = Tensor::cat(&[&word_emb, &char_emb], 2)?;
        let prev = token.pad_with_zeros(1, 1, 0)?.narrow(1, 0, len)?;
        let next = token.pad_with_zeros(1, 0, 1)?.narrow(1, 1, len)?;
        let window = Tensor::cat(&[&prev, &token, &next], 2)?;
        Ok(self.encoder.forward(&window)?.tanh()?)
    }

    /// Score every task partition of the batch.
    pub fn forward(&self, batch: &Batch, arena: &TaskArena) -> Result<Vec<TaskOutput>> {
        let hidden = self.encode(batch)?;
        let mut outputs = Vec::with_capacity(arena.len());
        for (task, positions) in arena.iter() {
            let head = self
                .tasks
                .get(task)
                .ok_or_else(|| KakariError::UnknownTask(format!("task id {task}")))?;
            let rows: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
            let rows = Tensor::new(rows.as_slice(), &self.device)?;
            let (arc, rel) = head.forward(&hidden.index_select(&rows, 0)?)?;
            outputs.push(TaskOutput {
                task,
                positions: positions.to_vec(),
                arc,
                rel,
            });
        }
        Ok(outputs)
    }
}

impl ArcScorer for BiaffineScorer {
    fn score(&self, batch: &Batch) -> Result<Vec<SentenceScores>> {
        let arena = TaskArena::partition(&batch.tasks);
        gather_scores(&self.forward(batch, &arena)?, &batch.lens)
    }
}

/// Per-sentence score tables of all task outputs, in batch order.
pub fn gather_scores(outputs: &[TaskOutput], lens: &[usize]) -> Result<Vec<SentenceScores>> {
    let mut slots: Vec<Option<SentenceScores>> = vec![None; lens.len()];
    for output in outputs {
        let sub_lens = output
            .positions
            .iter()
            .map(|&p| {
                lens.get(p).copied().ok_or_else(|| {
                    KakariError::ShapeMismatch(format!("batch position {p} out of {}", lens.len()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let scores = split_scores(&output.arc, &output.rel, &sub_lens)?;
        for (&pos, sentence) in output.positions.iter().zip(scores) {
            slots[pos] = Some(sentence);
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            s.ok_or_else(|| KakariError::ShapeMismatch(format!("batch position {i} unscored")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GoldTree, Instance};

    fn config() -> BiaffineConfig {
        BiaffineConfig {
            n_words: 10,
            n_chars: 8,
            word_dim: 4,
            char_dim: 3,
            hidden_dim: 6,
            arc_mlp: 5,
            rel_mlp: 3,
            n_rels: vec![2, 4],
        }
    }

    fn batch() -> Batch {
        let make = |n: usize, task: usize| Instance {
            words: (0..n).map(|i| 2 + i).collect(),
            chars: (0..n).map(|i| vec![3; 1 + i % 2]).collect(),
            gold: GoldTree::unannotated(n),
            task,
        };
        let a = make(3, 1);
        let b = make(5, 0);
        let c = make(4, 1);
        Batch::collate(vec![0, 1, 2], &[&a, &b, &c]).unwrap()
    }

    #[test]
    fn test_forward_shapes_per_task() {
        let scorer = BiaffineScorer::new(config(), Device::Cpu).unwrap();
        let batch = batch();
        let arena = TaskArena::partition(&batch.tasks);
        let outputs = scorer.forward(&batch, &arena).unwrap();
        assert_eq!(outputs.len(), 2);
        let task1 = outputs.iter().find(|o| o.task == 1).unwrap();
        assert_eq!(task1.positions, vec![0, 2]);
        assert_eq!(task1.arc.dims(), &[2, 5, 5]);
        assert_eq!(task1.rel.dims(), &[2, 5, 5, 4]);
    }

    #[test]
    fn test_score_returns_batch_order() {
        let scorer = BiaffineScorer::new(config(), Device::Cpu).unwrap();
        let scores = scorer.score(&batch()).unwrap();
        let lens: Vec<usize> = scores.iter().map(SentenceScores::len).collect();
        assert_eq!(lens, vec![3, 5, 4]);
        assert_eq!(scores[0].rels.num_labels(), 4);
        assert_eq!(scores[1].rels.num_labels(), 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let scorer = BiaffineScorer::new(config(), Device::Cpu).unwrap();
        let dir = std::env::temp_dir().join(format!("kakari-biaffine-{}", std::process::id()));
        scorer.save(&dir).unwrap();
        let loaded = BiaffineScorer::load(&dir, Device::Cpu).unwrap();
        let a = scorer.score(&batch()).unwrap();
        let b = loaded.score(&batch()).unwrap();
        std::fs::remove_dir_all(&dir).ok();
        assert_eq!(loaded.config(), scorer.config());
        assert_eq!(a[1].arcs.as_slice(), b[1].arcs.as_slice());
    }

    #[test]
    fn test_unknown_task_is_rejected() {
        let scorer = BiaffineScorer::new(config(), Device::Cpu).unwrap();
        let mut batch = batch();
        batch.tasks[0] = 9;
        assert!(matches!(scorer.score(&batch), Err(KakariError::UnknownTask(_))));
    }
}
