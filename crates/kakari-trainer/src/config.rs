//! Run configuration, persisted next to the model weights.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use kakari_core::corpus::Vocab;
use kakari_core::inference::DecodeConfig;
use kakari_core::loss::LossMode;
use kakari_core::model::BiaffineConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.json";
pub const VOCAB_FILE: &str = "vocab.json";

/// Hyperparameters and switches of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub word_dim: usize,
    pub char_dim: usize,
    pub hidden_dim: usize,
    pub arc_mlp: usize,
    pub rel_mlp: usize,

    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    /// The learning rate is multiplied by `decay` every `decay_steps` updates.
    pub decay: f64,
    pub decay_steps: usize,
    /// Maximum global gradient norm.
    pub clip: f64,

    pub epochs: usize,
    /// Token budget per batch.
    pub batch_size: usize,
    pub buckets: usize,
    /// Epochs without dev improvement before stopping.
    pub patience: usize,
    pub min_freq: usize,
    pub seed: u64,

    /// Train with the tree-CRF loss.
    pub crf: bool,
    /// Let sentences with unannotated heads contribute to the CRF loss.
    pub partial: bool,
    pub tree: bool,
    pub marg: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            word_dim: 100,
            char_dim: 50,
            hidden_dim: 400,
            arc_mlp: 500,
            rel_mlp: 100,
            lr: 2e-3,
            beta1: 0.9,
            beta2: 0.9,
            eps: 1e-12,
            weight_decay: 0.0,
            decay: 0.75,
            decay_steps: 5000,
            clip: 5.0,
            epochs: 5000,
            batch_size: 5000,
            buckets: 32,
            patience: 100,
            min_freq: 2,
            seed: 1,
            crf: false,
            partial: false,
            tree: false,
            marg: false,
        }
    }
}

impl TrainConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn loss_mode(&self) -> LossMode {
        LossMode::from_flags(self.crf, self.partial)
    }

    pub fn decode_config(&self) -> DecodeConfig {
        DecodeConfig::new().with_tree(self.tree).with_marg(self.marg)
    }

    /// Layer sizes for a scorer over `vocab`.
    pub fn scorer_config(&self, vocab: &Vocab) -> BiaffineConfig {
        BiaffineConfig {
            n_words: vocab.n_words(),
            n_chars: vocab.n_chars(),
            word_dim: self.word_dim,
            char_dim: self.char_dim,
            hidden_dim: self.hidden_dim,
            arc_mlp: self.arc_mlp,
            rel_mlp: self.rel_mlp,
            n_rels: (0..vocab.tasks().len()).map(|t| vocab.n_rels(t)).collect(),
        }
    }

    /// Learning rate after `step` updates.
    pub fn lr_at(&self, step: usize) -> f64 {
        if self.decay_steps == 0 {
            return self.lr;
        }
        self.lr * self.decay.powf(step as f64 / self.decay_steps as f64)
    }
}
