//! Subcommands of the `kakari` binary.

pub mod evaluate;
pub mod predict;
pub mod train;

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;
use kakari_core::corpus::Vocab;
use kakari_core::model::BiaffineScorer;
use tracing::info;

use crate::config::{CONFIG_FILE, TrainConfig, VOCAB_FILE};

/// Everything stored in a model directory.
pub struct ModelBundle {
    pub config: TrainConfig,
    pub vocab: Vocab,
    pub scorer: BiaffineScorer,
}

impl ModelBundle {
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let config = TrainConfig::load(dir.join(CONFIG_FILE))?;
        let vocab = Vocab::load(dir.join(VOCAB_FILE))
            .with_context(|| format!("loading vocabulary from {}", dir.display()))?;
        let scorer = BiaffineScorer::load(dir, Device::Cpu)
            .with_context(|| format!("loading scorer from {}", dir.display()))?;
        info!(path = %dir.display(), tasks = ?vocab.tasks(), "loaded model");
        Ok(Self {
            config,
            vocab,
            scorer,
        })
    }

    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        self.scorer.save(dir)?;
        self.vocab.save(dir.join(VOCAB_FILE))?;
        self.config.save(dir.join(CONFIG_FILE))?;
        Ok(())
    }
}
