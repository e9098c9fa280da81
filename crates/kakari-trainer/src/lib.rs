//! # Kakari Trainer
//!
//! Batch orchestration on top of `kakari-core`: training the biaffine
//! scorer, evaluating UAS/LAS over several treebanks and writing predicted
//! trees back as CoNLL-X.

pub mod cmds;
pub mod config;
pub mod orchestrator;

pub use cmds::ModelBundle;
pub use config::TrainConfig;
pub use orchestrator::{Evaluation, Optim, Orchestrator};
