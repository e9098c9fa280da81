use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Result, ensure};
use candle_core::Device;
use clap::Args;
use kakari_core::corpus::{Corpus, TextDataset, Vocab};
use kakari_core::model::BiaffineScorer;
use oorandom::Rand32;
use tracing::info;

use crate::cmds::ModelBundle;
use crate::cmds::evaluate::evaluate_datasets;
use crate::config::TrainConfig;
use crate::orchestrator::{Optim, Orchestrator};

/// Train a multi-task biaffine parser.
#[derive(Debug, Clone, Args)]
pub struct TrainArgs {
    /// Directory the best model is written to
    #[arg(short, long)]
    pub model: PathBuf,

    /// Training treebanks, one per task
    #[arg(long = "train", required = true, num_args = 1..)]
    pub train: Vec<PathBuf>,

    /// Development treebanks, one per task
    #[arg(long = "dev", required = true, num_args = 1..)]
    pub dev: Vec<PathBuf>,

    /// Task names, in the order of the treebanks
    #[arg(long = "task", required = true, num_args = 1..)]
    pub tasks: Vec<String>,

    /// JSON file with hyperparameters; flags below override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub epochs: Option<usize>,

    /// Token budget per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub buckets: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Train with the tree-CRF loss
    #[arg(long)]
    pub crf: bool,

    /// Train on partially annotated trees
    #[arg(long)]
    pub partial: bool,

    /// Force projective trees when evaluating
    #[arg(long)]
    pub tree: bool,

    /// Decode from CRF marginals when evaluating
    #[arg(long)]
    pub marg: bool,

    /// Count punctuation in dev UAS/LAS
    #[arg(long)]
    pub punct: bool,
}

impl TrainArgs {
    fn config(&self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::load(path)?,
            None => TrainConfig::default(),
        };
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(buckets) = self.buckets {
            config.buckets = buckets;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.crf |= self.crf;
        config.partial |= self.partial;
        config.tree |= self.tree;
        config.marg |= self.marg;
        Ok(config)
    }
}

pub fn run(args: TrainArgs) -> Result<()> {
    ensure!(
        args.train.len() == args.tasks.len() && args.dev.len() == args.tasks.len(),
        "{} train files and {} dev files for {} tasks",
        args.train.len(),
        args.dev.len(),
        args.tasks.len()
    );
    let config = args.config()?;

    let train_corpora = args
        .train
        .iter()
        .enumerate()
        .map(|(task, path)| Corpus::load(path, task))
        .collect::<kakari_core::Result<Vec<_>>>()?;
    let dev_corpora = args
        .dev
        .iter()
        .enumerate()
        .map(|(task, path)| Corpus::load(path, task))
        .collect::<kakari_core::Result<Vec<_>>>()?;

    let corpus_refs: Vec<&Corpus> = train_corpora.iter().collect();
    let vocab = Vocab::build(args.tasks.clone(), &corpus_refs, config.min_freq)?;

    let mut train_instances = Vec::new();
    for corpus in &train_corpora {
        train_instances.extend(vocab.numericalize_corpus(corpus)?);
    }
    let train = TextDataset::new(train_instances, config.buckets, config.batch_size)?;
    let dev = args
        .tasks
        .iter()
        .zip(&dev_corpora)
        .map(|(name, corpus)| {
            let instances = vocab.numericalize_corpus(corpus)?;
            Ok((
                name.clone(),
                TextDataset::new(instances, config.buckets, config.batch_size)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    info!(
        train = train.len(),
        batches = train.n_batches(),
        tasks = args.tasks.len(),
        "datasets ready"
    );

    let scorer = BiaffineScorer::new(config.scorer_config(&vocab), Device::Cpu)?;
    let mut optim = Optim::new(scorer.varmap().all_vars(), &config)?;
    let orchestrator = Orchestrator::new(config.loss_mode(), config.decode_config())
        .with_punct(args.punct);
    let mut rng = Rand32::new(config.seed);

    let bundle = ModelBundle {
        config,
        vocab,
        scorer,
    };
    let mut best = None;
    let mut best_epoch = 0;
    for epoch in 1..=bundle.config.epochs {
        let start = Instant::now();
        let loss = orchestrator.train_epoch(&bundle.scorer, &mut optim, &train, &mut rng)?;
        println!("Epoch {epoch} / {}: train loss {loss:.4}", bundle.config.epochs);

        let report = evaluate_datasets(&orchestrator, &bundle.scorer, &bundle.vocab, &dev)?;
        print!("{report}");
        info!(epoch, elapsed = ?start.elapsed(), steps = optim.steps(), "epoch done");

        if best.is_none_or(|b| report.mixed > b) {
            best = Some(report.mixed);
            best_epoch = epoch;
            bundle.save(&args.model)?;
            println!("saved model to {}", args.model.display());
        } else if epoch - best_epoch >= bundle.config.patience {
            info!(epoch, best_epoch, "no improvement, stopping");
            break;
        }
    }
    if let Some(best) = best {
        println!("best epoch {best_epoch}: {best}");
    }
    Ok(())
}
