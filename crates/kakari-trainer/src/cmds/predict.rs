use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use kakari_core::corpus::{Corpus, TextDataset, Vocab};
use kakari_core::inference::DecodeConfig;
use kakari_core::model::ArcScorer;
use tracing::info;

use crate::cmds::ModelBundle;
use crate::orchestrator::Orchestrator;

/// Parse a treebank with a trained model and write the trees as CoNLL-X.
#[derive(Debug, Clone, Args)]
pub struct PredictArgs {
    /// Model directory written by `kakari train`
    #[arg(short, long)]
    pub model: PathBuf,

    /// CoNLL-X file to parse
    #[arg(long)]
    pub data: PathBuf,

    /// Task the data belongs to
    #[arg(long)]
    pub task: String,

    /// Where to write the predicted trees
    #[arg(long, default_value = "pred.conllx")]
    pub pred: PathBuf,

    /// Token budget per batch
    #[arg(long, default_value_t = 5000)]
    pub batch_size: usize,

    /// Maximum number of length buckets
    #[arg(long, default_value_t = 64)]
    pub buckets: usize,

    /// Force projective trees
    #[arg(long)]
    pub tree: bool,

    /// Decode from CRF marginals
    #[arg(long)]
    pub marg: bool,
}

/// Overwrite HEAD and DEPREL of every sentence in `corpus` with predictions.
pub fn predict_corpus<S: ArcScorer + ?Sized>(
    orchestrator: &Orchestrator,
    scorer: &S,
    vocab: &Vocab,
    corpus: &mut Corpus,
    buckets: usize,
    batch_size: usize,
) -> Result<()> {
    let instances = vocab.numericalize_corpus(corpus)?;
    let dataset = TextDataset::new(instances, buckets, batch_size)?;
    let trees = orchestrator.predict(scorer, &dataset)?;
    for (sentence, tree) in corpus.sentences.iter_mut().zip(trees) {
        // Position 0 is the root.
        let heads = tree.heads.get(1..).unwrap_or_default();
        let rels = vocab.id2rel(sentence.task, tree.rels.get(1..).unwrap_or_default());
        sentence.set_prediction(heads, &rels);
    }
    Ok(())
}

pub fn run(args: PredictArgs) -> Result<()> {
    let bundle = ModelBundle::load(&args.model)?;
    if !bundle.vocab.tasks().contains(&args.task) {
        bail!(
            "task {:?} is not one of the model's tasks {:?}",
            args.task,
            bundle.vocab.tasks()
        );
    }
    let task = bundle.vocab.task_id(&args.task)?;

    let mut corpus = Corpus::load(&args.data, task)?;
    let orchestrator = Orchestrator::new(
        bundle.config.loss_mode(),
        DecodeConfig::new().with_tree(args.tree).with_marg(args.marg),
    );
    predict_corpus(
        &orchestrator,
        &bundle.scorer,
        &bundle.vocab,
        &mut corpus,
        args.buckets,
        args.batch_size,
    )?;

    corpus.save(&args.pred)?;
    info!(path = %args.pred.display(), sentences = corpus.len(), "saved predictions");
    Ok(())
}
