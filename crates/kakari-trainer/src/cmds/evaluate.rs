use std::fmt;
use std::path::PathBuf;

use anyhow::{Result, ensure};
use clap::Args;
use kakari_core::corpus::{Corpus, TextDataset, Vocab};
use kakari_core::inference::DecodeConfig;
use kakari_core::metric::Metric;
use kakari_core::model::ArcScorer;
use tracing::info;

use crate::cmds::ModelBundle;
use crate::orchestrator::{Evaluation, Orchestrator};

/// Evaluate a trained model on one or more treebanks.
#[derive(Debug, Clone, Args)]
pub struct EvaluateArgs {
    /// Model directory written by `kakari train`
    #[arg(short, long)]
    pub model: PathBuf,

    /// CoNLL-X files to evaluate, one per task name
    #[arg(long = "data", required = true, num_args = 1..)]
    pub data: Vec<PathBuf>,

    /// Task of every data file, in the same order
    #[arg(long = "task", required = true, num_args = 1..)]
    pub tasks: Vec<String>,

    /// Token budget per batch
    #[arg(long, default_value_t = 5000)]
    pub batch_size: usize,

    /// Maximum number of length buckets
    #[arg(long, default_value_t = 64)]
    pub buckets: usize,

    /// Count punctuation in UAS/LAS
    #[arg(long)]
    pub punct: bool,

    /// Force projective trees
    #[arg(long)]
    pub tree: bool,

    /// Decode from CRF marginals
    #[arg(long)]
    pub marg: bool,
}

/// Per-dataset results plus the pooled and averaged scores.
#[derive(Debug, Clone, Default)]
pub struct EvalReport {
    pub datasets: Vec<(String, Evaluation)>,
    pub mixed: Metric,
}

impl EvalReport {
    /// Unweighted mean of the per-dataset `(UAS, LAS)`.
    pub fn average(&self) -> (f64, f64) {
        let n = self.datasets.len().max(1) as f64;
        let uas: f64 = self.datasets.iter().map(|(_, e)| e.metric.uas()).sum();
        let las: f64 = self.datasets.iter().map(|(_, e)| e.metric.las()).sum();
        (uas / n, las / n)
    }
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, eval) in &self.datasets {
            writeln!(f, "{name:6} Loss: {:.4} {}", eval.loss, eval.metric)?;
        }
        writeln!(f, "{:8} {}", "mixed", self.mixed)?;
        let (uas, las) = self.average();
        writeln!(
            f,
            "{:8} UAS: {:.2}% LAS: {:.2}%",
            "average",
            uas * 100.0,
            las * 100.0
        )
    }
}

/// Evaluate `scorer` on every named dataset.
pub fn evaluate_datasets<S: ArcScorer + ?Sized>(
    orchestrator: &Orchestrator,
    scorer: &S,
    vocab: &Vocab,
    datasets: &[(String, TextDataset)],
) -> Result<EvalReport> {
    let mut report = EvalReport::default();
    for (name, dataset) in datasets {
        let eval = orchestrator.evaluate(scorer, dataset, vocab)?;
        info!(
            dataset = %name,
            loss = eval.loss,
            uas = eval.metric.uas(),
            las = eval.metric.las(),
            "evaluated"
        );
        report.mixed += eval.metric;
        report.datasets.push((name.clone(), eval));
    }
    Ok(report)
}

pub fn run(args: EvaluateArgs) -> Result<()> {
    ensure!(
        args.data.len() == args.tasks.len(),
        "{} data files but {} task names",
        args.data.len(),
        args.tasks.len()
    );
    let bundle = ModelBundle::load(&args.model)?;
    let task_ids = args
        .tasks
        .iter()
        .map(|t| bundle.vocab.task_id(t))
        .collect::<kakari_core::Result<Vec<_>>>()?;

    let mut datasets = Vec::with_capacity(args.data.len());
    for ((path, name), task) in args.data.iter().zip(&args.tasks).zip(task_ids) {
        let corpus = Corpus::load(path, task)?;
        println!("{:35} has {:6} sentences", path.display().to_string(), corpus.len());
        let instances = bundle.vocab.numericalize_corpus(&corpus)?;
        datasets.push((
            name.clone(),
            TextDataset::new(instances, args.buckets, args.batch_size)?,
        ));
    }
    println!();

    let orchestrator = Orchestrator::new(
        bundle.config.loss_mode(),
        DecodeConfig::new().with_tree(args.tree).with_marg(args.marg),
    )
    .with_punct(args.punct);
    let report = evaluate_datasets(&orchestrator, &bundle.scorer, &bundle.vocab, &datasets)?;
    print!("{report}");
    Ok(())
}
