use anyhow::Result;
use clap::{Parser, Subcommand};
use kakari_trainer::cmds::evaluate::{self, EvaluateArgs};
use kakari_trainer::cmds::predict::{self, PredictArgs};
use kakari_trainer::cmds::train::{self, TrainArgs};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kakari")]
#[command(about = "Biaffine dependency parsing with projective tree inference")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model
    Train(TrainArgs),
    /// Evaluate a model on one or more treebanks
    Evaluate(EvaluateArgs),
    /// Write predicted trees for a treebank
    Predict(PredictArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kakari_core=info,kakari_trainer=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => train::run(args),
        Commands::Evaluate(args) => evaluate::run(args),
        Commands::Predict(args) => predict::run(args),
    }
}
