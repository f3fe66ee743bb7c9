//! Strata CLI - Command-line interface for Strata training runs
//!
//! This CLI provides a `strata` command that trains, evaluates and
//! cross-validates models through the training lifecycle.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::{EvaluateArgs, ExperimentArgs, KFoldArgs, PredictArgs, TrainArgs};
use strata_training::runtime::{self, RuntimeSettings};

/// Strata CLI - Train and evaluate models from declarative configs
///
/// A run reads a model config and one or more datasets, trains through the
/// selected backend and leaves a self-contained run directory behind.
#[derive(Parser, Debug)]
#[command(name = "strata", author, version, about = "Strata - declarative model training")]
struct Args {
    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model
    ///
    /// Preprocesses the datasets, trains and saves the model, its config,
    /// training statistics and a run description into a fresh run directory.
    Train(TrainArgs),

    /// Train a model, then evaluate it on one split
    Experiment(ExperimentArgs),

    /// Evaluate a saved model on a labelled dataset
    Evaluate(EvaluateArgs),

    /// Predict with a saved model
    Predict(PredictArgs),

    /// K-fold cross validation
    Kfold(KFoldArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cli_config = config::CliConfig::discover_and_load()?;

    let level = args.log_level.as_deref().or(cli_config.log_level.as_deref()).unwrap_or("info");
    runtime::init(RuntimeSettings::from_level_name(level));

    match args.command {
        Command::Train(args) => commands::train::execute(args, &cli_config).await,
        Command::Experiment(args) => commands::train::execute_experiment(args, &cli_config).await,
        Command::Evaluate(args) => commands::evaluate::execute(args, &cli_config).await,
        Command::Predict(args) => commands::evaluate::execute_predict(args, &cli_config).await,
        Command::Kfold(args) => commands::kfold::execute(args, &cli_config).await,
    }
}
