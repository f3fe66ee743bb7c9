//! `strata train` and `strata experiment`.

use super::types::{ConfigArgs, DatasetArgs, RunArgs};
use super::{load_model_config, output_directory, select_backend};
use crate::config::CliConfig;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use strata_training::{ExperimentOptions, RunOptions, TrainingLifecycle};

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub dataset: DatasetArgs,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ExperimentArgs {
    #[command(flatten)]
    pub train: TrainArgs,

    /// Split to evaluate after training (training, validation, test)
    #[arg(long, default_value = "test")]
    pub eval_split: String,

    /// Do not write raw output tensors
    #[arg(long)]
    pub skip_save_unprocessed_output: bool,

    /// Do not write predictions.csv
    #[arg(long)]
    pub skip_save_predictions: bool,

    /// Do not write test_statistics.json
    #[arg(long)]
    pub skip_save_eval_stats: bool,
}

fn run_options(args: &RunArgs, cli_config: &CliConfig) -> RunOptions {
    RunOptions {
        experiment_name: args.experiment_name.clone(),
        model_name: args.model_name.clone(),
        output_directory: output_directory(args.output_directory.clone(), cli_config),
        model_resume_path: args.model_resume_path.clone(),
        skip_save: args.skip.into(),
        random_seed: args.random_seed,
        ..RunOptions::default()
    }
}

pub async fn execute(args: TrainArgs, cli_config: &CliConfig) -> Result<()> {
    let config = load_model_config(&args.config)?;
    let sources = args.dataset.sources()?;
    let backend = select_backend(&args.run.backend, cli_config)?;
    let options = run_options(&args.run, cli_config);

    let mut lifecycle = TrainingLifecycle::new(config, backend.clone())?;
    let results = lifecycle.run(&sources, &options).await;
    lifecycle.shutdown().await?;
    let results = results?;

    if backend.is_coordinator() {
        println!();
        println!("{}", "Training complete".bold().green());
        if let Some(dir) = results.output_directory().filter(|dir| dir.exists()) {
            println!("  Output: {}", dir.display().to_string().cyan());
        }
        println!();
    }
    Ok(())
}

pub async fn execute_experiment(args: ExperimentArgs, cli_config: &CliConfig) -> Result<()> {
    let config = load_model_config(&args.train.config)?;
    let sources = args.train.dataset.sources()?;
    let backend = select_backend(&args.train.run.backend, cli_config)?;
    let options = ExperimentOptions {
        run: run_options(&args.train.run, cli_config),
        eval_split: args.eval_split,
        skip_save_unprocessed_output: args.skip_save_unprocessed_output,
        skip_save_predictions: args.skip_save_predictions,
        skip_save_eval_stats: args.skip_save_eval_stats,
    };

    let mut lifecycle = TrainingLifecycle::new(config, backend.clone())?;
    let results = lifecycle.experiment(&sources, &options).await;
    lifecycle.shutdown().await?;
    let results = results?;

    if backend.is_coordinator() {
        println!();
        println!("{}", "Experiment complete".bold().green());
        if let Some(dir) = results.training.output_directory().filter(|dir| dir.exists()) {
            println!("  Output: {}", dir.display().to_string().cyan());
        }
        if let Some(statistics) = &results.evaluation {
            for (feature, metrics) in statistics {
                for (metric, value) in metrics.iter().filter(|(_, v)| v.is_number()) {
                    println!("  {:<12} {:<12} {}", feature, metric, value);
                }
            }
        }
        println!();
    }
    Ok(())
}
