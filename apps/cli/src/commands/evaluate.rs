//! `strata evaluate` and `strata predict` against a saved model.

use super::select_backend;
use super::types::BackendArgs;
use crate::config::CliConfig;
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use strata_training::{
    DataFormat, DatasetSource, EvaluateOptions, ModelRegistry, PredictOptions, SplitSelection, TrainingLifecycle,
};

#[derive(Args, Debug, Clone)]
pub struct InferenceArgs {
    /// Saved model directory (the `model` folder of a run)
    #[arg(short, long)]
    pub model_path: PathBuf,

    /// Dataset to run on
    #[arg(long)]
    pub dataset: PathBuf,

    /// Rows to use (full, training, validation, test)
    #[arg(long, default_value = "full")]
    pub split: String,

    /// Data format (auto, jsonl, json, csv)
    #[arg(long, default_value = "auto")]
    pub data_format: String,

    /// Batch size [default: the trainer's eval batch size]
    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Directory for result files; nothing is written without it
    #[arg(short, long)]
    pub output_directory: Option<PathBuf>,

    /// Do not write raw output tensors
    #[arg(long)]
    pub skip_save_unprocessed_output: bool,

    /// Do not write predictions.csv
    #[arg(long)]
    pub skip_save_predictions: bool,

    #[command(flatten)]
    pub backend: BackendArgs,
}

impl InferenceArgs {
    fn split(&self) -> Result<SplitSelection> {
        Ok(self.split.parse()?)
    }

    fn data_format(&self) -> Result<DataFormat> {
        Ok(self.data_format.parse()?)
    }

    async fn lifecycle(&self, cli_config: &CliConfig) -> Result<TrainingLifecycle> {
        let backend = select_backend(&self.backend, cli_config)?;
        TrainingLifecycle::load(&self.model_path, backend, ModelRegistry::default())
            .await
            .with_context(|| format!("Failed to load model from {}", self.model_path.display()))
    }
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub inference: InferenceArgs,

    /// Add confusion matrices, per-class and regression statistics
    #[arg(long)]
    pub collect_overall_stats: bool,

    /// Do not write test_statistics.json
    #[arg(long)]
    pub skip_save_eval_stats: bool,
}

pub type PredictArgs = InferenceArgs;

pub async fn execute(args: EvaluateArgs, cli_config: &CliConfig) -> Result<()> {
    let inference = &args.inference;
    let lifecycle = inference.lifecycle(cli_config).await?;
    let options = EvaluateOptions {
        split: inference.split()?,
        data_format: inference.data_format()?,
        batch_size: inference.batch_size,
        collect_predictions: !inference.skip_save_predictions,
        collect_overall_stats: args.collect_overall_stats,
        output_directory: inference.output_directory.clone(),
        skip_save_unprocessed_output: inference.skip_save_unprocessed_output,
        skip_save_predictions: inference.skip_save_predictions,
        skip_save_eval_stats: args.skip_save_eval_stats,
    };
    let results = lifecycle.evaluate(&DatasetSource::Path(inference.dataset.clone()), &options).await?;

    println!();
    println!("{}", "Evaluation".bold().cyan());
    for (feature, metrics) in &results.statistics {
        for (metric, value) in metrics.iter().filter(|(_, v)| v.is_number()) {
            println!("  {:<12} {:<12} {}", feature, metric, value);
        }
    }
    println!();
    Ok(())
}

pub async fn execute_predict(args: PredictArgs, cli_config: &CliConfig) -> Result<()> {
    let lifecycle = args.lifecycle(cli_config).await?;
    let options = PredictOptions {
        split: args.split()?,
        data_format: args.data_format()?,
        batch_size: args.batch_size,
        output_directory: args.output_directory.clone(),
        skip_save_unprocessed_output: args.skip_save_unprocessed_output,
        skip_save_predictions: args.skip_save_predictions,
    };
    let predictions = lifecycle.predict(&DatasetSource::Path(args.dataset.clone()), &options).await?;

    println!();
    println!("{}", format!("Predicted {} rows", predictions.num_rows).bold().green());
    if let Some(dir) = &args.output_directory {
        println!("  Output: {}", dir.display().to_string().cyan());
    }
    println!();
    Ok(())
}
