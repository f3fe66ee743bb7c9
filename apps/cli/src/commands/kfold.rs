//! `strata kfold`.

use super::types::{BackendArgs, ConfigArgs, SkipSaveArgs};
use super::{load_model_config, output_directory, select_backend};
use crate::config::CliConfig;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use strata_training::config::DEFAULT_RANDOM_SEED;
use strata_training::{kfold_cross_validate, CallbackBus, DatasetSource, KFoldOptions, ModelRegistry};

#[derive(Args, Debug, Clone)]
pub struct KFoldArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Dataset to fold
    #[arg(long)]
    pub dataset: PathBuf,

    /// Number of folds
    #[arg(short = 'k', long, default_value_t = 5)]
    pub num_folds: usize,

    /// Data format (auto, jsonl, json, csv)
    #[arg(long, default_value = "auto")]
    pub data_format: String,

    /// Directory for kfold_training_statistics.json [default: results]
    #[arg(short, long)]
    pub output_directory: Option<PathBuf>,

    /// Seed for fold assignment and training
    #[arg(long, default_value_t = DEFAULT_RANDOM_SEED)]
    pub random_seed: u64,

    #[command(flatten)]
    pub skip: SkipSaveArgs,

    #[command(flatten)]
    pub backend: BackendArgs,
}

pub async fn execute(args: KFoldArgs, cli_config: &CliConfig) -> Result<()> {
    let config = load_model_config(&args.config)?;
    let backend = select_backend(&args.backend, cli_config)?;
    let options = KFoldOptions {
        num_folds: args.num_folds,
        random_seed: args.random_seed,
        data_format: args.data_format.parse()?,
        skip_save: args.skip.into(),
        output_directory: Some(output_directory(args.output_directory, cli_config)),
    };

    let results = kfold_cross_validate(
        &config,
        &DatasetSource::Path(args.dataset),
        &options,
        backend.clone(),
        &ModelRegistry::default(),
        &CallbackBus::new(),
    )
    .await?;

    if backend.is_coordinator() {
        println!();
        println!("{}", format!("{}-fold cross validation", results.folds.len()).bold().green());
        for (feature, metrics) in &results.overall {
            for (metric, summary) in metrics {
                println!("  {:<12} {:<12} {:.4} ± {:.4}", feature, metric, summary.mean, summary.std);
            }
        }
        println!();
    }
    Ok(())
}
