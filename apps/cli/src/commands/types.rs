//! Argument groups shared by several commands.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use strata_training::config::DEFAULT_RANDOM_SEED;
use strata_training::{DataFormat, DatasetSource, DatasetSources, SkipSave, TrainingSetMetadata};

/// Where the model config comes from.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Model config file (YAML or JSON)
    #[arg(short, long, required_unless_present = "config_str", conflicts_with = "config_str")]
    pub config: Option<PathBuf>,

    /// Model config as an inline YAML or JSON document
    #[arg(long)]
    pub config_str: Option<String>,

    /// Continue past warnings about experimental config sections without asking
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DatasetArgs {
    /// Combined dataset, split by its `split` column or at random
    #[arg(long, required_unless_present = "training_set")]
    pub dataset: Option<PathBuf>,

    /// Training split
    #[arg(long)]
    pub training_set: Option<PathBuf>,

    /// Validation split
    #[arg(long, requires = "training_set")]
    pub validation_set: Option<PathBuf>,

    /// Test split
    #[arg(long, requires = "training_set")]
    pub test_set: Option<PathBuf>,

    /// Training set metadata from an earlier run (JSON)
    #[arg(long)]
    pub training_set_metadata: Option<PathBuf>,

    /// Data format (auto, jsonl, json, csv)
    #[arg(long, default_value = "auto")]
    pub data_format: String,
}

impl DatasetArgs {
    pub fn sources(&self) -> Result<DatasetSources> {
        let path = |p: &Option<PathBuf>| p.clone().map(DatasetSource::Path);
        let training_set_metadata = match &self.training_set_metadata {
            Some(path) => Some(
                strata_training::artifacts::load_json::<TrainingSetMetadata>(path)
                    .with_context(|| format!("Failed to load training set metadata from {}", path.display()))?,
            ),
            None => None,
        };
        Ok(DatasetSources {
            dataset: path(&self.dataset),
            training_set: path(&self.training_set),
            validation_set: path(&self.validation_set),
            test_set: path(&self.test_set),
            training_set_metadata,
            data_format: self.data_format()?,
        })
    }

    pub fn data_format(&self) -> Result<DataFormat> {
        Ok(self.data_format.parse()?)
    }
}

/// Which artifacts a run leaves out.
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct SkipSaveArgs {
    /// Do not write description.json
    #[arg(long)]
    pub skip_save_training_description: bool,

    /// Do not write training_statistics.json
    #[arg(long)]
    pub skip_save_training_statistics: bool,

    /// Do not save the model, its config or the training set metadata
    #[arg(long)]
    pub skip_save_model: bool,

    /// Do not save resumable training progress
    #[arg(long)]
    pub skip_save_progress: bool,

    /// Do not write the per-checkpoint training log
    #[arg(long)]
    pub skip_save_log: bool,

    /// Do not cache the preprocessed dataset next to the source
    #[arg(long)]
    pub skip_save_processed_input: bool,
}

impl From<SkipSaveArgs> for SkipSave {
    fn from(args: SkipSaveArgs) -> Self {
        Self {
            training_description: args.skip_save_training_description,
            training_statistics: args.skip_save_training_statistics,
            model: args.skip_save_model,
            progress: args.skip_save_progress,
            log: args.skip_save_log,
            processed_input: args.skip_save_processed_input,
        }
    }
}

/// Run naming, placement and execution.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Experiment name, the first half of the run directory name
    #[arg(long, default_value = "experiment")]
    pub experiment_name: String,

    /// Model name, the second half of the run directory name
    #[arg(long, default_value = "run")]
    pub model_name: String,

    /// Parent directory for run outputs [default: results]
    #[arg(short, long)]
    pub output_directory: Option<PathBuf>,

    /// Resume the run stored in this directory
    #[arg(long)]
    pub model_resume_path: Option<PathBuf>,

    /// Seed for splitting, shuffling and weight initialisation
    #[arg(long, default_value_t = DEFAULT_RANDOM_SEED)]
    pub random_seed: u64,

    #[command(flatten)]
    pub skip: SkipSaveArgs,

    #[command(flatten)]
    pub backend: BackendArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct BackendArgs {
    /// Execution backend [default: local]
    #[arg(long)]
    pub backend: Option<String>,

    /// Comma separated GPU ids
    #[arg(long)]
    pub gpus: Option<String>,
}
