//! Command implementations for the Strata CLI.

pub mod evaluate;
pub mod kfold;
pub mod train;
pub mod types;

use crate::config::CliConfig;
use anyhow::{bail, Context, Result};
use inquire::InquireError;
use std::path::PathBuf;
use std::sync::Arc;
use strata_training::{Backend, ConfigModel, LocalBackend};
use tracing::warn;
use types::{BackendArgs, ConfigArgs};

pub use evaluate::{EvaluateArgs, PredictArgs};
pub use kfold::KFoldArgs;
pub use train::{ExperimentArgs, TrainArgs};

const DEFAULT_OUTPUT_DIRECTORY: &str = "results";

/// Read the model config and clear any experimental section the user
/// agreed to drop. Declining is an error.
pub fn load_model_config(args: &ConfigArgs) -> Result<ConfigModel> {
    let mut config = match (&args.config, &args.config_str) {
        (Some(path), _) => ConfigModel::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        (None, Some(text)) => ConfigModel::parse(text).context("Failed to parse inline config")?,
        (None, None) => bail!("Either --config or --config-str is required"),
    };

    if config.hyperopt.is_some() {
        warn!("The hyperopt section is experimental and is not used for training");
        if !args.yes && !confirm("Continue and train without hyperparameter optimization?")? {
            bail!("Aborted: training was not confirmed");
        }
        config.hyperopt = None;
    }
    Ok(config)
}

fn confirm(message: &str) -> Result<bool> {
    match inquire::Confirm::new(message).with_default(false).prompt() {
        Ok(answer) => Ok(answer),
        Err(InquireError::NotTTY) => {
            warn!("No terminal to confirm on, pass --yes to continue");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn select_backend(args: &BackendArgs, cli_config: &CliConfig) -> Result<Arc<dyn Backend>> {
    let name = args.backend.as_deref().or(cli_config.backend.as_deref()).unwrap_or("local");
    match name {
        "local" => {
            if let Some(gpus) = &args.gpus {
                warn!(gpus = %gpus, "The local backend runs on the CPU, ignoring --gpus");
            }
            Ok(Arc::new(LocalBackend::new()))
        }
        other => bail!("Unknown backend: {}. Supported: local", other),
    }
}

pub fn output_directory(requested: Option<PathBuf>, cli_config: &CliConfig) -> PathBuf {
    requested
        .or_else(|| cli_config.output_directory.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIRECTORY))
}
