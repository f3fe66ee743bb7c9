use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

pub const DESCRIPTION_FILE_NAME: &str = "description.json";
pub const TRAINING_STATISTICS_FILE_NAME: &str = "training_statistics.json";
pub const MODEL_DIR_NAME: &str = "model";
pub const MODEL_HYPERPARAMETERS_FILE_NAME: &str = "model_hyperparameters.json";
pub const TRAIN_SET_METADATA_FILE_NAME: &str = "training_set_metadata.json";
pub const MODEL_WEIGHTS_FILE_NAME: &str = "model_weights.json";
pub const TRAINING_PROGRESS_FILE_NAME: &str = "training_progress.json";
pub const TRAINING_CHECKPOINTS_DIR_NAME: &str = "training_checkpoints";
pub const TEST_STATISTICS_FILE_NAME: &str = "test_statistics.json";
pub const PREDICTIONS_FILE_NAME: &str = "predictions.csv";

/// Filesystem layout of a single run.
///
/// ```text
/// <output_dir>/description.json
/// <output_dir>/training_statistics.json
/// <output_dir>/model/model_hyperparameters.json
/// <output_dir>/model/training_set_metadata.json
/// <output_dir>/model/...trainer checkpoints
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn description_path(&self) -> PathBuf {
        self.root.join(DESCRIPTION_FILE_NAME)
    }

    #[must_use]
    pub fn training_statistics_path(&self) -> PathBuf {
        self.root.join(TRAINING_STATISTICS_FILE_NAME)
    }

    #[must_use]
    pub fn model_dir(&self) -> PathBuf {
        self.root.join(MODEL_DIR_NAME)
    }

    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        self.model_dir().join(TRAIN_SET_METADATA_FILE_NAME)
    }

    pub fn ensure_root(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn ensure_model_dir(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(self.model_dir())?;
        Ok(())
    }
}

/// Resolve `<output_root>/<experiment>_<model>`, appending `_0`, `_1`, ...
/// until the path does not exist yet. Nothing is created.
#[must_use]
pub fn resolve_output_directory(output_root: &Path, experiment_name: &str, model_name: &str) -> PathBuf {
    let base = output_root.join(format!("{experiment_name}_{model_name}"));
    let mut candidate = base.clone();
    let mut suffix = 0u32;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}_{suffix}", base.display()));
        suffix += 1;
    }
    candidate
}
