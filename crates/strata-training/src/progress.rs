use crate::error::TrainingResult;
use crate::layout::TRAINING_PROGRESS_FILE_NAME;
use crate::stats::MetricHistory;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Trainer state at a checkpoint. Persisted next to the latest weights so an
/// interrupted run can continue from it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainingProgress {
    pub epoch: u32,
    pub steps: u64,
    pub checkpoint_number: u32,
    pub batch_size: u64,
    pub learning_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_eval_metric_value: Option<f64>,
    pub best_eval_metric_steps: u64,
    pub best_eval_metric_checkpoint_number: u32,
    /// Checkpoints evaluated since the tracked metric last improved.
    pub checkpoints_since_improvement: u32,
    pub train_metrics: MetricHistory,
    pub validation_metrics: MetricHistory,
    pub test_metrics: MetricHistory,
}

impl TrainingProgress {
    pub fn new(batch_size: u64, learning_rate: f64) -> Self {
        Self { batch_size, learning_rate, ..Self::default() }
    }

    pub fn save(&self, dir: &Path) -> TrainingResult<()> {
        std::fs::create_dir_all(dir)?;
        crate::artifacts::save_json(&dir.join(TRAINING_PROGRESS_FILE_NAME), self)
    }

    /// `None` when `dir` holds no saved progress.
    pub fn load(dir: &Path) -> TrainingResult<Option<Self>> {
        let path = dir.join(TRAINING_PROGRESS_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        crate::artifacts::load_json(&path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_progress_save_and_load() {
        let temp = TempDir::new().unwrap();
        assert!(TrainingProgress::load(temp.path()).unwrap().is_none());

        let mut progress = TrainingProgress::new(32, 0.01);
        progress.epoch = 3;
        progress.steps = 120;
        progress.best_eval_metric_value = Some(0.25);
        progress.save(temp.path()).unwrap();

        assert_eq!(TrainingProgress::load(temp.path()).unwrap(), Some(progress));
    }
}
