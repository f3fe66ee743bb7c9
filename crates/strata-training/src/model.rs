use crate::config::{ConfigModel, ModelType};
use crate::dataset::ProcessedDataset;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Raw model outputs for one output feature, one row per example.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureOutputs {
    /// A single value for binary and number outputs, one score per class for
    /// category outputs, the elements of a vector output.
    pub logits: Vec<Vec<f64>>,
    /// Calibrated class probabilities: `[p_false, p_true]` for binary,
    /// one per class for category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<Vec<Vec<f64>>>,
}

/// Output feature name -> outputs.
pub type ModelOutputs = BTreeMap<String, FeatureOutputs>;

/// Temperature applied to the logits of a probabilistic output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub temperature: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self { temperature: 1.0 }
    }
}

/// Learnable parameters plus the resolved config they were built from.
///
/// The lifecycle owns exactly one `Box<dyn Model>` and hands clones to the
/// trainer; it replaces its own with whatever the trainer returns.
pub trait Model: Send + Sync + fmt::Debug {
    fn model_type(&self) -> ModelType;

    fn config(&self) -> &ConfigModel;

    fn clone_box(&self) -> Box<dyn Model>;

    fn predict(&self, dataset: &ProcessedDataset) -> TrainingResult<ModelOutputs>;

    fn calibration(&self, _feature: &str) -> Option<CalibrationParams> {
        None
    }

    fn set_calibration(&mut self, feature: &str, _params: CalibrationParams) -> TrainingResult<()> {
        Err(TrainingError::UnsupportedOperation(format!(
            "{} models do not support calibration ({feature})",
            self.model_type()
        )))
    }

    /// Deterministic: saving the same weights twice yields identical bytes.
    fn save_weights(&self, dir: &Path) -> TrainingResult<()>;

    fn load_weights(&mut self, dir: &Path) -> TrainingResult<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn Model> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Numerically stable softmax of one row of scores.
pub fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
