//! Resolved model configuration.
//!
//! A [`ConfigModel`] is produced once per run from YAML or JSON and is treated
//! as read-only afterwards, with one exception: the [`Tunable`] trainer fields
//! (`batch_size`, `eval_batch_size`, `learning_rate`) move from `Auto` to a
//! concrete value exactly once, before the first training step.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::MODEL_HYPERPARAMETERS_FILE_NAME;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_BATCH_SIZE: u64 = 128;
pub const MAX_POSSIBLE_BATCH_SIZE: u64 = 1 << 40;
pub const DEFAULT_RANDOM_SEED: u64 = 42;
pub const COMBINED: &str = "combined";
pub const LOSS: &str = "loss";

/// Model kinds known to the system. Constructors are bound per kind in
/// [`crate::model::ModelRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[default]
    Ecd,
    Gbm,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ecd => "ecd",
            Self::Gbm => "gbm",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ecd" => Ok(Self::Ecd),
            "gbm" => Ok(Self::Gbm),
            other => Err(TrainingError::UnknownModelType(other.to_string())),
        }
    }
}

/// A hyperparameter that is either fixed by the user or discovered by a probe.
///
/// Serialized as the string `"auto"` or as the bare value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tunable<T> {
    Auto,
    Fixed(T),
}

impl<T: Copy> Tunable<T> {
    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }

    pub fn fixed(&self) -> Option<T> {
        match self {
            Self::Auto => None,
            Self::Fixed(v) => Some(*v),
        }
    }
}

impl<T: Serialize> Serialize for Tunable<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Fixed(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Tunable<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            Value(T),
            Keyword(String),
        }

        match Repr::<T>::deserialize(deserializer)? {
            Repr::Value(v) => Ok(Self::Fixed(v)),
            Repr::Keyword(k) if k == "auto" => Ok(Self::Auto),
            Repr::Keyword(k) => Err(serde::de::Error::custom(format!("expected a value or \"auto\", got {k:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Binary,
    Number,
    Category,
    Vector,
    Timeseries,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Number => "number",
            Self::Category => "category",
            Self::Vector => "vector",
            Self::Timeseries => "timeseries",
        }
    }

    /// Output types whose predictions are class probabilities.
    pub fn is_probabilistic(&self) -> bool {
        matches!(self, Self::Binary | Self::Category)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingValueStrategy {
    FillWithConst,
    FillWithMode,
    FillWithMean,
    DropRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    Zscore,
    Minmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tokenizer {
    #[default]
    Space,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    Left,
    #[default]
    Right,
}

/// Per-feature preprocessing parameters. Unset fields fall back to the
/// defaults of the feature type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeaturePreprocessing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_value_strategy: Option<MissingValueStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<Normalization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub most_common: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<Tokenizer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeseries_length_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<Padding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub feature_type: FeatureType,
    /// Source column; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default)]
    pub preprocessing: FeaturePreprocessing,
    /// Fit a temperature on held-out data after training (outputs only).
    #[serde(default)]
    pub calibration: bool,

    // Filled in from training-set metadata before the model is built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sequence_length: Option<usize>,
}

impl FeatureConfig {
    pub fn new(name: impl Into<String>, feature_type: FeatureType) -> Self {
        Self {
            name: name.into(),
            feature_type,
            column: None,
            preprocessing: FeaturePreprocessing::default(),
            calibration: false,
            vocab_size: None,
            num_classes: None,
            vector_size: None,
            max_sequence_length: None,
        }
    }

    pub fn column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    pub fn missing_value_strategy(&self, is_output: bool) -> MissingValueStrategy {
        if let Some(strategy) = self.preprocessing.missing_value_strategy {
            return strategy;
        }
        if is_output {
            return MissingValueStrategy::DropRow;
        }
        match self.feature_type {
            FeatureType::Number => MissingValueStrategy::FillWithMean,
            FeatureType::Binary | FeatureType::Category => MissingValueStrategy::FillWithMode,
            FeatureType::Vector | FeatureType::Timeseries => MissingValueStrategy::FillWithConst,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    /// Hard cap on optimizer steps; `epochs` decides when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_steps: Option<u64>,
    #[serde(default)]
    pub steps_per_checkpoint: u64,
    #[serde(default)]
    pub checkpoints_per_epoch: u32,
    /// Evaluation rounds without improvement before stopping; `-1` disables.
    #[serde(default = "default_early_stop")]
    pub early_stop: i32,
    #[serde(default = "default_batch_size")]
    pub batch_size: Tunable<u64>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_batch_size: Option<Tunable<u64>>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: Tunable<f64>,
    #[serde(default = "default_true")]
    pub evaluate_training_set: bool,
    #[serde(default = "default_validation_field")]
    pub validation_field: String,
    #[serde(default = "default_validation_metric")]
    pub validation_metric: String,
    #[serde(default = "default_true")]
    pub should_shuffle: bool,
    #[serde(default)]
    pub regularization_lambda: f64,
}

fn default_epochs() -> u32 {
    100
}

fn default_early_stop() -> i32 {
    5
}

fn default_batch_size() -> Tunable<u64> {
    Tunable::Fixed(DEFAULT_BATCH_SIZE)
}

fn default_max_batch_size() -> u64 {
    MAX_POSSIBLE_BATCH_SIZE
}

fn default_learning_rate() -> Tunable<f64> {
    Tunable::Fixed(0.001)
}

fn default_true() -> bool {
    true
}

fn default_validation_field() -> String {
    COMBINED.to_string()
}

fn default_validation_metric() -> String {
    LOSS.to_string()
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            train_steps: None,
            steps_per_checkpoint: 0,
            checkpoints_per_epoch: 0,
            early_stop: default_early_stop(),
            batch_size: default_batch_size(),
            max_batch_size: default_max_batch_size(),
            eval_batch_size: None,
            learning_rate: default_learning_rate(),
            evaluate_training_set: true,
            validation_field: default_validation_field(),
            validation_metric: default_validation_metric(),
            should_shuffle: true,
            regularization_lambda: 0.0,
        }
    }
}

impl TrainerConfig {
    pub fn needs_batch_size_tuning(&self) -> bool {
        self.batch_size.is_auto() || matches!(self.eval_batch_size, Some(Tunable::Auto))
    }

    pub fn needs_learning_rate_tuning(&self) -> bool {
        self.learning_rate.is_auto()
    }

    /// Concretize an `Auto` batch size. Returns whether a write happened.
    pub fn resolve_batch_size(&mut self, tuned: u64) -> bool {
        if self.batch_size.is_auto() {
            self.batch_size = Tunable::Fixed(tuned);
            return true;
        }
        false
    }

    /// Concretize an `Auto` or unset eval batch size.
    pub fn resolve_eval_batch_size(&mut self, tuned: u64) -> bool {
        match self.eval_batch_size {
            None | Some(Tunable::Auto) => {
                self.eval_batch_size = Some(Tunable::Fixed(tuned));
                true
            }
            Some(Tunable::Fixed(_)) => false,
        }
    }

    pub fn resolve_learning_rate(&mut self, tuned: f64) -> bool {
        if self.learning_rate.is_auto() {
            self.learning_rate = Tunable::Fixed(tuned);
            return true;
        }
        false
    }

    /// Eval batch size, falling back to the training batch size.
    pub fn effective_eval_batch_size(&self) -> Option<u64> {
        self.eval_batch_size
            .and_then(|b| b.fixed())
            .or_else(|| self.batch_size.fixed())
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::ConfigResolution("trainer.epochs must be >= 1".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(TrainingError::ConfigResolution("trainer.max_batch_size must be >= 1".to_string()));
        }
        for (field, value) in [("batch_size", Some(self.batch_size)), ("eval_batch_size", self.eval_batch_size)] {
            if let Some(Tunable::Fixed(size)) = value {
                if size == 0 {
                    return Err(TrainingError::ConfigResolution(format!("trainer.{field} must be >= 1")));
                }
                if size > self.max_batch_size {
                    return Err(TrainingError::ConfigResolution(format!(
                        "trainer.{field} ({size}) exceeds max_batch_size ({})",
                        self.max_batch_size
                    )));
                }
            }
        }
        if let Tunable::Fixed(rate) = self.learning_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(TrainingError::ConfigResolution("trainer.learning_rate must be > 0".to_string()));
            }
        }
        if self.steps_per_checkpoint > 0 && self.checkpoints_per_epoch > 0 {
            return Err(TrainingError::ConfigResolution(
                "it is invalid to specify both non-zero steps_per_checkpoint and non-zero checkpoints_per_epoch"
                    .to_string(),
            ));
        }
        if self.early_stop < -1 {
            return Err(TrainingError::ConfigResolution("trainer.early_stop must be >= -1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Column holding 0 (train), 1 (validation) or 2 (test).
    #[serde(default = "default_split_column")]
    pub column: String,
    /// Random split used when the column is absent.
    #[serde(default = "default_split_probabilities")]
    pub probabilities: [f64; 3],
}

fn default_split_column() -> String {
    "split".to_string()
}

fn default_split_probabilities() -> [f64; 3] {
    [0.7, 0.1, 0.2]
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self { column: default_split_column(), probabilities: default_split_probabilities() }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    #[serde(default)]
    pub split: SplitConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigModel {
    #[serde(default)]
    pub model_type: ModelType,
    pub input_features: Vec<FeatureConfig>,
    pub output_features: Vec<FeatureConfig>,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Experimental search section; ignored by training.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperopt: Option<serde_json::Value>,
    /// Set once the model has been built, so reloads read weights from the
    /// checkpoint instead of re-initialising them.
    #[serde(default)]
    pub saved_weights_in_checkpoint: bool,
}

impl ConfigModel {
    pub fn new(input_features: Vec<FeatureConfig>, output_features: Vec<FeatureConfig>) -> Self {
        Self {
            model_type: ModelType::default(),
            input_features,
            output_features,
            trainer: TrainerConfig::default(),
            preprocessing: PreprocessingConfig::default(),
            backend: None,
            hyperopt: None,
            saved_weights_in_checkpoint: false,
        }
    }

    /// Parse a JSON or YAML document.
    pub fn parse(text: &str) -> TrainingResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> TrainingResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn to_json_value(&self) -> TrainingResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn features(&self) -> impl Iterator<Item = (&FeatureConfig, bool)> {
        self.input_features
            .iter()
            .map(|f| (f, false))
            .chain(self.output_features.iter().map(|f| (f, true)))
    }

    pub fn output_feature(&self, name: &str) -> Option<&FeatureConfig> {
        self.output_features.iter().find(|f| f.name == name)
    }

    pub fn calibration_enabled(&self) -> bool {
        self.output_features.iter().any(|f| f.calibration)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.input_features.is_empty() {
            return Err(TrainingError::ConfigResolution("at least one input feature is required".to_string()));
        }
        if self.output_features.is_empty() {
            return Err(TrainingError::ConfigResolution("at least one output feature is required".to_string()));
        }

        let mut seen = BTreeSet::new();
        for (feature, _) in self.features() {
            if feature.name.trim().is_empty() {
                return Err(TrainingError::ConfigResolution("feature name must not be empty".to_string()));
            }
            if !seen.insert(feature.name.as_str()) {
                return Err(TrainingError::ConfigResolution(format!("duplicate feature name: {}", feature.name)));
            }
        }

        for feature in &self.output_features {
            if feature.calibration && !feature.feature_type.is_probabilistic() {
                return Err(TrainingError::ConfigResolution(format!(
                    "calibration is only supported for binary and category outputs, not {} ({})",
                    feature.name,
                    feature.feature_type.as_str()
                )));
            }
            if feature.feature_type == FeatureType::Timeseries {
                return Err(TrainingError::ConfigResolution(format!(
                    "timeseries is not supported as an output feature ({})",
                    feature.name
                )));
            }
        }

        let probabilities = self.preprocessing.split.probabilities;
        if probabilities.iter().any(|p| !(0.0..=1.0).contains(p)) || (probabilities.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err(TrainingError::ConfigResolution(format!(
                "preprocessing.split.probabilities must be in [0, 1] and sum to 1, got {probabilities:?}"
            )));
        }

        self.trainer.validate()
    }

    /// Write `model_hyperparameters.json` into `dir`.
    pub fn save(&self, dir: &Path) -> TrainingResult<()> {
        std::fs::create_dir_all(dir)?;
        crate::artifacts::save_json(&dir.join(MODEL_HYPERPARAMETERS_FILE_NAME), self)
    }

    pub fn load(dir: &Path) -> TrainingResult<Self> {
        let config: Self = crate::artifacts::load_json(&dir.join(MODEL_HYPERPARAMETERS_FILE_NAME))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const YAML: &str = r"
input_features:
  - name: age
    type: number
  - name: color
    type: category
output_features:
  - name: label
    type: binary
    calibration: true
trainer:
  epochs: 3
  batch_size: auto
  learning_rate: auto
";

    #[test]
    fn test_parses_auto_sentinels() {
        let config = ConfigModel::parse(YAML).unwrap();
        assert!(config.trainer.batch_size.is_auto());
        assert!(config.trainer.learning_rate.is_auto());
        assert!(config.trainer.needs_batch_size_tuning());
        assert_eq!(config.model_type, ModelType::Ecd);
        assert!(config.calibration_enabled());
    }

    #[test]
    fn test_tunable_rejects_other_keywords() {
        let err = serde_json::from_str::<Tunable<u64>>("\"huge\"");
        assert!(err.is_err());
        assert_eq!(serde_json::from_str::<Tunable<u64>>("64").unwrap(), Tunable::Fixed(64));
    }

    #[test]
    fn test_resolve_is_write_once() {
        let mut trainer = TrainerConfig { batch_size: Tunable::Auto, ..TrainerConfig::default() };
        assert!(trainer.resolve_batch_size(256));
        assert!(!trainer.resolve_batch_size(512));
        assert_eq!(trainer.batch_size, Tunable::Fixed(256));
        assert!(trainer.resolve_eval_batch_size(256));
        assert_eq!(trainer.effective_eval_batch_size(), Some(256));
    }

    #[test]
    fn test_conflicting_checkpoint_settings_rejected() {
        let mut config = ConfigModel::parse(YAML).unwrap();
        config.trainer.steps_per_checkpoint = 10;
        config.trainer.checkpoints_per_epoch = 2;
        assert!(matches!(config.validate(), Err(TrainingError::ConfigResolution(_))));
    }

    #[test]
    fn test_calibration_on_number_output_rejected() {
        let mut config = ConfigModel::parse(YAML).unwrap();
        config.output_features[0].feature_type = FeatureType::Number;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_model_type_fails_closed() {
        assert!(matches!("transformer".parse::<ModelType>(), Err(TrainingError::UnknownModelType(_))));
        assert_eq!("gbm".parse::<ModelType>().unwrap(), ModelType::Gbm);
    }

    #[test]
    fn test_save_then_load_reproduces_config() {
        let temp = TempDir::new().unwrap();
        let mut config = ConfigModel::parse(YAML).unwrap();
        config.trainer.resolve_batch_size(32);
        config.trainer.resolve_eval_batch_size(32);
        config.trainer.resolve_learning_rate(0.01);
        config.output_features[0].num_classes = Some(2);

        config.save(temp.path()).unwrap();
        let reloaded = ConfigModel::load(temp.path()).unwrap();
        assert_eq!(reloaded, config);
    }
}
