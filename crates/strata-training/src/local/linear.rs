use crate::artifacts::{load_json, save_json};
use crate::config::{ConfigModel, FeatureType, ModelType};
use crate::dataset::{EncodedColumn, ProcessedDataset};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::MODEL_WEIGHTS_FILE_NAME;
use crate::metadata::TrainingSetMetadata;
use crate::metrics::{loss_and_gradient, Target};
use crate::model::{sigmoid, softmax, CalibrationParams, FeatureOutputs, Model, ModelOutputs};
use crate::registry::ModelFactory;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;

const INIT_SCALE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSlot {
    pub name: String,
    pub width: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputHead {
    pub feature_type: FeatureType,
    /// `[output][input]`
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationParams>,
}

impl OutputHead {
    fn forward(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(w, b)| w.iter().zip(x).map(|(wi, xi)| wi * xi).sum::<f64>() + b)
            .collect()
    }

    fn probabilities(&self, logits: &[f64]) -> Option<Vec<f64>> {
        let t = self.calibration.map_or(1.0, |c| c.temperature);
        match self.feature_type {
            FeatureType::Binary => {
                let p = sigmoid(logits[0] / t);
                Some(vec![1.0 - p, p])
            }
            FeatureType::Category => Some(softmax(&logits.iter().map(|z| z / t).collect::<Vec<_>>())),
            _ => None,
        }
    }
}

/// Everything persisted for a [`LinearModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearWeights {
    pub inputs: Vec<InputSlot>,
    pub heads: BTreeMap<String, OutputHead>,
}

/// One linear head per output over the concatenated encoded inputs.
/// Category inputs are one-hot encoded.
#[derive(Debug, Clone)]
pub struct LinearModel {
    config: ConfigModel,
    weights: LinearWeights,
}

impl LinearModel {
    pub fn new(config: &ConfigModel, metadata: &TrainingSetMetadata, random_seed: u64) -> TrainingResult<Self> {
        if config.model_type != ModelType::Ecd {
            return Err(TrainingError::UnsupportedOperation(format!(
                "linear models implement ecd, not {}",
                config.model_type
            )));
        }

        let inputs = config
            .input_features
            .iter()
            .map(|f| Ok(InputSlot { name: f.name.clone(), width: metadata.get(&f.name)?.encoded_width() }))
            .collect::<TrainingResult<Vec<_>>>()?;
        let input_width: usize = inputs.iter().map(|s| s.width).sum();

        let mut rng = StdRng::seed_from_u64(random_seed);
        let mut heads = BTreeMap::new();
        for feature in &config.output_features {
            let out_width = match feature.feature_type {
                FeatureType::Binary | FeatureType::Number => 1,
                FeatureType::Category | FeatureType::Vector => metadata.get(&feature.name)?.encoded_width(),
                FeatureType::Timeseries => {
                    return Err(TrainingError::UnsupportedOperation(format!(
                        "timeseries output {} is not supported",
                        feature.name
                    )));
                }
            };
            let weights = (0..out_width)
                .map(|_| (0..input_width).map(|_| rng.gen_range(-INIT_SCALE..INIT_SCALE)).collect())
                .collect();
            heads.insert(
                feature.name.clone(),
                OutputHead { feature_type: feature.feature_type, weights, bias: vec![0.0; out_width], calibration: None },
            );
        }

        Ok(Self { config: config.clone(), weights: LinearWeights { inputs, heads } })
    }

    pub fn weights(&self) -> &LinearWeights {
        &self.weights
    }

    pub fn input_width(&self) -> usize {
        self.weights.inputs.iter().map(|s| s.width).sum()
    }

    pub fn output_width(&self) -> usize {
        self.weights.heads.values().map(|h| h.bias.len()).sum()
    }

    /// Dense input rows, in input-feature order.
    pub fn design_matrix(&self, dataset: &ProcessedDataset) -> TrainingResult<Vec<Vec<f64>>> {
        let width = self.input_width();
        let mut rows = vec![Vec::with_capacity(width); dataset.len()];
        for slot in &self.weights.inputs {
            let column = dataset
                .column(&slot.name)
                .ok_or_else(|| TrainingError::Dataset(format!("missing input column {}", slot.name)))?;
            for (i, row) in rows.iter_mut().enumerate() {
                match column {
                    EncodedColumn::Scalars(v) => row.push(v[i]),
                    EncodedColumn::Indices(v) => {
                        let mut one_hot = vec![0.0; slot.width];
                        if let Some(cell) = one_hot.get_mut(v[i] as usize) {
                            *cell = 1.0;
                        }
                        row.extend(one_hot);
                    }
                    EncodedColumn::Vectors(v) => {
                        let mut values = v[i].clone();
                        values.resize(slot.width, 0.0);
                        row.extend(values);
                    }
                }
            }
        }
        Ok(rows)
    }

    /// One gradient step over `rows`; returns the mean loss before the update.
    pub fn sgd_step(
        &mut self,
        x: &[Vec<f64>],
        dataset: &ProcessedDataset,
        rows: &[usize],
        learning_rate: f64,
        regularization_lambda: f64,
    ) -> TrainingResult<f64> {
        if rows.is_empty() {
            return Ok(0.0);
        }
        let scale = 1.0 / rows.len() as f64;
        let mut total_loss = 0.0;

        for (name, head) in &mut self.weights.heads {
            let column = dataset
                .column(name)
                .ok_or_else(|| TrainingError::Dataset(format!("missing output column {name}")))?;
            let mut grad_w = vec![vec![0.0; x.first().map_or(0, Vec::len)]; head.bias.len()];
            let mut grad_b = vec![0.0; head.bias.len()];

            for &row in rows {
                let target = Target::at(head.feature_type, column, row)?;
                let (loss, dz) = loss_and_gradient(target, &head.forward(&x[row]));
                total_loss += loss;
                for (o, d) in dz.iter().enumerate() {
                    grad_b[o] += d;
                    for (g, xi) in grad_w[o].iter_mut().zip(&x[row]) {
                        *g += d * xi;
                    }
                }
            }

            for (o, w_row) in head.weights.iter_mut().enumerate() {
                for (w, g) in w_row.iter_mut().zip(&grad_w[o]) {
                    *w -= learning_rate * (g * scale + regularization_lambda * *w);
                }
                head.bias[o] -= learning_rate * grad_b[o] * scale;
            }
        }
        Ok(total_loss * scale)
    }

    /// Mean summed loss over `rows`.
    pub fn loss(&self, x: &[Vec<f64>], dataset: &ProcessedDataset, rows: &[usize]) -> TrainingResult<f64> {
        let mut total = 0.0;
        for (name, head) in &self.weights.heads {
            let column = dataset
                .column(name)
                .ok_or_else(|| TrainingError::Dataset(format!("missing output column {name}")))?;
            for &row in rows {
                let target = Target::at(head.feature_type, column, row)?;
                total += loss_and_gradient(target, &head.forward(&x[row])).0;
            }
        }
        Ok(total / rows.len().max(1) as f64)
    }
}

impl Model for LinearModel {
    fn model_type(&self) -> ModelType {
        ModelType::Ecd
    }

    fn config(&self) -> &ConfigModel {
        &self.config
    }

    fn clone_box(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }

    fn predict(&self, dataset: &ProcessedDataset) -> TrainingResult<ModelOutputs> {
        let x = self.design_matrix(dataset)?;
        let mut outputs = ModelOutputs::new();
        for (name, head) in &self.weights.heads {
            let logits: Vec<Vec<f64>> = x.iter().map(|row| head.forward(row)).collect();
            let probabilities = if head.feature_type.is_probabilistic() {
                Some(logits.iter().filter_map(|z| head.probabilities(z)).collect())
            } else {
                None
            };
            outputs.insert(name.clone(), FeatureOutputs { logits, probabilities });
        }
        Ok(outputs)
    }

    fn calibration(&self, feature: &str) -> Option<CalibrationParams> {
        self.weights.heads.get(feature).and_then(|h| h.calibration)
    }

    fn set_calibration(&mut self, feature: &str, params: CalibrationParams) -> TrainingResult<()> {
        let head = self
            .weights
            .heads
            .get_mut(feature)
            .ok_or_else(|| TrainingError::Training(format!("no output head named {feature}")))?;
        if !head.feature_type.is_probabilistic() {
            return Err(TrainingError::UnsupportedOperation(format!(
                "calibration of {} output {feature}",
                head.feature_type.as_str()
            )));
        }
        head.calibration = Some(params);
        Ok(())
    }

    fn save_weights(&self, dir: &Path) -> TrainingResult<()> {
        std::fs::create_dir_all(dir)?;
        save_json(&dir.join(MODEL_WEIGHTS_FILE_NAME), &self.weights)
    }

    fn load_weights(&mut self, dir: &Path) -> TrainingResult<()> {
        let weights: LinearWeights = load_json(&dir.join(MODEL_WEIGHTS_FILE_NAME))?;
        if weights.inputs != self.weights.inputs || weights.heads.keys().ne(self.weights.heads.keys()) {
            return Err(TrainingError::Artifact(format!(
                "weights in {} do not match the model structure",
                dir.display()
            )));
        }
        self.weights = weights;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinearModelFactory;

impl ModelFactory for LinearModelFactory {
    fn create(
        &self,
        config: &ConfigModel,
        metadata: &TrainingSetMetadata,
        random_seed: u64,
    ) -> TrainingResult<Box<dyn Model>> {
        Ok(Box::new(LinearModel::new(config, metadata, random_seed)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfig;
    use crate::dataset::RawFrame;
    use crate::artifacts::sha256_file;
    use serde_json::json;
    use tempfile::TempDir;

    fn fixture() -> (ConfigModel, TrainingSetMetadata, ProcessedDataset) {
        let config = ConfigModel::new(
            vec![FeatureConfig::new("x", FeatureType::Number), FeatureConfig::new("c", FeatureType::Category)],
            vec![FeatureConfig::new("y", FeatureType::Binary)],
        );
        let rows = (0..40)
            .filter_map(|i| {
                let x = f64::from(i) / 10.0 - 2.0;
                json!({"x": x, "c": if i % 2 == 0 { "a" } else { "b" }, "y": x > 0.0}).as_object().cloned()
            })
            .collect();
        let frame = RawFrame::new(rows);
        let metadata = TrainingSetMetadata::fit(&config, &frame).unwrap();
        let dataset = metadata.encode(&config, &frame, true).unwrap();
        (config, metadata, dataset)
    }

    #[test]
    fn test_design_matrix_one_hot() {
        let (config, metadata, dataset) = fixture();
        let model = LinearModel::new(&config, &metadata, 1).unwrap();
        let x = model.design_matrix(&dataset).unwrap();
        // x + (<UNK>, a, b)
        assert_eq!(model.input_width(), 4);
        assert_eq!(x[0].len(), 4);
        assert_eq!(x[0][1..].iter().sum::<f64>(), 1.0);
    }

    #[test]
    fn test_sgd_reduces_loss() {
        let (config, metadata, dataset) = fixture();
        let mut model = LinearModel::new(&config, &metadata, 1).unwrap();
        let x = model.design_matrix(&dataset).unwrap();
        let rows: Vec<usize> = (0..dataset.len()).collect();

        let before = model.loss(&x, &dataset, &rows).unwrap();
        for _ in 0..200 {
            model.sgd_step(&x, &dataset, &rows, 0.5, 0.0).unwrap();
        }
        assert!(model.loss(&x, &dataset, &rows).unwrap() < before);
    }

    #[test]
    fn test_save_weights_twice_is_byte_identical() {
        let temp = TempDir::new().unwrap();
        let (config, metadata, _) = fixture();
        let model = LinearModel::new(&config, &metadata, 7).unwrap();

        model.save_weights(temp.path()).unwrap();
        let first = sha256_file(&temp.path().join(MODEL_WEIGHTS_FILE_NAME)).unwrap();
        model.save_weights(temp.path()).unwrap();
        assert_eq!(first, sha256_file(&temp.path().join(MODEL_WEIGHTS_FILE_NAME)).unwrap());

        let mut reloaded = LinearModel::new(&config, &metadata, 99).unwrap();
        reloaded.load_weights(temp.path()).unwrap();
        assert_eq!(reloaded.weights(), model.weights());
    }

    #[test]
    fn test_calibration_only_on_probabilistic_heads() {
        let (config, metadata, _) = fixture();
        let mut model = LinearModel::new(&config, &metadata, 1).unwrap();
        model.set_calibration("y", CalibrationParams { temperature: 2.0 }).unwrap();
        assert_eq!(model.calibration("y"), Some(CalibrationParams { temperature: 2.0 }));
        assert!(model.set_calibration("nope", CalibrationParams::default()).is_err());
    }

    #[test]
    fn test_gbm_fails_closed() {
        let (mut config, metadata, _) = fixture();
        config.model_type = ModelType::Gbm;
        assert!(LinearModel::new(&config, &metadata, 1).unwrap_err().is_unsupported());
    }
}
