//! Per-row losses and split-level scalar metrics.

use crate::config::{ConfigModel, FeatureType, COMBINED, LOSS};
use crate::dataset::{EncodedColumn, ProcessedDataset};
use crate::error::{TrainingError, TrainingResult};
use crate::metadata::TrainingSetMetadata;
use crate::model::{sigmoid, softmax, FeatureOutputs, ModelOutputs};
use crate::stats::EvaluationStatistics;
use serde_json::json;
use std::collections::BTreeMap;

const PROBABILITY_EPSILON: f64 = 1e-12;

/// Ground truth of one row, as encoded.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Binary(f64),
    Number(f64),
    Category(usize),
    Vector(&'a [f64]),
}

impl<'a> Target<'a> {
    pub fn at(feature_type: FeatureType, column: &'a EncodedColumn, row: usize) -> TrainingResult<Self> {
        let target = match (feature_type, column) {
            (FeatureType::Binary, EncodedColumn::Scalars(v)) => v.get(row).map(|y| Self::Binary(*y)),
            (FeatureType::Number, EncodedColumn::Scalars(v)) => v.get(row).map(|y| Self::Number(*y)),
            (FeatureType::Category, EncodedColumn::Indices(v)) => v.get(row).map(|y| Self::Category(*y as usize)),
            (FeatureType::Vector, EncodedColumn::Vectors(v)) => v.get(row).map(|y| Self::Vector(y.as_slice())),
            _ => {
                return Err(TrainingError::Dataset(format!(
                    "encoded column does not match output type {}",
                    feature_type.as_str()
                )));
            }
        };
        target.ok_or_else(|| TrainingError::Dataset(format!("row {row} out of range")))
    }
}

/// Loss of one row and its gradient with respect to the logits.
pub fn loss_and_gradient(target: Target<'_>, logits: &[f64]) -> (f64, Vec<f64>) {
    match target {
        Target::Binary(y) => {
            let p = sigmoid(logits[0]).clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON);
            let loss = -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
            (loss, vec![p - y])
        }
        Target::Number(y) => {
            let d = logits[0] - y;
            (d * d, vec![d])
        }
        Target::Category(y) => {
            let mut p = softmax(logits);
            let loss = -p.get(y).copied().unwrap_or(0.0).max(PROBABILITY_EPSILON).ln();
            if let Some(py) = p.get_mut(y) {
                *py -= 1.0;
            }
            (loss, p)
        }
        Target::Vector(y) => {
            let grad: Vec<f64> = logits.iter().zip(y).map(|(z, t)| z - t).collect();
            let loss = grad.iter().map(|d| d * d).sum::<f64>() / grad.len().max(1) as f64;
            (loss, grad)
        }
    }
}

/// Class probabilities of one row: calibrated when the model reported them.
pub fn row_probabilities(feature_type: FeatureType, outputs: &FeatureOutputs, row: usize) -> Vec<f64> {
    if let Some(p) = outputs.probabilities.as_ref().and_then(|p| p.get(row)) {
        return p.clone();
    }
    let logits = &outputs.logits[row];
    match feature_type {
        FeatureType::Binary => {
            let p = sigmoid(logits[0]);
            vec![1.0 - p, p]
        }
        _ => softmax(logits),
    }
}

pub fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
        .0
}

/// Scalar metrics for every output feature plus the combined loss.
/// `dataset` must carry the output columns. Number errors are reported in
/// the original units when `metadata` is given, else on the encoded scale.
pub fn scalar_metrics(
    config: &ConfigModel,
    metadata: Option<&TrainingSetMetadata>,
    dataset: &ProcessedDataset,
    outputs: &ModelOutputs,
) -> TrainingResult<EvaluationStatistics> {
    let mut stats = EvaluationStatistics::new();
    let mut combined_loss = 0.0;
    let n = dataset.len();

    for feature in &config.output_features {
        let column = dataset.column(&feature.name).ok_or_else(|| {
            TrainingError::Dataset(format!("evaluation requires ground truth for output {}", feature.name))
        })?;
        let out = outputs
            .get(&feature.name)
            .ok_or_else(|| TrainingError::Training(format!("model produced no outputs for {}", feature.name)))?;

        let mut loss = 0.0;
        let mut correct = 0usize;
        let mut abs_err = 0.0;
        let mut sq_err = 0.0;
        let mut truths = Vec::with_capacity(n);

        for row in 0..n {
            let target = Target::at(feature.feature_type, column, row)?;
            let logits = &out.logits[row];
            loss += loss_and_gradient(target, logits).0;
            match target {
                Target::Binary(y) => {
                    let p = row_probabilities(feature.feature_type, out, row);
                    correct += usize::from((p[1] >= 0.5) == (y >= 0.5));
                }
                Target::Category(y) => {
                    let p = row_probabilities(feature.feature_type, out, row);
                    correct += usize::from(argmax(&p) == y);
                }
                Target::Number(y) => {
                    let (pred, truth) = match metadata {
                        Some(metadata) => {
                            let number = metadata.get(&feature.name)?;
                            (number.denormalize(logits[0]), number.denormalize(y))
                        }
                        None => (logits[0], y),
                    };
                    abs_err += (pred - truth).abs();
                    sq_err += (pred - truth).powi(2);
                    truths.push(truth);
                }
                Target::Vector(y) => {
                    for (z, t) in logits.iter().zip(y) {
                        abs_err += (z - t).abs() / y.len().max(1) as f64;
                        sq_err += (z - t).powi(2) / y.len().max(1) as f64;
                    }
                }
            }
        }

        let denom = n.max(1) as f64;
        let mean_loss = loss / denom;
        combined_loss += mean_loss;

        let mut metrics = BTreeMap::new();
        metrics.insert(LOSS.to_string(), json!(mean_loss));
        match feature.feature_type {
            FeatureType::Binary | FeatureType::Category => {
                metrics.insert("accuracy".to_string(), json!(correct as f64 / denom));
            }
            FeatureType::Number => {
                let mse = sq_err / denom;
                metrics.insert("mae".to_string(), json!(abs_err / denom));
                metrics.insert("mse".to_string(), json!(mse));
                metrics.insert("rmse".to_string(), json!(mse.sqrt()));
                let mean = truths.iter().sum::<f64>() / denom;
                let total: f64 = truths.iter().map(|t| (t - mean).powi(2)).sum();
                if total > 0.0 {
                    metrics.insert("r2".to_string(), json!(1.0 - sq_err / total));
                }
            }
            FeatureType::Vector | FeatureType::Timeseries => {
                metrics.insert("mae".to_string(), json!(abs_err / denom));
                metrics.insert("mse".to_string(), json!(sq_err / denom));
            }
        }
        stats.insert(feature.name.clone(), metrics);
    }

    let mut combined = BTreeMap::new();
    combined.insert(LOSS.to_string(), json!(combined_loss));
    stats.insert(COMBINED.to_string(), combined);
    Ok(stats)
}
