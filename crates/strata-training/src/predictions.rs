//! Decoding raw model outputs back into feature-native values, overall
//! statistics, and the files an inference call leaves behind.

use crate::config::{ConfigModel, FeatureType};
use crate::dataset::{EncodedColumn, ProcessedDataset};
use crate::error::{TrainingError, TrainingResult};
use crate::metadata::TrainingSetMetadata;
use crate::metrics::{argmax, row_probabilities};
use crate::model::ModelOutputs;
use crate::stats::EvaluationStatistics;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const PREDICTIONS_SUFFIX: &str = "predictions";
pub const PROBABILITY_SUFFIX: &str = "probability";
pub const PROBABILITIES_SUFFIX: &str = "probabilities";
pub const RAW_PREDICTIONS_SUFFIX: &str = "raw_predictions.json";

/// Decoded predictions, column-major: `<feature>_predictions`,
/// `<feature>_probability`, `<feature>_probabilities`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Predictions {
    pub num_rows: usize,
    pub columns: BTreeMap<String, Vec<Value>>,
}

impl Predictions {
    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Writes a CSV with one column per entry. Arrays are written as JSON.
    pub fn save_csv(&self, path: &Path) -> TrainingResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.columns.keys())?;
        for row in 0..self.num_rows {
            let record = self.columns.values().map(|values| match values.get(row) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            });
            writer.write_record(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Decode raw outputs with the training-set metadata.
pub fn postprocess(
    config: &ConfigModel,
    metadata: &TrainingSetMetadata,
    outputs: &ModelOutputs,
) -> TrainingResult<Predictions> {
    let mut predictions = Predictions::default();

    for feature in &config.output_features {
        let Some(out) = outputs.get(&feature.name) else {
            continue;
        };
        let encoding = metadata.get(&feature.name)?;
        let rows = out.logits.len();
        predictions.num_rows = predictions.num_rows.max(rows);

        let name = |suffix: &str| format!("{}_{suffix}", feature.name);
        match feature.feature_type {
            FeatureType::Binary | FeatureType::Category => {
                let mut decoded = Vec::with_capacity(rows);
                let mut probability = Vec::with_capacity(rows);
                let mut probabilities = Vec::with_capacity(rows);
                for row in 0..rows {
                    let p = row_probabilities(feature.feature_type, out, row);
                    let best = argmax(&p);
                    decoded.push(match feature.feature_type {
                        FeatureType::Binary => json!(best == 1),
                        _ => json!(encoding.label(best).unwrap_or(crate::metadata::UNKNOWN_SYMBOL)),
                    });
                    probability.push(json!(p[best]));
                    probabilities.push(json!(p));
                }
                predictions.columns.insert(name(PREDICTIONS_SUFFIX), decoded);
                predictions.columns.insert(name(PROBABILITY_SUFFIX), probability);
                predictions.columns.insert(name(PROBABILITIES_SUFFIX), probabilities);
            }
            FeatureType::Number => {
                let decoded = out.logits.iter().map(|row| json!(encoding.denormalize(row[0]))).collect();
                predictions.columns.insert(name(PREDICTIONS_SUFFIX), decoded);
            }
            FeatureType::Vector | FeatureType::Timeseries => {
                let decoded = out.logits.iter().map(|row| json!(row)).collect();
                predictions.columns.insert(name(PREDICTIONS_SUFFIX), decoded);
            }
        }
    }
    Ok(predictions)
}

/// Confusion matrices and per-class precision/recall/f1 for probabilistic
/// outputs. `dataset` must carry the output columns.
pub fn overall_statistics(
    config: &ConfigModel,
    metadata: &TrainingSetMetadata,
    dataset: &ProcessedDataset,
    outputs: &ModelOutputs,
) -> TrainingResult<EvaluationStatistics> {
    let mut stats = EvaluationStatistics::new();

    for feature in config.output_features.iter().filter(|f| f.feature_type.is_probabilistic()) {
        let Some(out) = outputs.get(&feature.name) else {
            continue;
        };
        let truths: Vec<usize> = match dataset.column(&feature.name) {
            Some(EncodedColumn::Scalars(v)) => v.iter().map(|y| usize::from(*y >= 0.5)).collect(),
            Some(EncodedColumn::Indices(v)) => v.iter().map(|y| *y as usize).collect(),
            _ => {
                return Err(TrainingError::Dataset(format!(
                    "overall statistics require ground truth for {}",
                    feature.name
                )));
            }
        };
        let labels: Vec<String> = match metadata.get(&feature.name)? {
            crate::metadata::FeatureMetadata::Category { idx2str, .. } => idx2str.clone(),
            _ => vec!["false".to_string(), "true".to_string()],
        };

        let k = labels.len();
        let mut confusion = vec![vec![0u64; k]; k];
        for (row, truth) in truths.iter().enumerate() {
            let predicted = argmax(&row_probabilities(feature.feature_type, out, row));
            if *truth < k && predicted < k {
                confusion[*truth][predicted] += 1;
            }
        }

        let mut per_class = serde_json::Map::new();
        let mut f1_sum = 0.0;
        let mut f1_count = 0usize;
        for (i, label) in labels.iter().enumerate() {
            let tp = confusion[i][i] as f64;
            let support: u64 = confusion[i].iter().sum();
            let predicted: u64 = confusion.iter().map(|r| r[i]).sum();
            let precision = if predicted > 0 { tp / predicted as f64 } else { 0.0 };
            let recall = if support > 0 { tp / support as f64 } else { 0.0 };
            let f1 = if precision + recall > 0.0 { 2.0 * precision * recall / (precision + recall) } else { 0.0 };
            if support > 0 {
                f1_sum += f1;
                f1_count += 1;
            }
            per_class.insert(
                label.clone(),
                json!({ "precision": precision, "recall": recall, "f1": f1, "support": support }),
            );
        }
        let total = truths.len().max(1) as f64;
        let correct: u64 = (0..k).map(|i| confusion[i][i]).sum();

        let mut entry = BTreeMap::new();
        entry.insert("confusion_matrix".to_string(), json!(confusion));
        entry.insert("per_class_stats".to_string(), Value::Object(per_class));
        entry.insert(
            "overall_stats".to_string(),
            json!({
                "accuracy": correct as f64 / total,
                "macro_f1": if f1_count > 0 { f1_sum / f1_count as f64 } else { 0.0 },
                "labels": labels,
            }),
        );
        stats.insert(feature.name.clone(), entry);
    }
    Ok(stats)
}

/// Merge `extra` into `stats`, feature by feature.
pub fn merge_statistics(stats: &mut EvaluationStatistics, extra: EvaluationStatistics) {
    for (feature, metrics) in extra {
        stats.entry(feature).or_default().extend(metrics);
    }
}

/// `<dir>/<feature>_raw_predictions.json` for every output.
pub fn save_raw_outputs(dir: &Path, outputs: &ModelOutputs) -> TrainingResult<()> {
    for (feature, out) in outputs {
        crate::artifacts::save_json(&dir.join(format!("{feature}_{RAW_PREDICTIONS_SUFFIX}")), out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfig;
    use crate::metadata::FeatureMetadata;
    use crate::model::FeatureOutputs;
    use tempfile::TempDir;

    fn fixture() -> (ConfigModel, TrainingSetMetadata, ModelOutputs) {
        let config = ConfigModel::new(
            vec![FeatureConfig::new("x", FeatureType::Number)],
            vec![FeatureConfig::new("color", FeatureType::Category)],
        );
        let mut metadata = TrainingSetMetadata::default();
        metadata.features.insert(
            "color".to_string(),
            FeatureMetadata::Category {
                idx2str: vec!["<UNK>".to_string(), "red".to_string(), "blue".to_string()],
                fill_value: "red".to_string(),
            },
        );
        let mut outputs = ModelOutputs::new();
        outputs.insert(
            "color".to_string(),
            FeatureOutputs { logits: vec![vec![0.0, 3.0, 0.0], vec![0.0, 0.0, 3.0], vec![0.0, 3.0, 0.0]], probabilities: None },
        );
        (config, metadata, outputs)
    }

    #[test]
    fn test_postprocess_decodes_labels() {
        let (config, metadata, outputs) = fixture();
        let predictions = postprocess(&config, &metadata, &outputs).unwrap();
        assert_eq!(predictions.num_rows, 3);
        assert_eq!(predictions.column("color_predictions").unwrap()[1], json!("blue"));
        assert!(predictions.column("color_probabilities").is_some());
    }

    #[test]
    fn test_overall_statistics_confusion_matrix() {
        let (config, metadata, outputs) = fixture();
        let mut columns = BTreeMap::new();
        columns.insert("color".to_string(), EncodedColumn::Indices(vec![1, 2, 2]));
        let dataset = ProcessedDataset::new(columns).unwrap();

        let stats = overall_statistics(&config, &metadata, &dataset, &outputs).unwrap();
        let matrix = &stats["color"]["confusion_matrix"];
        assert_eq!(matrix, &json!([[0, 0, 0], [0, 1, 0], [0, 1, 1]]));
        assert_eq!(stats["color"]["per_class_stats"]["red"]["precision"], json!(0.5));
    }

    #[test]
    fn test_predictions_csv() {
        let temp = TempDir::new().unwrap();
        let (config, metadata, outputs) = fixture();
        let predictions = postprocess(&config, &metadata, &outputs).unwrap();
        let path = temp.path().join("predictions.csv");
        predictions.save_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("color_predictions,color_probabilities,color_probability"));
        assert_eq!(text.lines().count(), 4);
    }
}
