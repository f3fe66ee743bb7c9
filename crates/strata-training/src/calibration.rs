//! Post-training temperature scaling for probabilistic outputs.

use crate::config::{ConfigModel, FeatureType};
use crate::dataset::{ProcessedDataset, Split};
use crate::error::{TrainingError, TrainingResult};
use crate::metrics::{loss_and_gradient, Target};
use crate::model::{CalibrationParams, Model};
use crate::preprocessing::PreprocessedData;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Smallest split considered usable for calibration.
pub const MIN_DATASET_SPLIT_ROWS: usize = 3;

const MIN_TEMPERATURE: f64 = 0.05;
const MAX_TEMPERATURE: f64 = 20.0;
const SEARCH_ITERATIONS: usize = 60;

/// Validation when it has at least `min_rows` rows, else training with a warning.
///
/// Falling back reuses rows the model was fitted on, which can make the
/// fitted temperature overconfident.
pub fn select_calibration_split(data: &PreprocessedData, min_rows: usize) -> (Split, &ProcessedDataset) {
    match &data.validation_set {
        Some(validation) if validation.len() >= min_rows => (Split::Validation, validation),
        Some(validation) => {
            warn!(
                rows = validation.len(),
                min_rows,
                "Validation set is too small for calibration, calibrating on the training set instead"
            );
            (Split::Training, &data.training_set)
        }
        None => {
            warn!("No validation set, calibrating on the training set instead");
            (Split::Training, &data.training_set)
        }
    }
}

/// Fit a temperature per calibrated output and store it on the model.
pub fn calibrate(
    model: &mut dyn Model,
    config: &ConfigModel,
    dataset: &ProcessedDataset,
) -> TrainingResult<BTreeMap<String, CalibrationParams>> {
    let outputs = model.predict(dataset)?;
    let mut fitted = BTreeMap::new();

    for feature in config.output_features.iter().filter(|f| f.calibration) {
        let column = dataset
            .column(&feature.name)
            .ok_or_else(|| TrainingError::Dataset(format!("calibration requires ground truth for {}", feature.name)))?;
        let logits = &outputs
            .get(&feature.name)
            .ok_or_else(|| TrainingError::Training(format!("model produced no outputs for {}", feature.name)))?
            .logits;
        let targets = (0..dataset.len())
            .map(|row| Target::at(feature.feature_type, column, row))
            .collect::<TrainingResult<Vec<_>>>()?;

        let temperature = fit_temperature(feature.feature_type, logits, &targets);
        let params = CalibrationParams { temperature };
        model.set_calibration(&feature.name, params)?;
        info!(feature = %feature.name, temperature, "Calibrated output");
        fitted.insert(feature.name.clone(), params);
    }
    Ok(fitted)
}

fn nll(logits: &[Vec<f64>], targets: &[Target<'_>], temperature: f64) -> f64 {
    logits
        .iter()
        .zip(targets)
        .map(|(row, target)| {
            let scaled: Vec<f64> = row.iter().map(|z| z / temperature).collect();
            loss_and_gradient(*target, &scaled).0
        })
        .sum::<f64>()
}

/// Golden-section search for the temperature minimizing negative log-likelihood.
pub fn fit_temperature(feature_type: FeatureType, logits: &[Vec<f64>], targets: &[Target<'_>]) -> f64 {
    if logits.is_empty() || !feature_type.is_probabilistic() {
        return 1.0;
    }
    let phi = (5f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = (MIN_TEMPERATURE.ln(), MAX_TEMPERATURE.ln());
    let f = |log_t: f64| nll(logits, targets, log_t.exp());

    let mut a = hi - phi * (hi - lo);
    let mut b = lo + phi * (hi - lo);
    let (mut fa, mut fb) = (f(a), f(b));
    for _ in 0..SEARCH_ITERATIONS {
        if fa < fb {
            hi = b;
            b = a;
            fb = fa;
            a = hi - phi * (hi - lo);
            fa = f(a);
        } else {
            lo = a;
            a = b;
            fa = fb;
            b = lo + phi * (hi - lo);
            fb = f(b);
        }
    }
    ((lo + hi) / 2.0).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::EncodedColumn;
    use crate::metadata::TrainingSetMetadata;

    fn dataset(rows: usize) -> ProcessedDataset {
        let mut columns = BTreeMap::new();
        columns.insert("y".to_string(), EncodedColumn::Scalars(vec![1.0; rows]));
        ProcessedDataset::new(columns).unwrap()
    }

    #[test]
    fn test_small_validation_falls_back_to_training() {
        let data = PreprocessedData {
            training_set: dataset(50),
            validation_set: Some(dataset(5)),
            test_set: None,
            training_set_metadata: TrainingSetMetadata::default(),
        };
        let (split, chosen) = select_calibration_split(&data, 20);
        assert_eq!(split, Split::Training);
        assert_eq!(chosen.len(), 50);

        let (split, _) = select_calibration_split(&data, 5);
        assert_eq!(split, Split::Validation);
    }

    #[test]
    fn test_overconfident_logits_get_temperature_above_one() {
        // Right 3 out of 4 times with a huge margin: the fitted temperature softens it.
        let logits = vec![vec![8.0], vec![8.0], vec![8.0], vec![8.0]];
        let targets = [Target::Binary(1.0), Target::Binary(1.0), Target::Binary(1.0), Target::Binary(0.0)];
        let t = fit_temperature(FeatureType::Binary, &logits, &targets);
        assert!(t > 1.0, "temperature {t}");
        assert!(t <= MAX_TEMPERATURE);
    }

    #[test]
    fn test_non_probabilistic_outputs_keep_unit_temperature() {
        let t = fit_temperature(FeatureType::Number, &[vec![1.0]], &[Target::Number(1.0)]);
        assert_eq!(t, 1.0);
    }
}
