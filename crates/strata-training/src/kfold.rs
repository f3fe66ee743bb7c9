//! K-fold cross-validation: one independent run per fold, aggregated into
//! per-metric mean and standard deviation.

use crate::backend::{Backend, SkipSave};
use crate::callback::CallbackBus;
use crate::config::{ConfigModel, DEFAULT_RANDOM_SEED};
use crate::dataset::{DatasetSource, DatasetSources, Split};
use crate::engine::DataFrameEngine;
use crate::error::{TrainingError, TrainingResult};
use crate::lifecycle::{ExperimentOptions, RunOptions, TrainingLifecycle};
use crate::readers::{read_source, DataFormat};
use crate::registry::ModelRegistry;
use crate::stats::{EvaluationStatistics, TrainingStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const KFOLD_STATISTICS_FILE_NAME: &str = "kfold_training_statistics.json";

/// Fields that are not scalars and never enter the aggregate.
const NON_SCALAR_FIELDS: &[&str] = &[
    "predictions",
    "probabilities",
    "confusion_matrix",
    "overall_stats",
    "per_class_stats",
    "roc_curve",
    "precision_recall_curve",
];

#[derive(Debug, Clone)]
pub struct KFoldOptions {
    pub num_folds: usize,
    pub random_seed: u64,
    pub data_format: DataFormat,
    pub skip_save: SkipSave,
    /// The aggregate is written here, on the coordinator, when set.
    pub output_directory: Option<PathBuf>,
}

impl Default for KFoldOptions {
    fn default() -> Self {
        Self {
            num_folds: 5,
            random_seed: DEFAULT_RANDOM_SEED,
            data_format: DataFormat::Auto,
            skip_save: SkipSave::default(),
            output_directory: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold: usize,
    pub test_indices: Vec<usize>,
    pub training_statistics: TrainingStats,
    pub test_statistics: EvaluationStatistics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KFoldResults {
    pub folds: Vec<FoldResult>,
    pub overall: BTreeMap<String, BTreeMap<String, MetricSummary>>,
}

/// Disjoint test folds covering `0..num_rows`, in a seeded order. The first
/// `num_rows % num_folds` folds hold one extra row.
pub fn fold_indices(
    engine: &dyn DataFrameEngine,
    num_rows: usize,
    num_folds: usize,
    random_seed: u64,
) -> TrainingResult<Vec<Vec<usize>>> {
    if num_folds < 2 {
        return Err(TrainingError::ConfigResolution(format!("num_folds must be at least 2, got {num_folds}")));
    }
    if num_folds > num_rows {
        return Err(TrainingError::ConfigResolution(format!(
            "num_folds ({num_folds}) exceeds the number of rows ({num_rows})"
        )));
    }

    let order = engine.shuffled_indices(num_rows, random_seed);
    let (base, extra) = (num_rows / num_folds, num_rows % num_folds);
    let mut folds = Vec::with_capacity(num_folds);
    let mut start = 0;
    for fold in 0..num_folds {
        let size = base + usize::from(fold < extra);
        folds.push(order[start..start + size].to_vec());
        start += size;
    }
    Ok(folds)
}

/// Mean and population standard deviation of every scalar metric.
pub fn aggregate_fold_statistics(folds: &[EvaluationStatistics]) -> BTreeMap<String, BTreeMap<String, MetricSummary>> {
    let mut values: BTreeMap<String, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
    for stats in folds {
        for (feature, metrics) in stats {
            for (metric, value) in metrics {
                if NON_SCALAR_FIELDS.contains(&metric.as_str()) {
                    continue;
                }
                if let Some(value) = value.as_f64() {
                    values.entry(feature.clone()).or_default().entry(metric.clone()).or_default().push(value);
                }
            }
        }
    }

    values
        .into_iter()
        .map(|(feature, metrics)| {
            let summaries = metrics
                .into_iter()
                .map(|(metric, v)| {
                    let n = v.len() as f64;
                    let mean = v.iter().sum::<f64>() / n;
                    let std = (v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
                    (metric, MetricSummary { mean, std })
                })
                .collect();
            (feature, summaries)
        })
        .collect()
}

/// Run `num_folds` independent experiments over `dataset`, each in its own
/// temporary output location.
pub async fn kfold_cross_validate(
    config: &ConfigModel,
    dataset: &DatasetSource,
    options: &KFoldOptions,
    backend: Arc<dyn Backend>,
    registry: &ModelRegistry,
    callbacks: &CallbackBus,
) -> TrainingResult<KFoldResults> {
    if matches!(dataset, DatasetSource::Processed(_)) {
        return Err(TrainingError::ConfigResolution(
            "k-fold cross validation needs raw rows, not a processed dataset".to_string(),
        ));
    }
    let frame = read_source(dataset, options.data_format)?;
    let folds = fold_indices(backend.engine(), frame.len(), options.num_folds, options.random_seed)?;

    let mut results = Vec::with_capacity(folds.len());
    for (fold, test_indices) in folds.into_iter().enumerate() {
        let mut in_test = vec![false; frame.len()];
        for &i in &test_indices {
            in_test[i] = true;
        }
        let train_indices: Vec<usize> = (0..frame.len()).filter(|&i| !in_test[i]).collect();
        info!(
            fold = fold + 1,
            num_folds = options.num_folds,
            training_rows = train_indices.len(),
            test_rows = test_indices.len(),
            "Starting fold"
        );

        let workdir = tempfile::TempDir::new()?;
        let sources = DatasetSources::explicit(
            frame.select(&train_indices),
            None,
            Some(DatasetSource::Frame(frame.select(&test_indices))),
        );
        let experiment_options = ExperimentOptions {
            run: RunOptions {
                experiment_name: "kfold".to_string(),
                model_name: format!("fold_{}", fold + 1),
                output_directory: workdir.path().to_path_buf(),
                skip_save: options.skip_save,
                random_seed: options.random_seed,
                ..RunOptions::default()
            },
            eval_split: Split::Test.as_str().to_string(),
            skip_save_unprocessed_output: true,
            skip_save_predictions: true,
            skip_save_eval_stats: true,
        };

        let mut lifecycle = TrainingLifecycle::new(config.clone(), backend.clone())?
            .with_registry(registry.clone())
            .with_callbacks(callbacks.clone());
        let experiment = lifecycle.experiment(&sources, &experiment_options).await;
        lifecycle.shutdown().await?;
        let experiment = experiment?;

        results.push(FoldResult {
            fold: fold + 1,
            test_indices,
            training_statistics: experiment.training.train_stats().clone(),
            test_statistics: experiment.evaluation.unwrap_or_default(),
        });
    }

    let overall = aggregate_fold_statistics(&results.iter().map(|f| f.test_statistics.clone()).collect::<Vec<_>>());
    for (feature, metrics) in &overall {
        for (metric, summary) in metrics {
            info!(feature = %feature, metric = %metric, mean = summary.mean, std = summary.std, "K-fold result");
        }
    }

    let kfold = KFoldResults { folds: results, overall };
    if let Some(dir) = options.output_directory.as_deref().filter(|_| backend.is_coordinator()) {
        std::fs::create_dir_all(dir)?;
        crate::artifacts::save_json(&dir.join(KFOLD_STATISTICS_FILE_NAME), &kfold)?;
        info!(path = %dir.display(), "Saved k-fold statistics");
    }
    Ok(kfold)
}
