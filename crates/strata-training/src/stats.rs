//! Metric histories, their reduction into [`TrainingStats`], and the
//! summaries logged around a run.

use crate::config::TrainerConfig;
use crate::dataset::Split;
use crate::error::TrainingResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One metric value recorded by the trainer at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainerMetric {
    pub epoch: u32,
    pub step: u64,
    pub value: f64,
}

/// feature name -> metric name -> one record per checkpoint.
pub type MetricHistory = BTreeMap<String, BTreeMap<String, Vec<TrainerMetric>>>;

/// feature name -> metric name -> one scalar per checkpoint.
pub type ReducedMetrics = BTreeMap<String, BTreeMap<String, Vec<f64>>>;

/// Per-feature evaluation results. Values are scalars except for fields
/// such as confusion matrices and per-class breakdowns.
pub type EvaluationStatistics = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

/// Reduce every record to its value, keeping one scalar per checkpoint.
pub fn reduce_metrics(history: &MetricHistory) -> ReducedMetrics {
    history
        .iter()
        .map(|(feature, metrics)| {
            let reduced = metrics
                .iter()
                .map(|(metric, records)| (metric.clone(), records.iter().map(|r| r.value).collect()))
                .collect();
            (feature.clone(), reduced)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Epoch,
    Step,
}

/// Cadence between checkpoints that produced a metric history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationFrequency {
    pub frequency: f64,
    pub period: Period,
}

impl Default for EvaluationFrequency {
    fn default() -> Self {
        Self { frequency: 1.0, period: Period::Epoch }
    }
}

impl EvaluationFrequency {
    /// Exactly one branch applies: steps, then checkpoints per epoch, then one epoch.
    pub fn resolve(trainer: &TrainerConfig) -> Self {
        if trainer.steps_per_checkpoint > 0 {
            Self { frequency: trainer.steps_per_checkpoint as f64, period: Period::Step }
        } else if trainer.checkpoints_per_epoch > 0 {
            Self { frequency: 1.0 / f64::from(trainer.checkpoints_per_epoch), period: Period::Epoch }
        } else {
            Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainingStats {
    pub training: ReducedMetrics,
    pub validation: ReducedMetrics,
    pub test: ReducedMetrics,
    pub evaluation_frequency: EvaluationFrequency,
}

impl TrainingStats {
    pub fn from_histories(
        training: &MetricHistory,
        validation: &MetricHistory,
        test: &MetricHistory,
        evaluation_frequency: EvaluationFrequency,
    ) -> Self {
        Self {
            training: reduce_metrics(training),
            validation: reduce_metrics(validation),
            test: reduce_metrics(test),
            evaluation_frequency,
        }
    }

    pub fn split(&self, split: Split) -> &ReducedMetrics {
        match split {
            Split::Training => &self.training,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    /// Number of recorded checkpoints for a split.
    pub fn num_checkpoints(&self, split: Split) -> usize {
        self.split(split)
            .values()
            .flat_map(|metrics| metrics.values())
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }

    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        crate::artifacts::save_json(path, self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goal {
    Minimize,
    Maximize,
}

/// Improvement direction of a metric.
pub fn metric_goal(metric: &str) -> Goal {
    match metric {
        "accuracy" | "r2" | "roc_auc" | "precision" | "recall" | "f1" => Goal::Maximize,
        _ => Goal::Minimize,
    }
}

pub fn improves(goal: Goal, candidate: f64, best: f64) -> bool {
    match goal {
        Goal::Minimize => candidate < best,
        Goal::Maximize => candidate > best,
    }
}

/// Best validation checkpoint of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub validation_field: String,
    pub validation_metric: String,
    pub best_checkpoint: usize,
    pub best_validation_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_value: Option<f64>,
}

impl TrainingReport {
    /// `None` when the run had no validation history for the tracked metric.
    pub fn from_stats(stats: &TrainingStats, trainer: &TrainerConfig) -> Option<Self> {
        let field = &trainer.validation_field;
        let metric = &trainer.validation_metric;
        let history = stats.validation.get(field)?.get(metric)?;
        let goal = metric_goal(metric);

        let (best_checkpoint, best_validation_value) = history
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .reduce(|best, cur| if improves(goal, cur.1, best.1) { cur } else { best })?;

        let test_value = stats
            .test
            .get(field)
            .and_then(|m| m.get(metric))
            .and_then(|values| values.get(best_checkpoint))
            .copied();

        Some(Self {
            validation_field: field.clone(),
            validation_metric: metric.clone(),
            best_checkpoint,
            best_validation_value,
            test_value,
        })
    }

    pub fn log(&self) {
        tracing::info!(
            checkpoint = self.best_checkpoint,
            field = %self.validation_field,
            metric = %self.validation_metric,
            validation = self.best_validation_value,
            test = ?self.test_value,
            "Best validation checkpoint"
        );
    }
}

/// Row counts of the preprocessed splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatasetStatistics {
    pub training: usize,
    pub validation: usize,
    pub test: usize,
}

impl DatasetStatistics {
    pub fn total(&self) -> usize {
        self.training + self.validation + self.test
    }

    pub fn log(&self) {
        let total = self.total().max(1) as f64;
        for (split, rows) in [("training", self.training), ("validation", self.validation), ("test", self.test)] {
            tracing::info!(
                split,
                rows,
                percent = %format!("{:.2}", 100.0 * rows as f64 / total),
                "Dataset statistics"
            );
        }
    }
}
