//! Execution topology.
//!
//! A [`Backend`] decides which role may touch durable storage and hands out
//! the scoped [`Trainer`] and [`Predictor`] resources. Callers release those
//! with `shutdown` on every exit path; a [`TrainerGuard`] covers the paths
//! that never reach it.

use crate::callback::CallbackBus;
use crate::config::{ConfigModel, TrainerConfig};
use crate::dataset::ProcessedDataset;
use crate::engine::DataFrameEngine;
use crate::error::TrainingResult;
use crate::metadata::TrainingSetMetadata;
use crate::model::{Model, ModelOutputs};
use crate::stats::{EvaluationStatistics, MetricHistory};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Artifacts a run may skip writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipSave {
    pub training_description: bool,
    pub training_statistics: bool,
    pub model: bool,
    pub progress: bool,
    pub log: bool,
    pub processed_input: bool,
}

impl SkipSave {
    pub fn all() -> Self {
        Self {
            training_description: true,
            training_statistics: true,
            model: true,
            progress: true,
            log: true,
            processed_input: true,
        }
    }

    /// Nothing is written at all, so no output directory is needed.
    pub fn skips_everything(&self) -> bool {
        self.training_description
            && self.training_statistics
            && self.model
            && self.progress
            && self.log
            && self.processed_input
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub resume: bool,
    pub skip_save: SkipSave,
    pub callbacks: CallbackBus,
    pub random_seed: u64,
}

/// What a finished training call hands back.
#[derive(Debug)]
pub struct TrainOutcome {
    pub model: Box<dyn Model>,
    pub train_metrics: MetricHistory,
    pub validation_metrics: MetricHistory,
    pub test_metrics: MetricHistory,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    fn batch_size(&self) -> u64;

    fn set_batch_size(&mut self, batch_size: u64);

    fn eval_batch_size(&self) -> u64;

    fn set_eval_batch_size(&mut self, batch_size: u64);

    fn set_base_learning_rate(&mut self, rate: f64);

    /// Largest batch size that fits, bounded by `trainer.max_batch_size`.
    async fn tune_batch_size(
        &mut self,
        config: &ConfigModel,
        dataset: &ProcessedDataset,
        random_seed: u64,
    ) -> TrainingResult<u64>;

    async fn tune_learning_rate(
        &mut self,
        config: &ConfigModel,
        dataset: &ProcessedDataset,
        random_seed: u64,
    ) -> TrainingResult<f64>;

    /// Runs the full schedule. Checkpoints go under `save_path` when given.
    async fn train(
        &mut self,
        training_set: &ProcessedDataset,
        validation_set: Option<&ProcessedDataset>,
        test_set: Option<&ProcessedDataset>,
        save_path: Option<&Path>,
    ) -> TrainingResult<TrainOutcome>;

    /// One pass over `dataset` without checkpoints or evaluation.
    async fn train_online(&mut self, dataset: &ProcessedDataset) -> TrainingResult<Box<dyn Model>>;

    /// Releases workers, file handles and device memory.
    async fn shutdown(&mut self) -> TrainingResult<()>;

    /// Synchronous release for exits that cannot await: a dropped future or
    /// a panic. Must be idempotent and a no-op after `shutdown`.
    fn release(&mut self);
}

/// Holds a trainer for the length of a run.
///
/// [`TrainerGuard::shutdown`] is the normal exit. Dropping the guard without
/// it, because the run future was cancelled or unwound, falls back to
/// [`Trainer::release`].
pub struct TrainerGuard {
    trainer: Box<dyn Trainer>,
    released: bool,
}

impl TrainerGuard {
    pub fn new(trainer: Box<dyn Trainer>) -> Self {
        Self { trainer, released: false }
    }

    pub fn trainer(&mut self) -> &mut dyn Trainer {
        self.trainer.as_mut()
    }

    pub async fn shutdown(mut self) -> TrainingResult<()> {
        let result = self.trainer.shutdown().await;
        self.released = true;
        result
    }
}

impl Drop for TrainerGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!("Trainer dropped before shutdown, releasing");
            self.trainer.release();
        }
    }
}

#[async_trait]
pub trait Predictor: Send + Sync {
    async fn batch_predict(&mut self, dataset: &ProcessedDataset) -> TrainingResult<ModelOutputs>;

    /// Metrics over `dataset` (which must carry output columns), plus the raw
    /// outputs when `collect_predictions` is set.
    async fn batch_evaluation(
        &mut self,
        dataset: &ProcessedDataset,
        metadata: &TrainingSetMetadata,
        collect_predictions: bool,
    ) -> TrainingResult<(EvaluationStatistics, Option<ModelOutputs>)>;

    async fn shutdown(&mut self) -> TrainingResult<()>;
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Only the coordinator creates directories or writes files. Re-check at
    /// every call site; the answer may change when the backend is re-initialised.
    fn is_coordinator(&self) -> bool;

    fn num_nodes(&self) -> usize;

    fn engine(&self) -> &dyn DataFrameEngine;

    async fn create_trainer(
        &self,
        model: Box<dyn Model>,
        config: &TrainerConfig,
        options: TrainerOptions,
    ) -> TrainingResult<Box<dyn Trainer>>;

    async fn create_predictor(&self, model: Box<dyn Model>, batch_size: u64) -> TrainingResult<Box<dyn Predictor>>;

    /// Barrier after which every role holds the same weights.
    async fn sync_model(&self, model: &mut Box<dyn Model>) -> TrainingResult<()>;

    /// The coordinator passes `Some(value)`; every role gets the coordinator's value back.
    async fn broadcast_json(&self, value: Option<serde_json::Value>) -> TrainingResult<serde_json::Value>;
}

/// Compute `f` on the coordinator only and hand its result to every role.
pub async fn broadcast_return<T, F>(backend: &dyn Backend, f: F) -> TrainingResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> TrainingResult<T> + Send,
{
    let local = if backend.is_coordinator() { Some(serde_json::to_value(f()?)?) } else { None };
    let value = backend.broadcast_json(local).await?;
    Ok(serde_json::from_value(value)?)
}
