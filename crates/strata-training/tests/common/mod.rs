//! Shared helpers for strata-training integration tests.
//!
//! `CountingBackend` wraps the local backend, counts collaborator calls and
//! can pose as a non-coordinator role or hand out trainers that fail or hang. `capture_events` records log events
//! for the current thread.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_training::{
    Backend, Callback, ConfigModel, DataFrameEngine, FeatureConfig, FeatureType, LocalBackend, Model, Predictor,
    ProcessedDataset, RawFrame, TrainInit, TrainOutcome, Trainer, TrainerConfig, TrainerOptions, TrainingError,
    TrainingResult, Tunable,
};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

#[derive(Debug, Default)]
pub struct Counters {
    pub trainers_created: AtomicUsize,
    pub trainers_released: AtomicUsize,
    pub batch_size_probes: AtomicUsize,
    pub learning_rate_probes: AtomicUsize,
    pub syncs: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// What `Trainer::train` does on trainers handed out by [`CountingBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrainBehavior {
    #[default]
    Normal,
    /// Returns `TrainingError::Training`.
    Fail,
    /// Never finishes within a test.
    Hang,
}

pub struct CountingBackend {
    inner: LocalBackend,
    behavior: TrainBehavior,
    pub counters: Arc<Counters>,
}

impl CountingBackend {
    pub fn coordinator() -> Self {
        Self { inner: LocalBackend::new(), behavior: TrainBehavior::Normal, counters: Arc::default() }
    }

    /// Rank 1 of 2: must never touch the filesystem.
    pub fn worker() -> Self {
        Self { inner: LocalBackend::simulated(1, 2), behavior: TrainBehavior::Normal, counters: Arc::default() }
    }

    #[must_use]
    pub fn with_behavior(mut self, behavior: TrainBehavior) -> Self {
        self.behavior = behavior;
        self
    }
}

#[async_trait]
impl Backend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    fn is_coordinator(&self) -> bool {
        self.inner.is_coordinator()
    }

    fn num_nodes(&self) -> usize {
        self.inner.num_nodes()
    }

    fn engine(&self) -> &dyn DataFrameEngine {
        self.inner.engine()
    }

    async fn create_trainer(
        &self,
        model: Box<dyn Model>,
        config: &TrainerConfig,
        options: TrainerOptions,
    ) -> TrainingResult<Box<dyn Trainer>> {
        let inner = self.inner.create_trainer(model, config, options).await?;
        self.counters.trainers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingTrainer {
            inner,
            behavior: self.behavior,
            released: false,
            counters: self.counters.clone(),
        }))
    }

    async fn create_predictor(&self, model: Box<dyn Model>, batch_size: u64) -> TrainingResult<Box<dyn Predictor>> {
        self.inner.create_predictor(model, batch_size).await
    }

    async fn sync_model(&self, model: &mut Box<dyn Model>) -> TrainingResult<()> {
        self.counters.syncs.fetch_add(1, Ordering::SeqCst);
        self.inner.sync_model(model).await
    }

    async fn broadcast_json(&self, value: Option<serde_json::Value>) -> TrainingResult<serde_json::Value> {
        self.inner.broadcast_json(value).await
    }
}

struct CountingTrainer {
    inner: Box<dyn Trainer>,
    behavior: TrainBehavior,
    released: bool,
    counters: Arc<Counters>,
}

impl CountingTrainer {
    fn count_release(&mut self) {
        if !self.released {
            self.released = true;
            self.counters.trainers_released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Trainer for CountingTrainer {
    fn batch_size(&self) -> u64 {
        self.inner.batch_size()
    }

    fn set_batch_size(&mut self, batch_size: u64) {
        self.inner.set_batch_size(batch_size);
    }

    fn eval_batch_size(&self) -> u64 {
        self.inner.eval_batch_size()
    }

    fn set_eval_batch_size(&mut self, batch_size: u64) {
        self.inner.set_eval_batch_size(batch_size);
    }

    fn set_base_learning_rate(&mut self, rate: f64) {
        self.inner.set_base_learning_rate(rate);
    }

    async fn tune_batch_size(
        &mut self,
        config: &ConfigModel,
        dataset: &ProcessedDataset,
        random_seed: u64,
    ) -> TrainingResult<u64> {
        self.counters.batch_size_probes.fetch_add(1, Ordering::SeqCst);
        self.inner.tune_batch_size(config, dataset, random_seed).await
    }

    async fn tune_learning_rate(
        &mut self,
        config: &ConfigModel,
        dataset: &ProcessedDataset,
        random_seed: u64,
    ) -> TrainingResult<f64> {
        self.counters.learning_rate_probes.fetch_add(1, Ordering::SeqCst);
        self.inner.tune_learning_rate(config, dataset, random_seed).await
    }

    async fn train(
        &mut self,
        training_set: &ProcessedDataset,
        validation_set: Option<&ProcessedDataset>,
        test_set: Option<&ProcessedDataset>,
        save_path: Option<&Path>,
    ) -> TrainingResult<TrainOutcome> {
        match self.behavior {
            TrainBehavior::Normal => {}
            TrainBehavior::Fail => return Err(TrainingError::Training("trainer diverged".to_string())),
            TrainBehavior::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
        }
        self.inner.train(training_set, validation_set, test_set, save_path).await
    }

    async fn train_online(&mut self, dataset: &ProcessedDataset) -> TrainingResult<Box<dyn Model>> {
        self.inner.train_online(dataset).await
    }

    async fn shutdown(&mut self) -> TrainingResult<()> {
        self.count_release();
        self.inner.shutdown().await
    }

    fn release(&mut self) {
        self.count_release();
        self.inner.release();
    }
}

/// Records lifecycle hook names in firing order. With `fail_on_train_end`
/// set, `on_train_end` records and then errors.
#[derive(Debug, Default)]
pub struct HookRecorder {
    pub hooks: Mutex<Vec<&'static str>>,
    pub fail_on_train_end: bool,
}

impl HookRecorder {
    pub fn failing_on_train_end() -> Self {
        Self { fail_on_train_end: true, ..Self::default() }
    }

    pub fn recorded(&self) -> Vec<&'static str> {
        self.hooks.lock().unwrap().clone()
    }

    fn push(&self, hook: &'static str) {
        self.hooks.lock().unwrap().push(hook);
    }
}

impl Callback for HookRecorder {
    fn name(&self) -> &str {
        "hook-recorder"
    }

    fn on_preprocess_start(&self, _config: &ConfigModel) -> anyhow::Result<()> {
        self.push("preprocess_start");
        Ok(())
    }

    fn on_preprocess_end(&self, _data: Option<&strata_training::PreprocessedData>) -> anyhow::Result<()> {
        self.push("preprocess_end");
        Ok(())
    }

    fn on_train_init(&self, _init: &TrainInit<'_>) -> anyhow::Result<()> {
        self.push("train_init");
        Ok(())
    }

    fn on_train_start(&self, _model: &dyn Model, _config: &ConfigModel, _path: Option<&Path>) -> anyhow::Result<()> {
        self.push("train_start");
        Ok(())
    }

    fn on_train_end(&self, _output_directory: Option<&Path>) -> anyhow::Result<()> {
        self.push("train_end");
        if self.fail_on_train_end {
            anyhow::bail!("observer failed");
        }
        Ok(())
    }
}

/// One numeric input, one categorical input, one binary output.
pub fn config() -> ConfigModel {
    let mut config = ConfigModel::new(
        vec![FeatureConfig::new("x", FeatureType::Number), FeatureConfig::new("color", FeatureType::Category)],
        vec![FeatureConfig::new("label", FeatureType::Binary)],
    );
    config.trainer.epochs = 2;
    config.trainer.batch_size = Tunable::Fixed(16);
    config.trainer.learning_rate = Tunable::Fixed(0.1);
    config
}

/// `rows` labelled rows; `label` is true for positive `x`.
pub fn frame(rows: usize) -> RawFrame {
    let records = (0..rows)
        .filter_map(|i| {
            let x = i as f64 / rows as f64 - 0.5;
            let color = ["red", "green", "blue"][i % 3];
            json!({"x": x, "color": color, "label": x > 0.0})
                .as_object()
                .cloned()
        })
        .collect();
    RawFrame::new(records)
}

/// Every file and directory below `root`, relative to it, sorted.
pub fn list_files(root: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            out.push(path.strip_prefix(root).unwrap().to_path_buf());
            if path.is_dir() {
                walk(&path, root, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

/// Log events seen while the guard is alive.
#[derive(Clone, Default)]
pub struct CapturedEvents(Arc<Mutex<Vec<(Level, String)>>>);

impl CapturedEvents {
    pub fn count(&self, level: Level, needle: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|(l, m)| *l == level && m.contains(needle)).count()
    }
}

impl fmt::Debug for CapturedEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.lock().unwrap().iter()).finish()
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.0.lock().unwrap().push((*event.metadata().level(), visitor.0));
    }
}

pub fn capture_events() -> (CapturedEvents, DefaultGuard) {
    let events = CapturedEvents::default();
    let subscriber = tracing_subscriber::registry().with(events.clone());
    (events, tracing::subscriber::set_default(subscriber))
}
