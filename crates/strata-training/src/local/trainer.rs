use super::linear::LinearModel;
use super::predictor::predict_in_batches;
use crate::backend::{TrainOutcome, Trainer, TrainerOptions};
use crate::config::{ConfigModel, TrainerConfig, DEFAULT_BATCH_SIZE};
use crate::dataset::ProcessedDataset;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::{MODEL_WEIGHTS_FILE_NAME, TRAINING_CHECKPOINTS_DIR_NAME};
use crate::metrics::scalar_metrics;
use crate::model::Model;
use crate::progress::TrainingProgress;
use crate::stats::{improves, metric_goal, EvaluationStatistics, MetricHistory, TrainerMetric};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

const FALLBACK_LEARNING_RATE: f64 = 0.001;
const TRAINING_LOG_FILE_NAME: &str = "training_log.jsonl";

const LR_PROBE_MIN: f64 = 1e-5;
const LR_PROBE_MAX: f64 = 1.0;
const LR_PROBE_POINTS: usize = 16;
const LR_PROBE_STEPS: usize = 5;
const LR_DIVERGENCE_FACTOR: f64 = 4.0;

/// Buffers held per row during a step: inputs, outputs and their gradients.
const BUFFERS_PER_ROW: u64 = 4;

struct Splits<'a> {
    training: &'a ProcessedDataset,
    validation: Option<&'a ProcessedDataset>,
    test: Option<&'a ProcessedDataset>,
}

/// Mini-batch SGD over a [`LinearModel`], checkpointing at the configured
/// cadence and keeping the weights with the best validation metric.
pub struct LocalTrainer {
    model: LinearModel,
    config: TrainerConfig,
    options: TrainerOptions,
    batch_size: u64,
    eval_batch_size: u64,
    learning_rate: f64,
    memory_budget_bytes: u64,
    released: bool,
}

impl LocalTrainer {
    pub fn new(model: LinearModel, config: &TrainerConfig, options: TrainerOptions, memory_budget_bytes: u64) -> Self {
        let batch_size = config.batch_size.fixed().unwrap_or(DEFAULT_BATCH_SIZE);
        Self {
            model,
            config: config.clone(),
            options,
            batch_size,
            eval_batch_size: config.effective_eval_batch_size().unwrap_or(batch_size),
            learning_rate: config.learning_rate.fixed().unwrap_or(FALLBACK_LEARNING_RATE),
            memory_budget_bytes,
            released: false,
        }
    }

    /// Steps between checkpoints.
    fn checkpoint_interval(&self, steps_per_epoch: u64) -> u64 {
        if self.config.steps_per_checkpoint > 0 {
            self.config.steps_per_checkpoint
        } else if self.config.checkpoints_per_epoch > 0 {
            (steps_per_epoch / u64::from(self.config.checkpoints_per_epoch)).max(1)
        } else {
            steps_per_epoch.max(1)
        }
    }

    fn shuffled(&self, len: usize, seed: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        if self.config.should_shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        order
    }

    fn evaluate(&self, dataset: &ProcessedDataset) -> TrainingResult<EvaluationStatistics> {
        let outputs = predict_in_batches(&self.model, dataset, self.eval_batch_size)?;
        scalar_metrics(self.model.config(), None, dataset, &outputs)
    }

    fn resume_from(&mut self, checkpoint_dir: &Path) -> TrainingResult<Option<TrainingProgress>> {
        let Some(progress) = TrainingProgress::load(checkpoint_dir)? else {
            warn!(path = %checkpoint_dir.display(), "No training progress to resume from, starting fresh");
            return Ok(None);
        };
        self.model.load_weights(checkpoint_dir)?;
        self.batch_size = progress.batch_size;
        self.learning_rate = progress.learning_rate;
        info!(epoch = progress.epoch, steps = progress.steps, "Resuming training");
        Ok(Some(progress))
    }

    /// Evaluate every split, track the validation metric and report whether
    /// training should stop early.
    fn checkpoint(
        &mut self,
        progress: &mut TrainingProgress,
        splits: &Splits<'_>,
        save_path: Option<&Path>,
        best_model: &mut LinearModel,
    ) -> TrainingResult<bool> {
        progress.checkpoint_number += 1;
        let (epoch, step) = (progress.epoch, progress.steps);

        if self.config.evaluate_training_set {
            let stats = self.evaluate(splits.training)?;
            record(&mut progress.train_metrics, &stats, epoch, step);
        }
        let validation_stats = splits.validation.map(|v| self.evaluate(v)).transpose()?;
        if let Some(stats) = &validation_stats {
            record(&mut progress.validation_metrics, stats, epoch, step);
        }
        if let Some(test) = splits.test {
            let stats = self.evaluate(test)?;
            record(&mut progress.test_metrics, &stats, epoch, step);
        }

        let tracked = validation_stats
            .as_ref()
            .and_then(|s| s.get(&self.config.validation_field))
            .and_then(|m| m.get(&self.config.validation_metric))
            .and_then(serde_json::Value::as_f64);

        if let Some(value) = tracked {
            let goal = metric_goal(&self.config.validation_metric);
            let improved = progress.best_eval_metric_value.is_none_or(|best| improves(goal, value, best));
            if improved {
                debug!(value, checkpoint = progress.checkpoint_number, "Validation metric improved");
                progress.best_eval_metric_value = Some(value);
                progress.best_eval_metric_steps = step;
                progress.best_eval_metric_checkpoint_number = progress.checkpoint_number;
                progress.checkpoints_since_improvement = 0;
                *best_model = self.model.clone();
                if let Some(dir) = save_path.filter(|_| !self.options.skip_save.model) {
                    self.model.save_weights(dir)?;
                }
            } else {
                progress.checkpoints_since_improvement += 1;
            }
        }

        info!(
            checkpoint = progress.checkpoint_number,
            epoch,
            step,
            best = ?progress.best_eval_metric_value,
            "Evaluated checkpoint"
        );
        self.options.callbacks.fire("on_eval_end", |cb| cb.on_eval_end(progress, save_path));

        if let Some(dir) = save_path.filter(|_| !self.options.skip_save.log) {
            append_log(dir, progress)?;
        }

        let patience = self.config.early_stop;
        let stop = patience > 0 && progress.checkpoints_since_improvement >= patience.unsigned_abs();
        if stop {
            info!(checkpoints = progress.checkpoints_since_improvement, "Early stopping");
        }
        Ok(stop)
    }
}

fn record(history: &mut MetricHistory, stats: &EvaluationStatistics, epoch: u32, step: u64) {
    for (feature, metrics) in stats {
        for (metric, value) in metrics {
            if let Some(value) = value.as_f64() {
                history
                    .entry(feature.clone())
                    .or_default()
                    .entry(metric.clone())
                    .or_default()
                    .push(TrainerMetric { epoch, step, value });
            }
        }
    }
}

fn append_log(dir: &Path, progress: &TrainingProgress) -> TrainingResult<()> {
    std::fs::create_dir_all(dir)?;
    let line = serde_json::json!({
        "checkpoint": progress.checkpoint_number,
        "epoch": progress.epoch,
        "steps": progress.steps,
        "best_eval_metric_value": progress.best_eval_metric_value,
    });
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(TRAINING_LOG_FILE_NAME))?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[async_trait]
impl Trainer for LocalTrainer {
    fn batch_size(&self) -> u64 {
        self.batch_size
    }

    fn set_batch_size(&mut self, batch_size: u64) {
        self.batch_size = batch_size.max(1);
    }

    fn eval_batch_size(&self) -> u64 {
        self.eval_batch_size
    }

    fn set_eval_batch_size(&mut self, batch_size: u64) {
        self.eval_batch_size = batch_size.max(1);
    }

    fn set_base_learning_rate(&mut self, rate: f64) {
        self.learning_rate = rate;
    }

    async fn tune_batch_size(
        &mut self,
        config: &ConfigModel,
        dataset: &ProcessedDataset,
        random_seed: u64,
    ) -> TrainingResult<u64> {
        if dataset.is_empty() {
            return Err(TrainingError::Training("cannot tune the batch size on an empty dataset".to_string()));
        }
        let x = self.model.design_matrix(dataset)?;
        let order = self.shuffled(dataset.len(), random_seed);
        let limit = config.trainer.max_batch_size.min(dataset.len() as u64).max(1);
        let bytes_per_row = (self.model.input_width() + self.model.output_width()) as u64
            * std::mem::size_of::<f64>() as u64
            * BUFFERS_PER_ROW;

        let mut best = 1;
        let mut candidate = 1;
        while candidate <= limit {
            if candidate.saturating_mul(bytes_per_row) > self.memory_budget_bytes {
                debug!(candidate, "Batch size exceeds the memory budget");
                break;
            }
            let rows: Vec<usize> = order.iter().copied().take(candidate as usize).collect();
            let mut probe = self.model.clone();
            let loss = probe.sgd_step(&x, dataset, &rows, self.learning_rate, config.trainer.regularization_lambda)?;
            if !loss.is_finite() {
                break;
            }
            best = candidate;
            candidate *= 2;
        }
        info!(batch_size = best, max_batch_size = config.trainer.max_batch_size, "Tuned batch size");
        Ok(best)
    }

    async fn tune_learning_rate(
        &mut self,
        config: &ConfigModel,
        dataset: &ProcessedDataset,
        random_seed: u64,
    ) -> TrainingResult<f64> {
        if dataset.is_empty() {
            return Err(TrainingError::Training("cannot tune the learning rate on an empty dataset".to_string()));
        }
        let x = self.model.design_matrix(dataset)?;
        let order = self.shuffled(dataset.len(), random_seed);
        let batch = (self.batch_size as usize).clamp(1, dataset.len());
        let probe_rows = &order[..batch];
        let base_loss = self.model.loss(&x, dataset, probe_rows)?;

        let mut best = (self.learning_rate, f64::INFINITY);
        for i in 0..LR_PROBE_POINTS {
            let rate = LR_PROBE_MIN * (LR_PROBE_MAX / LR_PROBE_MIN).powf(i as f64 / (LR_PROBE_POINTS - 1) as f64);
            let mut probe = self.model.clone();
            for chunk in order.chunks(batch).cycle().take(LR_PROBE_STEPS) {
                probe.sgd_step(&x, dataset, chunk, rate, config.trainer.regularization_lambda)?;
            }
            let loss = probe.loss(&x, dataset, probe_rows)?;
            if !loss.is_finite() || loss > LR_DIVERGENCE_FACTOR * base_loss {
                debug!(rate, loss, "Loss diverged, ending learning rate probe");
                break;
            }
            if loss < best.1 {
                best = (rate, loss);
            }
        }
        info!(learning_rate = best.0, "Tuned learning rate");
        Ok(best.0)
    }

    async fn train(
        &mut self,
        training_set: &ProcessedDataset,
        validation_set: Option<&ProcessedDataset>,
        test_set: Option<&ProcessedDataset>,
        save_path: Option<&Path>,
    ) -> TrainingResult<TrainOutcome> {
        if training_set.is_empty() {
            return Err(TrainingError::Training("training set is empty".to_string()));
        }
        let splits = Splits { training: training_set, validation: validation_set, test: test_set };
        let checkpoint_dir = save_path.map(|p| p.join(TRAINING_CHECKPOINTS_DIR_NAME));

        let resumed = match checkpoint_dir.as_deref() {
            Some(dir) if self.options.resume => self.resume_from(dir)?,
            _ => None,
        };
        let resuming = resumed.is_some();
        let mut progress = resumed.unwrap_or_else(|| TrainingProgress::new(self.batch_size, self.learning_rate));

        let x = self.model.design_matrix(training_set)?;
        let batch = (self.batch_size as usize).clamp(1, training_set.len());
        let steps_per_epoch = training_set.len().div_ceil(batch) as u64;
        let total_steps = self
            .config
            .train_steps
            .unwrap_or(u64::from(self.config.epochs) * steps_per_epoch);
        let interval = self.checkpoint_interval(steps_per_epoch);
        let lambda = self.config.regularization_lambda;

        info!(
            rows = training_set.len(),
            batch_size = batch,
            steps_per_epoch,
            total_steps,
            learning_rate = self.learning_rate,
            "Starting training"
        );

        let mut best_model = self.model.clone();
        // Best weights of a resumed run live next to the checkpoint directory.
        if let Some(dir) = save_path.filter(|dir| resuming && dir.join(MODEL_WEIGHTS_FILE_NAME).exists()) {
            if progress.best_eval_metric_value.is_some() {
                best_model.load_weights(dir)?;
            }
        }
        let mut stop = false;
        while progress.steps < total_steps && !stop {
            let order = self.shuffled(training_set.len(), self.options.random_seed + u64::from(progress.epoch));
            for rows in order.chunks(batch) {
                self.model.sgd_step(&x, training_set, rows, self.learning_rate, lambda)?;
                progress.steps += 1;
                if progress.steps % interval == 0 {
                    stop = self.checkpoint(&mut progress, &splits, save_path, &mut best_model)?;
                }
                if stop || progress.steps >= total_steps {
                    break;
                }
            }
            progress.epoch += 1;
            if !crate::runtime::progress_disabled() {
                info!(epoch = progress.epoch, steps = progress.steps, total_steps, "Finished epoch");
            }
            self.options.callbacks.fire("on_epoch_end", |cb| cb.on_epoch_end(&progress, save_path));

            if let Some(dir) = checkpoint_dir.as_deref().filter(|_| !self.options.skip_save.progress) {
                progress.batch_size = self.batch_size;
                progress.learning_rate = self.learning_rate;
                progress.save(dir)?;
                self.model.save_weights(dir)?;
            }
        }

        if progress.checkpoint_number == 0 {
            self.checkpoint(&mut progress, &splits, save_path, &mut best_model)?;
        }

        if progress.best_eval_metric_value.is_some() {
            debug!(
                checkpoint = progress.best_eval_metric_checkpoint_number,
                steps = progress.best_eval_metric_steps,
                "Restoring best weights"
            );
            self.model = best_model;
        } else if let Some(dir) = save_path.filter(|_| !self.options.skip_save.model) {
            self.model.save_weights(dir)?;
        }

        Ok(TrainOutcome {
            model: Box::new(self.model.clone()),
            train_metrics: progress.train_metrics,
            validation_metrics: progress.validation_metrics,
            test_metrics: progress.test_metrics,
        })
    }

    async fn train_online(&mut self, dataset: &ProcessedDataset) -> TrainingResult<Box<dyn Model>> {
        let x = self.model.design_matrix(dataset)?;
        let batch = (self.batch_size as usize).clamp(1, dataset.len().max(1));
        let order = self.shuffled(dataset.len(), self.options.random_seed);
        for rows in order.chunks(batch) {
            self.model.sgd_step(&x, dataset, rows, self.learning_rate, self.config.regularization_lambda)?;
        }
        debug!(rows = dataset.len(), "Finished online pass");
        Ok(Box::new(self.model.clone()))
    }

    async fn shutdown(&mut self) -> TrainingResult<()> {
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            debug!("Trainer already released");
            return;
        }
        self.released = true;
        debug!("Released local trainer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SkipSave;
    use crate::callback::CallbackBus;
    use crate::config::{FeatureConfig, FeatureType, Tunable};
    use crate::dataset::RawFrame;
    use crate::metadata::TrainingSetMetadata;
    use crate::layout::TRAINING_PROGRESS_FILE_NAME;
    use serde_json::json;
    use tempfile::TempDir;

    fn fixture(rows: usize) -> (ConfigModel, TrainingSetMetadata, ProcessedDataset) {
        let mut config = ConfigModel::new(
            vec![FeatureConfig::new("x", FeatureType::Number)],
            vec![FeatureConfig::new("y", FeatureType::Binary)],
        );
        config.trainer.epochs = 3;
        config.trainer.batch_size = Tunable::Fixed(8);
        config.trainer.learning_rate = Tunable::Fixed(0.1);
        let rows = (0..rows)
            .filter_map(|i| {
                let x = i as f64 / rows as f64 - 0.5;
                json!({"x": x, "y": x > 0.0}).as_object().cloned()
            })
            .collect();
        let frame = RawFrame::new(rows);
        let metadata = TrainingSetMetadata::fit(&config, &frame).unwrap();
        let dataset = metadata.encode(&config, &frame, true).unwrap();
        (config, metadata, dataset)
    }

    fn trainer(config: &ConfigModel, metadata: &TrainingSetMetadata, skip_save: SkipSave) -> LocalTrainer {
        let model = LinearModel::new(config, metadata, 3).unwrap();
        let options = TrainerOptions { resume: false, skip_save, callbacks: CallbackBus::new(), random_seed: 3 };
        LocalTrainer::new(model, &config.trainer, options, 1 << 30)
    }

    #[tokio::test]
    async fn test_train_records_one_entry_per_checkpoint() {
        let (config, metadata, dataset) = fixture(40);
        let mut trainer = trainer(&config, &metadata, SkipSave::all());

        let outcome = trainer.train(&dataset, Some(&dataset), None, None).await.unwrap();
        let losses = &outcome.train_metrics["combined"]["loss"];
        // 40 rows, batch 8: one checkpoint per epoch
        assert_eq!(losses.len(), 3);
        assert_eq!(outcome.validation_metrics["y"]["accuracy"].len(), 3);
        assert!(outcome.test_metrics.is_empty());
        trainer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_steps_per_checkpoint_drives_cadence() {
        let (mut config, metadata, dataset) = fixture(40);
        config.trainer.steps_per_checkpoint = 5;
        let mut trainer = trainer(&config, &metadata, SkipSave::all());

        let outcome = trainer.train(&dataset, None, None, None).await.unwrap();
        // 15 steps in total
        assert_eq!(outcome.train_metrics["combined"]["loss"].len(), 3);
        assert_eq!(outcome.train_metrics["combined"]["loss"][1].step, 10);
    }

    #[tokio::test]
    async fn test_progress_and_weights_written_under_save_path() {
        let temp = TempDir::new().unwrap();
        let (config, metadata, dataset) = fixture(40);
        let mut trainer = trainer(&config, &metadata, SkipSave::default());

        trainer.train(&dataset, Some(&dataset), None, Some(temp.path())).await.unwrap();
        let checkpoints = temp.path().join(TRAINING_CHECKPOINTS_DIR_NAME);
        assert!(checkpoints.join(TRAINING_PROGRESS_FILE_NAME).exists());
        assert!(temp.path().join(crate::layout::MODEL_WEIGHTS_FILE_NAME).exists());
        assert!(temp.path().join(TRAINING_LOG_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_tuned_batch_size_is_bounded() {
        let (mut config, metadata, dataset) = fixture(100);
        config.trainer.max_batch_size = 16;
        let mut trainer = trainer(&config, &metadata, SkipSave::all());

        let tuned = trainer.tune_batch_size(&config, &dataset, 1).await.unwrap();
        assert_eq!(tuned, 16);

        config.trainer.max_batch_size = 1 << 20;
        let tuned = trainer.tune_batch_size(&config, &dataset, 1).await.unwrap();
        assert_eq!(tuned, 64);
    }

    #[tokio::test]
    async fn test_memory_budget_caps_batch_size() {
        let (config, metadata, dataset) = fixture(100);
        let mut trainer = trainer(&config, &metadata, SkipSave::all());
        // x plus one binary head: 2 values * 8 bytes * 4 buffers per row
        trainer.memory_budget_bytes = 64 * 4;

        let tuned = trainer.tune_batch_size(&config, &dataset, 1).await.unwrap();
        assert_eq!(tuned, 4);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (config, metadata, dataset) = fixture(10);
        let mut trainer = trainer(&config, &metadata, SkipSave::all());
        trainer.shutdown().await.unwrap();
        trainer.shutdown().await.unwrap();
    }
}
