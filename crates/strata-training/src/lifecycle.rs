//! The training lifecycle: one resumable, role-gated run from raw sources to
//! a trained, calibrated, persisted model.
//!
//! Every directory creation and file write below is guarded by
//! [`Backend::is_coordinator`], re-checked at the call site.

use crate::artifacts::{load_json, save_json};
use crate::backend::{broadcast_return, Backend, SkipSave, Trainer, TrainerGuard, TrainerOptions};
use crate::calibration::{calibrate, select_calibration_split, MIN_DATASET_SPLIT_ROWS};
use crate::callback::{CallbackBus, TrainInit};
use crate::config::{ConfigModel, DEFAULT_BATCH_SIZE, DEFAULT_RANDOM_SEED};
use crate::dataset::{DatasetSource, DatasetSources, ProcessedDataset, Split, SplitSelection};
use crate::description::RunDescription;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::{
    resolve_output_directory, RunLayout, PREDICTIONS_FILE_NAME, TEST_STATISTICS_FILE_NAME,
    TRAIN_SET_METADATA_FILE_NAME,
};
use crate::metadata::{update_config_with_metadata, TrainingSetMetadata};
use crate::model::Model;
use crate::predictions::{merge_statistics, overall_statistics, postprocess, save_raw_outputs, Predictions};
use crate::preprocessing::{preprocess_for_prediction, preprocess_for_training, PreprocessOptions, PreprocessedData};
use crate::readers::DataFormat;
use crate::registry::ModelRegistry;
use crate::stats::{EvaluationFrequency, EvaluationStatistics, TrainingReport, TrainingStats};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub experiment_name: String,
    pub model_name: String,
    /// Parent of the per-run directory.
    pub output_directory: PathBuf,
    /// Reused as the run directory when it exists.
    pub model_resume_path: Option<PathBuf>,
    pub skip_save: SkipSave,
    pub random_seed: u64,
    /// Smallest validation split used for calibration.
    pub min_calibration_rows: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            experiment_name: "experiment".to_string(),
            model_name: "run".to_string(),
            output_directory: PathBuf::from("results"),
            model_resume_path: None,
            skip_save: SkipSave::default(),
            random_seed: DEFAULT_RANDOM_SEED,
            min_calibration_rows: MIN_DATASET_SPLIT_ROWS,
        }
    }
}

/// What a finished run hands back.
#[derive(Debug, Clone)]
pub struct TrainingResults {
    train_stats: TrainingStats,
    preprocessed_data: PreprocessedData,
    output_directory: Option<PathBuf>,
}

impl TrainingResults {
    pub fn train_stats(&self) -> &TrainingStats {
        &self.train_stats
    }

    pub fn preprocessed_data(&self) -> &PreprocessedData {
        &self.preprocessed_data
    }

    /// `None` on non-coordinator roles.
    pub fn output_directory(&self) -> Option<&Path> {
        self.output_directory.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct EvaluateOptions {
    pub split: SplitSelection,
    pub data_format: DataFormat,
    pub batch_size: Option<u64>,
    pub collect_predictions: bool,
    pub collect_overall_stats: bool,
    /// Files are written here, on the coordinator, when set.
    pub output_directory: Option<PathBuf>,
    pub skip_save_unprocessed_output: bool,
    pub skip_save_predictions: bool,
    pub skip_save_eval_stats: bool,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            split: SplitSelection::Full,
            data_format: DataFormat::Auto,
            batch_size: None,
            collect_predictions: false,
            collect_overall_stats: false,
            output_directory: None,
            skip_save_unprocessed_output: false,
            skip_save_predictions: false,
            skip_save_eval_stats: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationResults {
    pub statistics: EvaluationStatistics,
    pub predictions: Option<Predictions>,
    pub output_directory: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PredictOptions {
    pub split: SplitSelection,
    pub data_format: DataFormat,
    pub batch_size: Option<u64>,
    pub output_directory: Option<PathBuf>,
    pub skip_save_unprocessed_output: bool,
    pub skip_save_predictions: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            split: SplitSelection::Full,
            data_format: DataFormat::Auto,
            batch_size: None,
            output_directory: None,
            skip_save_unprocessed_output: false,
            skip_save_predictions: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentOptions {
    pub run: RunOptions,
    /// `training`, `validation` or `test`.
    pub eval_split: String,
    pub skip_save_unprocessed_output: bool,
    pub skip_save_predictions: bool,
    pub skip_save_eval_stats: bool,
}

impl Default for ExperimentOptions {
    fn default() -> Self {
        Self {
            run: RunOptions::default(),
            eval_split: Split::Test.as_str().to_string(),
            skip_save_unprocessed_output: false,
            skip_save_predictions: false,
            skip_save_eval_stats: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentResults {
    pub training: TrainingResults,
    /// `None` when evaluation was skipped.
    pub evaluation: Option<EvaluationStatistics>,
}

pub struct TrainingLifecycle {
    config: ConfigModel,
    backend: Arc<dyn Backend>,
    registry: ModelRegistry,
    callbacks: CallbackBus,
    model: Option<Box<dyn Model>>,
    training_set_metadata: Option<TrainingSetMetadata>,
    online_trainer: Option<TrainerGuard>,
}

impl std::fmt::Debug for TrainingLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingLifecycle")
            .field("model_type", &self.config.model_type)
            .field("backend", &self.backend.name())
            .field("callbacks", &self.callbacks)
            .field("has_model", &self.model.is_some())
            .finish_non_exhaustive()
    }
}

impl TrainingLifecycle {
    pub fn new(config: ConfigModel, backend: Arc<dyn Backend>) -> TrainingResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend,
            registry: ModelRegistry::default(),
            callbacks: CallbackBus::new(),
            model: None,
            training_set_metadata: None,
            online_trainer: None,
        })
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_callbacks(mut self, callbacks: CallbackBus) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn config(&self) -> &ConfigModel {
        &self.config
    }

    pub fn model(&self) -> Option<&dyn Model> {
        self.model.as_deref()
    }

    pub fn training_set_metadata(&self) -> Option<&TrainingSetMetadata> {
        self.training_set_metadata.as_ref()
    }

    fn is_coordinator(&self) -> bool {
        self.backend.is_coordinator()
    }

    /// Resume path when it exists, else a fresh directory on the coordinator
    /// and `None` everywhere else.
    fn resolve_run_directory(&self, options: &RunOptions) -> (Option<PathBuf>, bool) {
        if let Some(path) = &options.model_resume_path {
            if path.exists() {
                if self.is_coordinator() {
                    info!(path = %path.display(), "Resuming run");
                }
                return (self.is_coordinator().then(|| path.clone()), true);
            }
            if self.is_coordinator() {
                warn!(path = %path.display(), "Model resume path does not exist, starting a fresh run");
            }
        }
        let fresh = self.is_coordinator().then(|| {
            resolve_output_directory(&options.output_directory, &options.experiment_name, &options.model_name)
        });
        (fresh, false)
    }

    /// Train a model on `sources`.
    pub async fn run(&mut self, sources: &DatasetSources, options: &RunOptions) -> TrainingResult<TrainingResults> {
        self.config.validate()?;
        let skip = options.skip_save;

        // Run directory
        let (output_directory, resume) = self.resolve_run_directory(options);
        let layout = match &output_directory {
            Some(dir) if self.is_coordinator() && !skip.skips_everything() => {
                let layout = RunLayout::new(dir.clone());
                layout.ensure_root()?;
                Some(layout)
            }
            _ => None,
        };
        if let Some(layout) = &layout {
            info!(path = %layout.root().display(), "Run directory");
        }

        // Preprocessing
        let data = match sources.preprocessed() {
            Some((training_set, validation_set, test_set, training_set_metadata)) => {
                debug!("Using preprocessed training set");
                PreprocessedData { training_set, validation_set, test_set, training_set_metadata }
            }
            None => {
                if self.is_coordinator() {
                    let description =
                        RunDescription::new(&self.config, sources, self.backend.as_ref(), options.random_seed)?;
                    if let Some(layout) = layout.as_ref().filter(|_| !skip.training_description) {
                        description.save(&layout.description_path())?;
                    }
                    description.log();
                }
                self.preprocess(sources, options).await?
            }
        };

        if self.is_coordinator() {
            data.statistics().log();
            if let Some(layout) = layout.as_ref().filter(|_| !skip.model) {
                layout.ensure_model_dir()?;
                save_json(&layout.metadata_path(), &data.training_set_metadata)?;
            }
        }
        self.training_set_metadata = Some(data.training_set_metadata.clone());

        self.callbacks.fire("on_train_init", |cb| {
            cb.on_train_init(&TrainInit {
                config: &self.config,
                experiment_name: &options.experiment_name,
                model_name: &options.model_name,
                output_directory: output_directory.as_deref(),
                resume_directory: resume.then_some(output_directory.as_deref()).flatten(),
            })
        });

        // Model
        if self.model.is_none() {
            update_config_with_metadata(&mut self.config, &data.training_set_metadata)?;
            self.model = Some(self.registry.create(&self.config, &data.training_set_metadata, options.random_seed)?);
            self.config.saved_weights_in_checkpoint = true;
        }

        // Trainer; the guard releases it if this future is dropped or unwinds.
        let model = self.model.clone().ok_or_else(|| TrainingError::Initialization("model was not built".to_string()))?;
        let trainer_options = TrainerOptions {
            resume,
            skip_save: skip,
            callbacks: self.callbacks.clone(),
            random_seed: options.random_seed,
        };
        let mut trainer =
            TrainerGuard::new(self.backend.create_trainer(model, &self.config.trainer, trainer_options).await?);
        let trained = self.train_with(trainer.trainer(), &data, layout.as_ref(), options).await;
        self.callbacks.fire("on_train_end", |cb| cb.on_train_end(output_directory.as_deref()));
        let released = trainer.shutdown().await;
        let train_stats = trained?;
        released?;

        if self.is_coordinator() {
            if let Some(layout) = layout.as_ref().filter(|_| !skip.training_statistics) {
                train_stats.save(&layout.training_statistics_path())?;
            }
            if let Some(report) = TrainingReport::from_stats(&train_stats, &self.config.trainer) {
                report.log();
            }
            // Weights may have been produced elsewhere; make sure they are on disk.
            if let Some(layout) = layout.as_ref().filter(|_| !skip.model) {
                self.save_model_weights(&layout.model_dir())?;
            }
        }
        if let Some(model) = self.model.as_mut() {
            self.backend.sync_model(model).await?;
        }
        if let Some(layout) = &layout {
            info!(path = %layout.root().display(), "Finished training");
        }

        Ok(TrainingResults { train_stats, preprocessed_data: data, output_directory })
    }

    async fn preprocess(&self, sources: &DatasetSources, options: &RunOptions) -> TrainingResult<PreprocessedData> {
        self.callbacks.fire("on_preprocess_start", |cb| cb.on_preprocess_start(&self.config));
        let preprocess_options = PreprocessOptions {
            skip_save_processed_input: options.skip_save.processed_input,
            random_seed: options.random_seed,
        };
        let result = preprocess_for_training(&self.config, sources, preprocess_options, self.backend.as_ref()).await;
        self.callbacks.fire("on_preprocess_end", |cb| cb.on_preprocess_end(result.as_ref().ok()));
        result
    }

    /// Tuning, training, calibration and the first weight save.
    async fn train_with(
        &mut self,
        trainer: &mut dyn Trainer,
        data: &PreprocessedData,
        layout: Option<&RunLayout>,
        options: &RunOptions,
    ) -> TrainingResult<TrainingStats> {
        self.tune(trainer, &data.training_set, options.random_seed).await?;

        let skip = options.skip_save;
        let model_dir = layout.filter(|_| !skip.model).map(RunLayout::model_dir);
        if self.is_coordinator() {
            if let Some(dir) = &model_dir {
                self.config.save(dir)?;
            }
        }
        if let Some(model) = self.model.as_deref() {
            self.callbacks
                .fire("on_train_start", |cb| cb.on_train_start(model, &self.config, model_dir.as_deref()));
        }

        let save_path = layout.map(RunLayout::model_dir);
        let outcome = trainer
            .train(&data.training_set, data.validation_set.as_ref(), data.test_set.as_ref(), save_path.as_deref())
            .await?;
        let model = self.model.insert(outcome.model);

        // Field access only below: `model` borrows `self.model` mutably.
        let coordinator = self.backend.is_coordinator();
        if coordinator && self.config.calibration_enabled() {
            let (split, dataset) = select_calibration_split(data, options.min_calibration_rows);
            info!(split = %split, rows = dataset.len(), "Calibrating");
            calibrate(model.as_mut(), &self.config, dataset)?;
        }
        if coordinator {
            if let Some(dir) = &model_dir {
                model.save_weights(dir)?;
            }
        }

        Ok(TrainingStats::from_histories(
            &outcome.train_metrics,
            &outcome.validation_metrics,
            &outcome.test_metrics,
            EvaluationFrequency::resolve(&self.config.trainer),
        ))
    }

    /// Resolve `auto` batch sizes and learning rate, once, before training.
    async fn tune(&mut self, trainer: &mut dyn Trainer, dataset: &ProcessedDataset, random_seed: u64) -> TrainingResult<()> {
        if self.config.trainer.needs_batch_size_tuning() {
            let tuned = trainer.tune_batch_size(&self.config, dataset, random_seed).await?;
            if self.config.trainer.resolve_batch_size(tuned) {
                trainer.set_batch_size(tuned);
            }
            if self.config.trainer.resolve_eval_batch_size(tuned) {
                trainer.set_eval_batch_size(tuned);
            }
        }
        if self.config.trainer.needs_learning_rate_tuning() {
            let rate = trainer.tune_learning_rate(&self.config, dataset, random_seed).await?;
            if self.config.trainer.resolve_learning_rate(rate) {
                trainer.set_base_learning_rate(rate);
            }
        }
        Ok(())
    }

    fn require_model(&self) -> TrainingResult<(&dyn Model, &TrainingSetMetadata)> {
        match (self.model.as_deref(), self.training_set_metadata.as_ref()) {
            (Some(model), Some(metadata)) => Ok((model, metadata)),
            _ => Err(TrainingError::Initialization("train or load a model first".to_string())),
        }
    }

    fn inference_batch_size(&self, requested: Option<u64>) -> u64 {
        requested
            .or_else(|| self.config.trainer.effective_eval_batch_size())
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    /// Metrics over `dataset`, which must carry the output columns.
    pub async fn evaluate(&self, dataset: &DatasetSource, options: &EvaluateOptions) -> TrainingResult<EvaluationResults> {
        let (model, metadata) = self.require_model()?;
        let dataset = preprocess_for_prediction(
            &self.config,
            dataset,
            metadata,
            true,
            options.split,
            options.data_format,
            self.backend.engine(),
        )?;

        self.callbacks.fire("on_evaluation_start", |cb| cb.on_evaluation_start());
        let collect = options.collect_predictions || options.collect_overall_stats;
        let mut predictor = self
            .backend
            .create_predictor(model.clone_box(), self.inference_batch_size(options.batch_size))
            .await?;
        let evaluated = predictor.batch_evaluation(&dataset, metadata, collect).await;
        let released = predictor.shutdown().await;
        self.callbacks.fire("on_evaluation_end", |cb| cb.on_evaluation_end());
        let (mut statistics, outputs) = evaluated?;
        released?;

        let predictions = match (&outputs, options.collect_predictions) {
            (Some(outputs), true) => Some(postprocess(&self.config, metadata, outputs)?),
            _ => None,
        };
        if let (Some(outputs), true) = (&outputs, options.collect_overall_stats) {
            merge_statistics(&mut statistics, overall_statistics(&self.config, metadata, &dataset, outputs)?);
        }

        let writes = !options.skip_save_eval_stats
            || (!options.skip_save_predictions && predictions.is_some())
            || (!options.skip_save_unprocessed_output && outputs.is_some());
        if let Some(dir) = options.output_directory.as_deref().filter(|_| writes && self.is_coordinator()) {
            std::fs::create_dir_all(dir)?;
            if !options.skip_save_eval_stats {
                save_json(&dir.join(TEST_STATISTICS_FILE_NAME), &statistics)?;
            }
            if let Some(predictions) = predictions.as_ref().filter(|_| !options.skip_save_predictions) {
                predictions.save_csv(&dir.join(PREDICTIONS_FILE_NAME))?;
            }
            if let Some(outputs) = outputs.as_ref().filter(|_| !options.skip_save_unprocessed_output) {
                save_raw_outputs(dir, outputs)?;
            }
            info!(path = %dir.display(), "Saved evaluation results");
        }

        Ok(EvaluationResults { statistics, predictions, output_directory: options.output_directory.clone() })
    }

    /// Decoded predictions for `dataset`; output columns are not required.
    pub async fn predict(&self, dataset: &DatasetSource, options: &PredictOptions) -> TrainingResult<Predictions> {
        let (model, metadata) = self.require_model()?;
        let dataset = preprocess_for_prediction(
            &self.config,
            dataset,
            metadata,
            false,
            options.split,
            options.data_format,
            self.backend.engine(),
        )?;

        let mut predictor = self
            .backend
            .create_predictor(model.clone_box(), self.inference_batch_size(options.batch_size))
            .await?;
        let predicted = predictor.batch_predict(&dataset).await;
        let released = predictor.shutdown().await;
        let outputs = predicted?;
        released?;

        let predictions = postprocess(&self.config, metadata, &outputs)?;
        let writes = !options.skip_save_predictions || !options.skip_save_unprocessed_output;
        if let Some(dir) = options.output_directory.as_deref().filter(|_| writes && self.is_coordinator()) {
            std::fs::create_dir_all(dir)?;
            if !options.skip_save_predictions {
                predictions.save_csv(&dir.join(PREDICTIONS_FILE_NAME))?;
            }
            if !options.skip_save_unprocessed_output {
                save_raw_outputs(dir, &outputs)?;
            }
            info!(path = %dir.display(), "Saved predictions");
        }
        Ok(predictions)
    }

    /// Train, then evaluate on `eval_split`. Evaluation a model cannot
    /// perform is skipped with a warning.
    pub async fn experiment(
        &mut self,
        sources: &DatasetSources,
        options: &ExperimentOptions,
    ) -> TrainingResult<ExperimentResults> {
        let training = self.run(sources, &options.run).await?;

        let split = match options.eval_split.parse::<SplitSelection>().ok().and_then(|s| s.split()) {
            Some(split) => split,
            None => {
                warn!(eval_split = %options.eval_split, "Unknown evaluation split, using validation");
                Split::Validation
            }
        };
        let data = training.preprocessed_data();
        let dataset = match split {
            Split::Training => Some(&data.training_set),
            Split::Validation => data.validation_set.as_ref(),
            Split::Test => data.test_set.as_ref(),
        };
        let Some(dataset) = dataset else {
            warn!(split = %split, "No rows in the evaluation split, skipping evaluation");
            return Ok(ExperimentResults { training, evaluation: None });
        };

        let evaluate_options = EvaluateOptions {
            collect_predictions: !options.skip_save_predictions,
            collect_overall_stats: true,
            output_directory: training.output_directory().filter(|dir| dir.exists()).map(Path::to_path_buf),
            skip_save_unprocessed_output: options.skip_save_unprocessed_output,
            skip_save_predictions: options.skip_save_predictions,
            skip_save_eval_stats: options.skip_save_eval_stats,
            ..EvaluateOptions::default()
        };
        let evaluation = match self.evaluate(&DatasetSource::Processed(dataset.clone()), &evaluate_options).await {
            Ok(results) => Some(results.statistics),
            Err(e) if e.is_unsupported() => {
                warn!(error = %e, "Evaluation is not supported for this model, skipping");
                None
            }
            Err(e) => return Err(e),
        };
        Ok(ExperimentResults { training, evaluation })
    }

    /// One incremental pass over `dataset`. The online trainer is kept
    /// across calls until [`TrainingLifecycle::shutdown`].
    pub async fn train_online(&mut self, dataset: &DatasetSource, data_format: DataFormat) -> TrainingResult<()> {
        let sources = DatasetSources {
            training_set: Some(dataset.clone()),
            training_set_metadata: self.training_set_metadata.clone(),
            data_format,
            ..DatasetSources::default()
        };
        let preprocess_options = PreprocessOptions { skip_save_processed_input: true, random_seed: DEFAULT_RANDOM_SEED };
        let data = preprocess_for_training(&self.config, &sources, preprocess_options, self.backend.as_ref()).await?;

        if self.model.is_none() {
            update_config_with_metadata(&mut self.config, &data.training_set_metadata)?;
            self.model = Some(self.registry.create(&self.config, &data.training_set_metadata, DEFAULT_RANDOM_SEED)?);
        }
        self.training_set_metadata = Some(data.training_set_metadata);

        if self.online_trainer.is_none() {
            let model = self.model.clone().ok_or_else(|| TrainingError::Initialization("model was not built".to_string()))?;
            let options = TrainerOptions {
                resume: false,
                skip_save: SkipSave::all(),
                callbacks: self.callbacks.clone(),
                random_seed: DEFAULT_RANDOM_SEED,
            };
            let trainer = self.backend.create_trainer(model, &self.config.trainer, options).await?;
            self.online_trainer = Some(TrainerGuard::new(trainer));
        }
        if let Some(guard) = self.online_trainer.as_mut() {
            self.model = Some(guard.trainer().train_online(&data.training_set).await?);
        }
        Ok(())
    }

    /// Release the online trainer, if one was created.
    pub async fn shutdown(&mut self) -> TrainingResult<()> {
        if let Some(trainer) = self.online_trainer.take() {
            trainer.shutdown().await?;
        }
        Ok(())
    }

    /// Rebuild a lifecycle from a saved model directory. Files are read on
    /// the coordinator and shared with every role.
    pub async fn load(model_dir: &Path, backend: Arc<dyn Backend>, registry: ModelRegistry) -> TrainingResult<Self> {
        let config: ConfigModel = broadcast_return(backend.as_ref(), || ConfigModel::load(model_dir)).await?;
        let metadata: TrainingSetMetadata =
            broadcast_return(backend.as_ref(), || load_json(&model_dir.join(TRAIN_SET_METADATA_FILE_NAME))).await?;

        let mut model = registry.create(&config, &metadata, DEFAULT_RANDOM_SEED)?;
        if backend.is_coordinator() {
            model.load_weights(model_dir)?;
        }
        backend.sync_model(&mut model).await?;
        info!(path = %model_dir.display(), model_type = %config.model_type, "Loaded model");

        Ok(Self {
            config,
            backend,
            registry,
            callbacks: CallbackBus::new(),
            model: Some(model),
            training_set_metadata: Some(metadata),
            online_trainer: None,
        })
    }

    fn save_model_weights(&self, dir: &Path) -> TrainingResult<()> {
        let (model, _) = self.require_model()?;
        model.save_weights(dir)
    }

    /// Config, weights and metadata into `dir`.
    pub fn save(&self, dir: &Path) -> TrainingResult<()> {
        let (model, metadata) = self.require_model()?;
        if !self.is_coordinator() {
            return Ok(());
        }
        self.config.save(dir)?;
        model.save_weights(dir)?;
        save_json(&dir.join(TRAIN_SET_METADATA_FILE_NAME), metadata)?;
        info!(path = %dir.display(), "Saved model");
        Ok(())
    }

    /// `model_hyperparameters.json` only.
    pub fn save_config(&self, dir: &Path) -> TrainingResult<()> {
        if self.is_coordinator() {
            self.config.save(dir)?;
        }
        Ok(())
    }
}
