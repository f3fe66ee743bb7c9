//! Strata Training
//!
//! Backend-agnostic training lifecycle for:
//! - Preprocessing raw sources into encoded splits (`preprocess_for_training`)
//! - Driving a resumable, role-gated training run (`TrainingLifecycle`)
//! - Evaluating, predicting and k-fold cross validation
//! - Implementing execution backends (`Backend`, `Trainer`, `Predictor`)

pub mod artifacts;
pub mod backend;
pub mod calibration;
pub mod callback;
pub mod config;
pub mod dataset;
pub mod description;
pub mod engine;
pub mod error;
pub mod kfold;
pub mod layout;
pub mod lifecycle;
pub mod local;
pub mod metadata;
pub mod metrics;
pub mod model;
pub mod predictions;
pub mod preprocessing;
pub mod progress;
pub mod readers;
pub mod registry;
pub mod runtime;
pub mod stats;

pub use backend::{broadcast_return, Backend, Predictor, SkipSave, TrainOutcome, Trainer, TrainerGuard, TrainerOptions};
pub use callback::{Callback, CallbackBus, TrainInit};
pub use config::{ConfigModel, FeatureConfig, FeatureType, ModelType, TrainerConfig, Tunable};
pub use dataset::{DatasetSource, DatasetSources, ProcessedDataset, RawFrame, Split, SplitSelection};
pub use engine::{DataFrameEngine, LocalEngine};
pub use error::{TrainingError, TrainingResult};
pub use kfold::{kfold_cross_validate, KFoldOptions, KFoldResults};
pub use layout::RunLayout;
pub use lifecycle::{
    EvaluateOptions, EvaluationResults, ExperimentOptions, ExperimentResults, PredictOptions, RunOptions,
    TrainingLifecycle, TrainingResults,
};
pub use local::LocalBackend;
pub use metadata::TrainingSetMetadata;
pub use model::{CalibrationParams, Model, ModelOutputs};
pub use predictions::Predictions;
pub use preprocessing::{preprocess_for_training, PreprocessedData};
pub use progress::TrainingProgress;
pub use readers::DataFormat;
pub use registry::{ModelFactory, ModelRegistry};
pub use runtime::RuntimeSettings;
pub use stats::{EvaluationFrequency, EvaluationStatistics, Period, TrainingStats};
