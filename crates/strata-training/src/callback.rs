//! Lifecycle observers.
//!
//! Callbacks run in registration order. A failing callback is logged and the
//! remaining callbacks still run; callback errors never replace an error
//! raised by the run itself.

use crate::config::ConfigModel;
use crate::model::Model;
use crate::preprocessing::PreprocessedData;
use crate::progress::TrainingProgress;
use std::path::Path;
use std::sync::Arc;

/// Arguments of [`Callback::on_train_init`].
#[derive(Debug, Clone, Copy)]
pub struct TrainInit<'a> {
    pub config: &'a ConfigModel,
    pub experiment_name: &'a str,
    pub model_name: &'a str,
    pub output_directory: Option<&'a Path>,
    pub resume_directory: Option<&'a Path>,
}

pub trait Callback: Send + Sync {
    fn name(&self) -> &str;

    fn on_preprocess_start(&self, _config: &ConfigModel) -> anyhow::Result<()> {
        Ok(())
    }

    /// `data` is `None` when preprocessing failed.
    fn on_preprocess_end(&self, _data: Option<&PreprocessedData>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_train_init(&self, _init: &TrainInit<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_train_start(&self, _model: &dyn Model, _config: &ConfigModel, _config_path: Option<&Path>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_train_end(&self, _output_directory: Option<&Path>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_evaluation_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_evaluation_end(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_epoch_end(&self, _progress: &TrainingProgress, _save_path: Option<&Path>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_eval_end(&self, _progress: &TrainingProgress, _save_path: Option<&Path>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered list of callbacks shared between the lifecycle and its trainer.
#[derive(Clone, Default)]
pub struct CallbackBus {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl std::fmt::Debug for CallbackBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.callbacks.iter().map(|c| c.name())).finish()
    }
}

impl CallbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, callback: Arc<dyn Callback>) -> Self {
        self.register(callback);
        self
    }

    pub fn register(&mut self, callback: Arc<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Invoke `hook` on every callback in order.
    pub fn fire(&self, event: &str, hook: impl Fn(&dyn Callback) -> anyhow::Result<()>) {
        for callback in &self.callbacks {
            if let Err(e) = hook(callback.as_ref()) {
                tracing::warn!(
                    callback = %callback.name(),
                    event,
                    error = %e,
                    "Callback failed"
                );
            }
        }
    }
}
