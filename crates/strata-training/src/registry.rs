use crate::config::{ConfigModel, ModelType};
use crate::error::{TrainingError, TrainingResult};
use crate::local::LinearModelFactory;
use crate::metadata::TrainingSetMetadata;
use crate::model::Model;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Constructor bound to one [`ModelType`].
pub trait ModelFactory: Send + Sync {
    fn create(
        &self,
        config: &ConfigModel,
        metadata: &TrainingSetMetadata,
        random_seed: u64,
    ) -> TrainingResult<Box<dyn Model>>;
}

/// Model constructors keyed by model type. Lookups of unregistered types
/// fail with [`TrainingError::UnknownModelType`].
#[derive(Clone)]
pub struct ModelRegistry {
    factories: BTreeMap<ModelType, Arc<dyn ModelFactory>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry").field("model_types", &self.factories.keys().collect::<Vec<_>>()).finish()
    }
}

impl Default for ModelRegistry {
    /// Registry with the in-process linear model bound to `ecd`.
    fn default() -> Self {
        Self::empty().with(ModelType::Ecd, Arc::new(LinearModelFactory))
    }
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self { factories: BTreeMap::new() }
    }

    #[must_use]
    pub fn with(mut self, model_type: ModelType, factory: Arc<dyn ModelFactory>) -> Self {
        self.register(model_type, factory);
        self
    }

    pub fn register(&mut self, model_type: ModelType, factory: Arc<dyn ModelFactory>) {
        self.factories.insert(model_type, factory);
    }

    pub fn contains(&self, model_type: ModelType) -> bool {
        self.factories.contains_key(&model_type)
    }

    pub fn create(
        &self,
        config: &ConfigModel,
        metadata: &TrainingSetMetadata,
        random_seed: u64,
    ) -> TrainingResult<Box<dyn Model>> {
        let factory = self.factories.get(&config.model_type).ok_or_else(|| {
            TrainingError::UnknownModelType(format!("no constructor registered for model type {}", config.model_type))
        })?;
        factory.create(config, metadata, random_seed)
    }
}
