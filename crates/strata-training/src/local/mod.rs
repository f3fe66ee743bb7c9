//! In-process backend: a single coordinator with no peers.

mod linear;
mod predictor;
mod trainer;

pub use linear::{InputSlot, LinearModel, LinearModelFactory, LinearWeights, OutputHead};
pub use predictor::{predict_in_batches, LocalPredictor};
pub use trainer::LocalTrainer;

use crate::backend::{Backend, Predictor, Trainer, TrainerOptions};
use crate::config::TrainerConfig;
use crate::engine::{DataFrameEngine, LocalEngine};
use crate::error::{TrainingError, TrainingResult};
use crate::model::Model;
use async_trait::async_trait;
use tracing::debug;

pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    rank: usize,
    world_size: usize,
    engine: LocalEngine,
    memory_budget_bytes: u64,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self { rank: 0, world_size: 1, engine: LocalEngine, memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES }
    }

    /// A backend that reports `rank` out of `world_size`. There are no
    /// peers: broadcasts from a non-zero rank see nothing.
    pub fn simulated(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size: world_size.max(rank + 1), ..Self::new() }
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    fn num_nodes(&self) -> usize {
        self.world_size
    }

    fn engine(&self) -> &dyn DataFrameEngine {
        &self.engine
    }

    async fn create_trainer(
        &self,
        model: Box<dyn Model>,
        config: &TrainerConfig,
        options: TrainerOptions,
    ) -> TrainingResult<Box<dyn Trainer>> {
        let model = model.as_any().downcast_ref::<LinearModel>().cloned().ok_or_else(|| {
            TrainingError::UnsupportedOperation(format!(
                "the local backend cannot train {} models",
                model.model_type()
            ))
        })?;
        Ok(Box::new(LocalTrainer::new(model, config, options, self.memory_budget_bytes)))
    }

    async fn create_predictor(&self, model: Box<dyn Model>, batch_size: u64) -> TrainingResult<Box<dyn Predictor>> {
        Ok(Box::new(LocalPredictor::new(model, batch_size)))
    }

    async fn sync_model(&self, model: &mut Box<dyn Model>) -> TrainingResult<()> {
        debug!(model_type = %model.model_type(), "Nothing to sync on a single node");
        Ok(())
    }

    async fn broadcast_json(&self, value: Option<serde_json::Value>) -> TrainingResult<serde_json::Value> {
        Ok(value.unwrap_or(serde_json::Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::broadcast_return;

    #[test]
    fn test_only_rank_zero_coordinates() {
        assert!(LocalBackend::new().is_coordinator());
        let worker = LocalBackend::simulated(1, 2);
        assert!(!worker.is_coordinator());
        assert_eq!(worker.num_nodes(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_return_runs_on_coordinator_only() {
        let value: Option<u32> = broadcast_return(&LocalBackend::new(), || Ok(Some(7))).await.unwrap();
        assert_eq!(value, Some(7));

        let worker = LocalBackend::simulated(1, 2);
        let value: Option<u32> = broadcast_return(&worker, || panic!("ran on a worker")).await.unwrap();
        assert_eq!(value, None);
    }
}
