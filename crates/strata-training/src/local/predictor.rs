use crate::backend::Predictor;
use crate::dataset::ProcessedDataset;
use crate::error::TrainingResult;
use crate::metadata::TrainingSetMetadata;
use crate::metrics::scalar_metrics;
use crate::model::{Model, ModelOutputs};
use crate::stats::EvaluationStatistics;
use async_trait::async_trait;
use tracing::debug;

/// Run `model` over `dataset` in chunks of `batch_size` rows and stitch the
/// outputs back together in row order.
pub fn predict_in_batches(model: &dyn Model, dataset: &ProcessedDataset, batch_size: u64) -> TrainingResult<ModelOutputs> {
    let batch = (batch_size as usize).max(1);
    if dataset.len() <= batch {
        return model.predict(dataset);
    }

    let indices: Vec<usize> = (0..dataset.len()).collect();
    let mut merged = ModelOutputs::new();
    for chunk in indices.chunks(batch) {
        for (feature, outputs) in model.predict(&dataset.select(chunk))? {
            let entry = merged.entry(feature).or_default();
            entry.logits.extend(outputs.logits);
            if let Some(probabilities) = outputs.probabilities {
                entry.probabilities.get_or_insert_with(Vec::new).extend(probabilities);
            }
        }
    }
    Ok(merged)
}

pub struct LocalPredictor {
    model: Box<dyn Model>,
    batch_size: u64,
    released: bool,
}

impl LocalPredictor {
    pub fn new(model: Box<dyn Model>, batch_size: u64) -> Self {
        Self { model, batch_size, released: false }
    }
}

#[async_trait]
impl Predictor for LocalPredictor {
    async fn batch_predict(&mut self, dataset: &ProcessedDataset) -> TrainingResult<ModelOutputs> {
        debug!(rows = dataset.len(), batch_size = self.batch_size, "Predicting");
        predict_in_batches(self.model.as_ref(), dataset, self.batch_size)
    }

    async fn batch_evaluation(
        &mut self,
        dataset: &ProcessedDataset,
        metadata: &TrainingSetMetadata,
        collect_predictions: bool,
    ) -> TrainingResult<(EvaluationStatistics, Option<ModelOutputs>)> {
        let outputs = self.batch_predict(dataset).await?;
        let stats = scalar_metrics(self.model.config(), Some(metadata), dataset, &outputs)?;
        Ok((stats, collect_predictions.then_some(outputs)))
    }

    async fn shutdown(&mut self) -> TrainingResult<()> {
        if !self.released {
            self.released = true;
            debug!("Released local predictor");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigModel, FeatureConfig, FeatureType};
    use crate::dataset::RawFrame;
    use crate::local::linear::LinearModel;
    use serde_json::json;

    fn fixture() -> (Box<dyn Model>, TrainingSetMetadata, ProcessedDataset) {
        let config = ConfigModel::new(
            vec![FeatureConfig::new("x", FeatureType::Number)],
            vec![FeatureConfig::new("label", FeatureType::Category)],
        );
        let rows = (0..25)
            .filter_map(|i| {
                let label = ["a", "b", "c"][i % 3];
                json!({"x": i, "label": label}).as_object().cloned()
            })
            .collect();
        let frame = RawFrame::new(rows);
        let metadata = TrainingSetMetadata::fit(&config, &frame).unwrap();
        let dataset = metadata.encode(&config, &frame, true).unwrap();
        let model = LinearModel::new(&config, &metadata, 5).unwrap();
        (Box::new(model), metadata, dataset)
    }

    #[test]
    fn test_batched_predictions_match_single_pass() {
        let (model, _, dataset) = fixture();
        let whole = model.predict(&dataset).unwrap();
        let batched = predict_in_batches(model.as_ref(), &dataset, 4).unwrap();
        assert_eq!(batched["label"].logits.len(), 25);
        assert_eq!(whole, batched);
    }

    #[tokio::test]
    async fn test_batch_evaluation_collects_outputs_on_request() {
        let (model, metadata, dataset) = fixture();
        let mut predictor = LocalPredictor::new(model, 8);

        let (stats, outputs) = predictor.batch_evaluation(&dataset, &metadata, false).await.unwrap();
        assert!(stats["label"].contains_key("accuracy"));
        assert!(outputs.is_none());

        let (_, outputs) = predictor.batch_evaluation(&dataset, &metadata, true).await.unwrap();
        assert_eq!(outputs.unwrap()["label"].logits.len(), 25);
        predictor.shutdown().await.unwrap();
    }
}
