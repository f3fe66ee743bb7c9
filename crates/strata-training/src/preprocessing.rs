//! Turns dataset sources into encoded train/validation/test splits plus the
//! metadata that describes the encodings.
//!
//! Preprocessing runs on every role. Only the coordinator reads or writes
//! the on-disk cache; workers receive cache hits through the backend.

use crate::artifacts::{load_json, save_json, sha256_bytes, sha256_file};
use crate::backend::{broadcast_return, Backend};
use crate::config::ConfigModel;
use crate::dataset::{DatasetSource, DatasetSources, ProcessedDataset, RawFrame, SplitSelection};
use crate::engine::DataFrameEngine;
use crate::error::{TrainingError, TrainingResult};
use crate::metadata::TrainingSetMetadata;
use crate::readers::{read_source, DataFormat};
use crate::stats::DatasetStatistics;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const META_CACHE_SUFFIX: &str = "meta.json";
pub const PROCESSED_CACHE_SUFFIX: &str = "processed.json";

/// Encoded splits plus their training-set metadata. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessedData {
    pub training_set: ProcessedDataset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_set: Option<ProcessedDataset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_set: Option<ProcessedDataset>,
    pub training_set_metadata: TrainingSetMetadata,
}

impl PreprocessedData {
    pub fn statistics(&self) -> DatasetStatistics {
        DatasetStatistics {
            training: self.training_set.len(),
            validation: self.validation_set.as_ref().map_or(0, ProcessedDataset::len),
            test: self.test_set.as_ref().map_or(0, ProcessedDataset::len),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PreprocessOptions {
    pub skip_save_processed_input: bool,
    pub random_seed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedSplits {
    key: String,
    training_set: ProcessedDataset,
    validation_set: Option<ProcessedDataset>,
    test_set: Option<ProcessedDataset>,
}

/// `<dir>/<stem>.meta.json` and `<dir>/<stem>.processed.json` next to `source`.
pub fn cache_paths(source: &Path) -> (PathBuf, PathBuf) {
    let stem = source.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let dir = source.parent().unwrap_or_else(|| Path::new(""));
    (
        dir.join(format!("{stem}.{META_CACHE_SUFFIX}")),
        dir.join(format!("{stem}.{PROCESSED_CACHE_SUFFIX}")),
    )
}

/// File the cache lives next to: the combined dataset, else the training set.
fn cache_anchor(sources: &DatasetSources) -> Option<&Path> {
    let source = if sources.has_explicit_splits() { sources.training_set.as_ref() } else { sources.dataset.as_ref() };
    source.and_then(DatasetSource::as_path)
}

/// SHA-256 over source identities and contents plus the parts of the config
/// that influence encoding.
pub fn cache_key(sources: &DatasetSources, config: &ConfigModel) -> TrainingResult<String> {
    let mut parts = Vec::new();
    let roles = [&sources.dataset, &sources.training_set, &sources.validation_set, &sources.test_set];
    for source in roles.into_iter().flatten() {
        let digest = match source.as_path() {
            Some(path) => sha256_file(path)?,
            None => String::new(),
        };
        parts.push(serde_json::json!({ "source": source.identity(), "sha256": digest }));
    }
    let features: Vec<serde_json::Value> = config
        .features()
        .map(|(f, is_output)| {
            serde_json::json!({
                "name": f.name,
                "type": f.feature_type,
                "column": f.column(),
                "output": is_output,
                "preprocessing": f.preprocessing,
            })
        })
        .collect();
    let payload = serde_json::json!({
        "sources": parts,
        "data_format": sources.data_format,
        "preprocessing": config.preprocessing,
        "features": features,
    });
    Ok(sha256_bytes(&serde_json::to_vec(&payload)?))
}

fn load_cache(anchor: &Path, key: &str) -> TrainingResult<Option<PreprocessedData>> {
    let (meta_path, processed_path) = cache_paths(anchor);
    if !meta_path.exists() || !processed_path.exists() {
        return Ok(None);
    }
    let cached: CachedSplits = load_json(&processed_path)?;
    if cached.key != key {
        debug!(path = %processed_path.display(), "Cached dataset key mismatch, recomputing");
        return Ok(None);
    }
    let training_set_metadata: TrainingSetMetadata = load_json(&meta_path)?;
    Ok(Some(PreprocessedData {
        training_set: cached.training_set,
        validation_set: cached.validation_set,
        test_set: cached.test_set,
        training_set_metadata,
    }))
}

fn save_cache(anchor: &Path, key: &str, data: &PreprocessedData) -> TrainingResult<()> {
    let (meta_path, processed_path) = cache_paths(anchor);
    save_json(&meta_path, &data.training_set_metadata)?;
    let cached = CachedSplits {
        key: key.to_string(),
        training_set: data.training_set.clone(),
        validation_set: data.validation_set.clone(),
        test_set: data.test_set.clone(),
    };
    save_json(&processed_path, &cached)?;
    info!(path = %processed_path.display(), "Saved preprocessed dataset cache");
    Ok(())
}

fn load_raw_splits(
    config: &ConfigModel,
    sources: &DatasetSources,
    random_seed: u64,
    engine: &dyn DataFrameEngine,
) -> TrainingResult<[RawFrame; 3]> {
    let format = sources.data_format;
    if let Some(training) = &sources.training_set {
        let read_optional = |source: &Option<DatasetSource>| -> TrainingResult<RawFrame> {
            source.as_ref().map_or_else(|| Ok(RawFrame::default()), |s| read_source(s, format))
        };
        return Ok([
            read_source(training, format)?,
            read_optional(&sources.validation_set)?,
            read_optional(&sources.test_set)?,
        ]);
    }

    let dataset = sources
        .dataset
        .as_ref()
        .ok_or_else(|| TrainingError::Dataset("no dataset to preprocess".to_string()))?;
    let frame = read_source(dataset, format)?;
    let split = &config.preprocessing.split;
    if frame.has_column(&split.column) {
        debug!(column = %split.column, "Splitting dataset by indicator column");
        engine.split_by_column(&frame, &split.column)
    } else {
        engine.split_random(&frame, split.probabilities, random_seed)
    }
}

fn non_empty(ds: ProcessedDataset) -> Option<ProcessedDataset> {
    if ds.is_empty() { None } else { Some(ds) }
}

/// Build or load the training, validation and test splits.
pub async fn preprocess_for_training(
    config: &ConfigModel,
    sources: &DatasetSources,
    options: PreprocessOptions,
    backend: &dyn Backend,
) -> TrainingResult<PreprocessedData> {
    sources.validate()?;

    if let Some((training_set, validation_set, test_set, training_set_metadata)) = sources.preprocessed() {
        return Ok(PreprocessedData { training_set, validation_set, test_set, training_set_metadata });
    }

    let anchor = cache_anchor(sources).map(Path::to_path_buf);
    let key = match &anchor {
        Some(_) => Some(cache_key(sources, config)?),
        None => None,
    };

    if let (Some(anchor), Some(key)) = (&anchor, &key) {
        let cached: Option<PreprocessedData> = broadcast_return(backend, || load_cache(anchor, key)).await?;
        if let Some(data) = cached {
            if backend.is_coordinator() {
                info!(path = %anchor.display(), "Using cached preprocessed dataset");
            }
            return Ok(data);
        }
    }

    let [train_frame, validation_frame, test_frame] =
        load_raw_splits(config, sources, options.random_seed, backend.engine())?;
    if train_frame.is_empty() {
        return Err(TrainingError::Preprocessing("training split is empty".to_string()));
    }

    let training_set_metadata = match &sources.training_set_metadata {
        Some(metadata) => metadata.clone(),
        None => TrainingSetMetadata::fit(config, &train_frame)?,
    };
    let training_set = training_set_metadata.encode(config, &train_frame, true)?;
    if training_set.is_empty() {
        return Err(TrainingError::Preprocessing(
            "every training row was dropped for missing output values".to_string(),
        ));
    }
    let data = PreprocessedData {
        training_set,
        validation_set: non_empty(training_set_metadata.encode(config, &validation_frame, true)?),
        test_set: non_empty(training_set_metadata.encode(config, &test_frame, true)?),
        training_set_metadata,
    };

    if let (Some(anchor), Some(key)) = (&anchor, &key) {
        if backend.is_coordinator() && !options.skip_save_processed_input {
            save_cache(anchor, key, &data)?;
        }
    }
    Ok(data)
}

/// Encode a dataset for inference with previously fitted metadata. Ground
/// truth columns are encoded only when `include_outputs` is set.
pub fn preprocess_for_prediction(
    config: &ConfigModel,
    dataset: &DatasetSource,
    metadata: &TrainingSetMetadata,
    include_outputs: bool,
    split: SplitSelection,
    format: DataFormat,
    engine: &dyn DataFrameEngine,
) -> TrainingResult<ProcessedDataset> {
    if let DatasetSource::Processed(ds) = dataset {
        return Ok(ds.clone());
    }

    let mut frame = read_source(dataset, format)?;
    if let Some(wanted) = split.split() {
        let column = &config.preprocessing.split.column;
        if frame.has_column(column) {
            let splits = engine.split_by_column(&frame, column)?;
            frame = splits[wanted.index()].clone();
        } else {
            debug!(split = %wanted, "No split column, using the full dataset");
        }
    }
    metadata.encode(config, &frame, include_outputs)
}
