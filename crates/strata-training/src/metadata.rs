//! Training-set metadata: per-feature encoding parameters fitted on the
//! training split, and the encoders that apply them to raw rows.

use crate::config::{
    ConfigModel, FeatureConfig, FeatureType, MissingValueStrategy, Normalization, Padding, Tokenizer,
};
use crate::dataset::{EncodedColumn, ProcessedDataset, RawFrame, Record};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub const UNKNOWN_SYMBOL: &str = "<UNK>";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureMetadata {
    Binary {
        fill_value: bool,
    },
    Number {
        mean: f64,
        std: f64,
        min: f64,
        max: f64,
        fill_value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        normalization: Option<Normalization>,
    },
    Category {
        /// Index 0 is always [`UNKNOWN_SYMBOL`].
        idx2str: Vec<String>,
        fill_value: String,
    },
    Vector {
        vector_size: usize,
        fill_value: Vec<f64>,
    },
    Timeseries {
        max_length: usize,
        tokenizer: Tokenizer,
        padding: Padding,
        padding_value: f64,
    },
}

impl FeatureMetadata {
    /// Width of the feature once flattened into a model input.
    pub fn encoded_width(&self) -> usize {
        match self {
            Self::Binary { .. } | Self::Number { .. } => 1,
            Self::Category { idx2str, .. } => idx2str.len(),
            Self::Vector { vector_size, .. } => *vector_size,
            Self::Timeseries { max_length, .. } => *max_length,
        }
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        match self {
            Self::Category { idx2str, .. } => idx2str.get(index).map(String::as_str),
            _ => None,
        }
    }

    pub fn normalize(&self, value: f64) -> f64 {
        match self {
            Self::Number { mean, std, min, max, normalization, .. } => match normalization {
                Some(Normalization::Zscore) => (value - mean) / safe_scale(*std),
                Some(Normalization::Minmax) => (value - min) / safe_scale(max - min),
                None => value,
            },
            _ => value,
        }
    }

    pub fn denormalize(&self, value: f64) -> f64 {
        match self {
            Self::Number { mean, std, min, max, normalization, .. } => match normalization {
                Some(Normalization::Zscore) => value * safe_scale(*std) + mean,
                Some(Normalization::Minmax) => value * safe_scale(max - min) + min,
                None => value,
            },
            _ => value,
        }
    }
}

fn safe_scale(scale: f64) -> f64 {
    if scale.abs() < f64::EPSILON { 1.0 } else { scale }
}

/// Fitted encoders for every feature of a config, keyed by feature name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainingSetMetadata {
    pub features: BTreeMap<String, FeatureMetadata>,
}

impl TrainingSetMetadata {
    pub fn get(&self, feature: &str) -> TrainingResult<&FeatureMetadata> {
        self.features
            .get(feature)
            .ok_or_else(|| TrainingError::Preprocessing(format!("no training set metadata for feature {feature}")))
    }

    /// Fit encoders on the training split only.
    pub fn fit(config: &ConfigModel, training: &RawFrame) -> TrainingResult<Self> {
        let mut features = BTreeMap::new();
        for (feature, is_output) in config.features() {
            let metadata = fit_feature(feature, is_output, training)?;
            features.insert(feature.name.clone(), metadata);
        }
        Ok(Self { features })
    }

    /// Encode `frame`. Output features are encoded only when `include_outputs`;
    /// rows missing a `drop_row` feature are removed.
    pub fn encode(&self, config: &ConfigModel, frame: &RawFrame, include_outputs: bool) -> TrainingResult<ProcessedDataset> {
        let selected: Vec<(&FeatureConfig, bool)> =
            config.features().filter(|(_, is_output)| include_outputs || !is_output).collect();

        let kept: Vec<&Record> = frame
            .rows
            .iter()
            .filter(|row| {
                selected.iter().all(|(feature, is_output)| {
                    feature.missing_value_strategy(*is_output) != MissingValueStrategy::DropRow
                        || !is_missing(row.get(feature.column()))
                })
            })
            .collect();

        let mut columns = BTreeMap::new();
        for (feature, _) in selected {
            let metadata = self.get(&feature.name)?;
            let column = encode_column(feature, metadata, &kept)?;
            columns.insert(feature.name.clone(), column);
        }
        ProcessedDataset::new(columns)
    }
}

/// Fold metadata-derived sizes into the feature configs before the model is built.
pub fn update_config_with_metadata(config: &mut ConfigModel, metadata: &TrainingSetMetadata) -> TrainingResult<()> {
    for feature in config.input_features.iter_mut() {
        match metadata.get(&feature.name)? {
            FeatureMetadata::Category { idx2str, .. } => feature.vocab_size = Some(idx2str.len()),
            FeatureMetadata::Vector { vector_size, .. } => feature.vector_size = Some(*vector_size),
            FeatureMetadata::Timeseries { max_length, .. } => feature.max_sequence_length = Some(*max_length),
            FeatureMetadata::Binary { .. } | FeatureMetadata::Number { .. } => {}
        }
    }
    for feature in config.output_features.iter_mut() {
        match metadata.get(&feature.name)? {
            FeatureMetadata::Category { idx2str, .. } => {
                feature.vocab_size = Some(idx2str.len());
                feature.num_classes = Some(idx2str.len());
            }
            FeatureMetadata::Binary { .. } => feature.num_classes = Some(2),
            FeatureMetadata::Vector { vector_size, .. } => feature.vector_size = Some(*vector_size),
            FeatureMetadata::Number { .. } | FeatureMetadata::Timeseries { .. } => {}
        }
    }
    Ok(())
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn present<'a>(frame: &'a RawFrame, column: &str) -> impl Iterator<Item = &'a Value> + 'a {
    let column = column.to_string();
    frame.rows.iter().filter_map(move |row| row.get(&column)).filter(|v| !is_missing(Some(*v)))
}

pub(crate) fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" | "1.0" => Some(true),
            "false" | "f" | "no" | "n" | "0" | "0.0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn as_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn parse_series(value: &Value, tokenizer: Tokenizer) -> Option<Vec<f64>> {
    match value {
        Value::Array(items) => items.iter().map(parse_number).collect(),
        Value::String(s) => {
            let tokens: Vec<&str> = match tokenizer {
                Tokenizer::Space => s.split_whitespace().collect(),
                Tokenizer::Comma => s.split(',').map(str::trim).filter(|t| !t.is_empty()).collect(),
            };
            tokens.iter().map(|t| t.parse().ok()).collect()
        }
        Value::Number(n) => n.as_f64().map(|f| vec![f]),
        _ => None,
    }
}

fn unparsable(feature: &FeatureConfig, value: &Value) -> TrainingError {
    TrainingError::Preprocessing(format!(
        "cannot parse {value} as {} for feature {}",
        feature.feature_type.as_str(),
        feature.name
    ))
}

fn fit_feature(feature: &FeatureConfig, is_output: bool, frame: &RawFrame) -> TrainingResult<FeatureMetadata> {
    let column = feature.column();
    let strategy = feature.missing_value_strategy(is_output);
    let fill = feature.preprocessing.fill_value.as_ref();

    match feature.feature_type {
        FeatureType::Binary => {
            let mut trues = 0usize;
            let mut falses = 0usize;
            for value in present(frame, column) {
                match parse_bool(value) {
                    Some(true) => trues += 1,
                    Some(false) => falses += 1,
                    None => return Err(unparsable(feature, value)),
                }
            }
            let fill_value = match (strategy, fill.and_then(parse_bool)) {
                (MissingValueStrategy::FillWithConst, Some(v)) => v,
                _ => trues > falses,
            };
            Ok(FeatureMetadata::Binary { fill_value })
        }
        FeatureType::Number => {
            let values = present(frame, column)
                .map(|v| parse_number(v).ok_or_else(|| unparsable(feature, v)))
                .collect::<TrainingResult<Vec<f64>>>()?;
            let n = values.len().max(1) as f64;
            let mean = values.iter().sum::<f64>() / n;
            let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let (min, max) = if values.is_empty() { (0.0, 0.0) } else { (min, max) };
            let fill_value = match strategy {
                MissingValueStrategy::FillWithConst => fill.and_then(parse_number).unwrap_or(0.0),
                MissingValueStrategy::FillWithMode => mode(values.iter().map(|v| v.to_string()))
                    .and_then(|m| m.parse().ok())
                    .unwrap_or(mean),
                MissingValueStrategy::FillWithMean | MissingValueStrategy::DropRow => mean,
            };
            Ok(FeatureMetadata::Number {
                mean,
                std: if values.is_empty() { 1.0 } else { std },
                min,
                max,
                fill_value,
                normalization: feature.preprocessing.normalization,
            })
        }
        FeatureType::Category => {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for value in present(frame, column) {
                *counts.entry(as_label(value)).or_default() += 1;
            }
            let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            if let Some(cap) = feature.preprocessing.most_common {
                ranked.truncate(cap);
            }
            let most_frequent = ranked.first().map(|(label, _)| label.clone());
            let mut idx2str = vec![UNKNOWN_SYMBOL.to_string()];
            idx2str.extend(ranked.into_iter().map(|(label, _)| label));

            let fill_value = match (strategy, fill) {
                (MissingValueStrategy::FillWithConst, Some(v)) => as_label(v),
                _ => most_frequent.unwrap_or_else(|| UNKNOWN_SYMBOL.to_string()),
            };
            Ok(FeatureMetadata::Category { idx2str, fill_value })
        }
        FeatureType::Vector => {
            let mut vector_size = feature.preprocessing.vector_size;
            for value in present(frame, column) {
                let parsed = parse_series(value, Tokenizer::Space).ok_or_else(|| unparsable(feature, value))?;
                match vector_size {
                    None => vector_size = Some(parsed.len()),
                    Some(size) if size != parsed.len() => {
                        return Err(TrainingError::Preprocessing(format!(
                            "vector feature {} has rows of size {} and {size}",
                            feature.name,
                            parsed.len()
                        )));
                    }
                    Some(_) => {}
                }
            }
            let vector_size = vector_size.unwrap_or(0);
            let fill_value = fill
                .and_then(|v| parse_series(v, Tokenizer::Space))
                .filter(|v| v.len() == vector_size)
                .unwrap_or_else(|| vec![0.0; vector_size]);
            Ok(FeatureMetadata::Vector { vector_size, fill_value })
        }
        FeatureType::Timeseries => {
            let tokenizer = feature.preprocessing.tokenizer.unwrap_or_default();
            let mut longest = 0usize;
            for value in present(frame, column) {
                let parsed = parse_series(value, tokenizer).ok_or_else(|| unparsable(feature, value))?;
                longest = longest.max(parsed.len());
            }
            let max_length = match feature.preprocessing.timeseries_length_limit {
                Some(limit) => longest.min(limit),
                None => longest,
            };
            Ok(FeatureMetadata::Timeseries {
                max_length,
                tokenizer,
                padding: feature.preprocessing.padding.unwrap_or_default(),
                padding_value: feature.preprocessing.padding_value.unwrap_or(0.0),
            })
        }
    }
}

fn mode(values: impl Iterator<Item = String>) -> Option<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    counts.into_iter().max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0))).map(|(v, _)| v)
}

fn encode_column(feature: &FeatureConfig, metadata: &FeatureMetadata, rows: &[&Record]) -> TrainingResult<EncodedColumn> {
    let cells = rows.iter().map(|row| row.get(feature.column()).filter(|v| !is_missing(Some(*v))));

    let column = match metadata {
        FeatureMetadata::Binary { fill_value } => EncodedColumn::Scalars(
            cells
                .map(|cell| {
                    let b = match cell {
                        Some(v) => parse_bool(v).ok_or_else(|| unparsable(feature, v))?,
                        None => *fill_value,
                    };
                    Ok(if b { 1.0 } else { 0.0 })
                })
                .collect::<TrainingResult<_>>()?,
        ),
        FeatureMetadata::Number { fill_value, .. } => EncodedColumn::Scalars(
            cells
                .map(|cell| {
                    let n = match cell {
                        Some(v) => parse_number(v).ok_or_else(|| unparsable(feature, v))?,
                        None => *fill_value,
                    };
                    Ok(metadata.normalize(n))
                })
                .collect::<TrainingResult<_>>()?,
        ),
        FeatureMetadata::Category { idx2str, fill_value } => {
            let lookup: HashMap<&str, u32> =
                idx2str.iter().enumerate().map(|(i, s)| (s.as_str(), i as u32)).collect();
            EncodedColumn::Indices(
                cells
                    .map(|cell| {
                        let label = cell.map_or_else(|| fill_value.clone(), as_label);
                        lookup.get(label.as_str()).copied().unwrap_or(0)
                    })
                    .collect(),
            )
        }
        FeatureMetadata::Vector { vector_size, fill_value } => EncodedColumn::Vectors(
            cells
                .map(|cell| match cell {
                    Some(v) => {
                        let parsed = parse_series(v, Tokenizer::Space).ok_or_else(|| unparsable(feature, v))?;
                        if parsed.len() != *vector_size {
                            return Err(TrainingError::Preprocessing(format!(
                                "vector feature {} expects size {vector_size}, got {}",
                                feature.name,
                                parsed.len()
                            )));
                        }
                        Ok(parsed)
                    }
                    None => Ok(fill_value.clone()),
                })
                .collect::<TrainingResult<_>>()?,
        ),
        FeatureMetadata::Timeseries { max_length, tokenizer, padding, padding_value } => EncodedColumn::Vectors(
            cells
                .map(|cell| {
                    let series = match cell {
                        Some(v) => parse_series(v, *tokenizer).ok_or_else(|| unparsable(feature, v))?,
                        None => Vec::new(),
                    };
                    Ok(pad_series(series, *max_length, *padding, *padding_value))
                })
                .collect::<TrainingResult<_>>()?,
        ),
    };
    Ok(column)
}

fn pad_series(mut series: Vec<f64>, length: usize, padding: Padding, value: f64) -> Vec<f64> {
    series.truncate(length);
    let pad = vec![value; length - series.len()];
    match padding {
        Padding::Right => {
            series.extend(pad);
            series
        }
        Padding::Left => {
            let mut out = pad;
            out.extend(series);
            out
        }
    }
}
