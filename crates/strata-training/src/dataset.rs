use crate::error::{TrainingError, TrainingResult};
use crate::metadata::TrainingSetMetadata;
use crate::readers::DataFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One raw input row, keyed by column name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Row-major raw data as read from a source, before encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub rows: Vec<Record>,
}

impl RawFrame {
    #[must_use]
    pub fn new(rows: Vec<Record>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.rows.iter().any(|r| r.contains_key(column))
    }

    /// Rows at `indices`, in that order.
    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        Self { rows: indices.iter().filter_map(|&i| self.rows.get(i).cloned()).collect() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Training,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Training, Split::Validation, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }

    /// Value of the split indicator column: 0 train, 1 validation, 2 test.
    pub fn from_indicator(value: &serde_json::Value) -> Option<Self> {
        let n = match value {
            serde_json::Value::Number(n) => n.as_f64()?,
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        match n as i64 {
            0 => Some(Self::Training),
            1 => Some(Self::Validation),
            2 => Some(Self::Test),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Training => 0,
            Self::Validation => 1,
            Self::Test => 2,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rows of a pre-split dataset an inference call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitSelection {
    #[default]
    Full,
    Training,
    Validation,
    Test,
}

impl SplitSelection {
    pub fn split(&self) -> Option<Split> {
        match self {
            Self::Full => None,
            Self::Training => Some(Split::Training),
            Self::Validation => Some(Split::Validation),
            Self::Test => Some(Split::Test),
        }
    }
}

impl FromStr for SplitSelection {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "training" => Ok(Self::Training),
            "validation" => Ok(Self::Validation),
            "test" => Ok(Self::Test),
            other => Err(TrainingError::ConfigResolution(format!(
                "unknown split {other:?} (expected full, training, validation or test)"
            ))),
        }
    }
}

/// An encoded feature column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum EncodedColumn {
    /// Binary (0/1) and number features.
    Scalars(Vec<f64>),
    /// Category indices into the fitted vocabulary.
    Indices(Vec<u32>),
    /// Vector and (padded) timeseries features.
    Vectors(Vec<Vec<f64>>),
}

impl EncodedColumn {
    pub fn len(&self) -> usize {
        match self {
            Self::Scalars(v) => v.len(),
            Self::Indices(v) => v.len(),
            Self::Vectors(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        match self {
            Self::Scalars(v) => Self::Scalars(indices.iter().map(|&i| v[i]).collect()),
            Self::Indices(v) => Self::Indices(indices.iter().map(|&i| v[i]).collect()),
            Self::Vectors(v) => Self::Vectors(indices.iter().map(|&i| v[i].clone()).collect()),
        }
    }
}

/// A feature-encoded split, column-major. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessedDataset {
    pub num_rows: usize,
    pub columns: BTreeMap<String, EncodedColumn>,
}

impl ProcessedDataset {
    pub fn new(columns: BTreeMap<String, EncodedColumn>) -> TrainingResult<Self> {
        let mut lengths = columns.values().map(EncodedColumn::len);
        let num_rows = lengths.next().unwrap_or(0);
        if lengths.any(|l| l != num_rows) {
            return Err(TrainingError::Preprocessing("encoded columns have different lengths".to_string()));
        }
        Ok(Self { num_rows, columns })
    }

    pub fn len(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn column(&self, name: &str) -> Option<&EncodedColumn> {
        self.columns.get(name)
    }

    /// Rows at `indices`, in that order. Indices must be in range.
    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            num_rows: indices.len(),
            columns: self.columns.iter().map(|(k, c)| (k.clone(), c.select(indices))).collect(),
        }
    }
}

/// Where a dataset comes from.
#[derive(Debug, Clone)]
pub enum DatasetSource {
    /// A file on disk; format inferred from the extension unless given.
    Path(PathBuf),
    /// Rows already in memory.
    Frame(RawFrame),
    /// Already encoded; preprocessing is skipped when metadata is supplied too.
    Processed(ProcessedDataset),
}

impl DatasetSource {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Stable, human-readable identity used for cache keys and descriptions.
    pub fn identity(&self) -> String {
        match self {
            Self::Path(p) => p.display().to_string(),
            Self::Frame(frame) => format!("<frame:{} rows>", frame.len()),
            Self::Processed(ds) => format!("<processed:{} rows>", ds.len()),
        }
    }
}

impl From<PathBuf> for DatasetSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<RawFrame> for DatasetSource {
    fn from(frame: RawFrame) -> Self {
        Self::Frame(frame)
    }
}

impl From<ProcessedDataset> for DatasetSource {
    fn from(ds: ProcessedDataset) -> Self {
        Self::Processed(ds)
    }
}

/// Inputs of a training run: a combined dataset and/or explicit splits.
/// Explicit splits take precedence over the combined dataset.
#[derive(Debug, Clone, Default)]
pub struct DatasetSources {
    pub dataset: Option<DatasetSource>,
    pub training_set: Option<DatasetSource>,
    pub validation_set: Option<DatasetSource>,
    pub test_set: Option<DatasetSource>,
    pub training_set_metadata: Option<TrainingSetMetadata>,
    pub data_format: DataFormat,
}

impl DatasetSources {
    #[must_use]
    pub fn combined(dataset: impl Into<DatasetSource>) -> Self {
        Self { dataset: Some(dataset.into()), ..Self::default() }
    }

    #[must_use]
    pub fn explicit(
        training_set: impl Into<DatasetSource>,
        validation_set: Option<DatasetSource>,
        test_set: Option<DatasetSource>,
    ) -> Self {
        Self { training_set: Some(training_set.into()), validation_set, test_set, ..Self::default() }
    }

    pub fn has_explicit_splits(&self) -> bool {
        self.training_set.is_some()
    }

    /// Already-encoded splits plus metadata: preprocessing can be skipped.
    pub fn preprocessed(&self) -> Option<(ProcessedDataset, Option<ProcessedDataset>, Option<ProcessedDataset>, TrainingSetMetadata)> {
        let metadata = self.training_set_metadata.clone()?;
        let Some(DatasetSource::Processed(training)) = &self.training_set else {
            return None;
        };
        let processed = |source: &Option<DatasetSource>| match source {
            Some(DatasetSource::Processed(ds)) => Some(ds.clone()),
            _ => None,
        };
        Some((training.clone(), processed(&self.validation_set), processed(&self.test_set), metadata))
    }

    /// Source paths by role, for run descriptions.
    pub fn described_paths(&self) -> BTreeMap<&'static str, String> {
        let mut out = BTreeMap::new();
        for (key, source) in [
            ("dataset", &self.dataset),
            ("training_set", &self.training_set),
            ("validation_set", &self.validation_set),
            ("test_set", &self.test_set),
        ] {
            if let Some(path) = source.as_ref().and_then(DatasetSource::as_path) {
                out.insert(key, path.display().to_string());
            }
        }
        out
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.dataset.is_none() && self.training_set.is_none() {
            return Err(TrainingError::Dataset(
                "either a combined dataset or an explicit training set is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_indicator_accepts_numbers_and_strings() {
        assert_eq!(Split::from_indicator(&json!(0)), Some(Split::Training));
        assert_eq!(Split::from_indicator(&json!("1")), Some(Split::Validation));
        assert_eq!(Split::from_indicator(&json!(2.0)), Some(Split::Test));
        assert_eq!(Split::from_indicator(&json!(7)), None);
    }

    #[test]
    fn test_processed_dataset_rejects_ragged_columns() {
        let mut columns = BTreeMap::new();
        columns.insert("a".to_string(), EncodedColumn::Scalars(vec![1.0, 2.0]));
        columns.insert("b".to_string(), EncodedColumn::Indices(vec![1]));
        assert!(ProcessedDataset::new(columns).is_err());
    }

    #[test]
    fn test_processed_dataset_select() {
        let mut columns = BTreeMap::new();
        columns.insert("a".to_string(), EncodedColumn::Scalars(vec![1.0, 2.0, 3.0]));
        columns.insert("b".to_string(), EncodedColumn::Indices(vec![4, 5, 6]));
        let ds = ProcessedDataset::new(columns).unwrap();

        let picked = ds.select(&[2, 0]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked.column("b"), Some(&EncodedColumn::Indices(vec![6, 4])));
    }

    #[test]
    fn test_sources_require_training_data() {
        assert!(DatasetSources::default().validate().is_err());
        let sources = DatasetSources::combined(PathBuf::from("data.csv"));
        assert!(sources.validate().is_ok());
        assert_eq!(sources.described_paths().get("dataset").map(String::as_str), Some("data.csv"));
    }
}
