use crate::dataset::{DatasetSource, RawFrame, Record};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    #[default]
    Auto,
    Jsonl,
    Json,
    Csv,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Jsonl => "jsonl",
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }

    /// Concrete format for `path`: the explicit one, or inferred from the extension.
    pub fn resolve(self, path: &Path) -> TrainingResult<Self> {
        if self != Self::Auto {
            return Ok(self);
        }
        figure_data_format(path)
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataFormat {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(TrainingError::ConfigResolution(format!("unsupported data format: {other}"))),
        }
    }
}

pub fn figure_data_format(path: &Path) -> TrainingResult<DataFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| TrainingError::Dataset(format!("cannot infer data format of {}", path.display())))?;
    ext.parse().map_err(|_| TrainingError::Dataset(format!("unsupported data file extension: {}", path.display())))
}

/// Materialize a raw source. Encoded sources cannot be read back as raw rows.
pub fn read_source(source: &DatasetSource, format: DataFormat) -> TrainingResult<RawFrame> {
    match source {
        DatasetSource::Path(path) => read_frame(path, format),
        DatasetSource::Frame(frame) => Ok(frame.clone()),
        DatasetSource::Processed(_) => Err(TrainingError::Dataset(
            "an already-processed dataset requires its training set metadata".to_string(),
        )),
    }
}

pub fn read_frame(path: &Path, format: DataFormat) -> TrainingResult<RawFrame> {
    if !path.exists() {
        return Err(TrainingError::Dataset(format!("dataset path does not exist: {}", path.display())));
    }
    let rows = match format.resolve(path)? {
        DataFormat::Jsonl => read_jsonl(path)?,
        DataFormat::Json => read_json(path)?,
        DataFormat::Csv => read_csv(path)?,
        DataFormat::Auto => {
            return Err(TrainingError::Dataset(format!("cannot infer data format of {}", path.display())));
        }
    };
    Ok(RawFrame::new(rows))
}

fn read_jsonl(path: &Path) -> TrainingResult<Vec<Record>> {
    let contents = std::fs::read_to_string(path)?;
    let mut rows = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: Record = serde_json::from_str(line)
            .map_err(|e| TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e)))?;
        rows.push(row);
    }

    Ok(rows)
}

fn read_json(path: &Path) -> TrainingResult<Vec<Record>> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TrainingError::Dataset(format!("expected a JSON array of records in {}: {e}", path.display())))
}

/// Cells stay strings; empty cells become null.
fn read_csv(path: &Path) -> TrainingResult<Vec<Record>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();

    for record in reader.records() {
        let record = record?;
        let row: Record = headers
            .iter()
            .zip(record.iter())
            .map(|(h, cell)| {
                let value = if cell.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::String(cell.to_string())
                };
                (h.to_string(), value)
            })
            .collect();
        rows.push(row);
    }

    Ok(rows)
}

pub fn write_jsonl(path: &Path, frame: &RawFrame) -> TrainingResult<()> {
    let mut out = String::new();
    for row in &frame.rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_figure_data_format() {
        assert_eq!(figure_data_format(Path::new("a/b.csv")).unwrap(), DataFormat::Csv);
        assert_eq!(figure_data_format(Path::new("b.JSONL")).unwrap(), DataFormat::Jsonl);
        assert!(figure_data_format(Path::new("b.parquet")).is_err());
        assert!(figure_data_format(Path::new("noext")).is_err());
    }

    #[test]
    fn test_jsonl_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("d.jsonl");
        let mut row = Record::new();
        row.insert("x".to_string(), json!(1.5));
        row.insert("y".to_string(), json!("a"));
        let frame = RawFrame::new(vec![row.clone(), row]);

        write_jsonl(&path, &frame).unwrap();
        let read = read_frame(&path, DataFormat::Auto).unwrap();
        assert_eq!(read, frame);
    }

    #[test]
    fn test_csv_empty_cells_are_null() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("d.csv");
        std::fs::write(&path, "x,y\n1,a\n,b\n").unwrap();

        let frame = read_frame(&path, DataFormat::Auto).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.rows[0]["x"], json!("1"));
        assert_eq!(frame.rows[1]["x"], serde_json::Value::Null);
    }

    #[test]
    fn test_bad_jsonl_line_reports_position() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("d.jsonl");
        std::fs::write(&path, "{\"x\": 1}\nnot json\n").unwrap();
        let err = read_frame(&path, DataFormat::Jsonl).unwrap_err().to_string();
        assert!(err.contains("line 2"), "{err}");
    }
}
