use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A single `(question, response)` pair as it appears on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub question: String,
    pub response: String,
}

impl RawRecord {
    #[must_use]
    pub fn new(question: impl Into<String>, response: impl Into<String>) -> Self {
        Self { question: question.into(), response: response.into() }
    }
}

/// On-disk encoding of a dataset, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    /// One JSON array of records.
    Json,
    /// One JSON record per line.
    Jsonl,
}

impl DatasetFormat {
    pub fn from_path(path: &Path) -> TrainingResult<Self> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref() {
            Some("jsonl") => Ok(Self::Jsonl),
            Some("json") => Ok(Self::Json),
            _ => Err(TrainingError::Dataset(format!(
                "unsupported dataset extension (expected .json or .jsonl): {}",
                path.display()
            ))),
        }
    }
}

/// Load every record from `path`.
///
/// A record missing `question` or `response` is an invariant violation, not a
/// recoverable data-quality issue.
pub fn load_records(path: &Path) -> TrainingResult<Vec<RawRecord>> {
    let format = DatasetFormat::from_path(path)?;
    let contents = std::fs::read_to_string(path).map_err(|e| {
        TrainingError::Dataset(format!("failed to read dataset {}: {e}", path.display()))
    })?;

    let records = match format {
        DatasetFormat::Jsonl => parse_jsonl(&contents)?,
        DatasetFormat::Json => parse_json_array(&contents)?,
    };

    validate_records(&records)?;
    Ok(records)
}

fn parse_jsonl(contents: &str) -> TrainingResult<Vec<RawRecord>> {
    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
        })?;
        records.push(record_from_value(value, &format!("line {}", idx + 1))?);
    }
    Ok(records)
}

fn parse_json_array(contents: &str) -> TrainingResult<Vec<RawRecord>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(contents)
        .map_err(|e| TrainingError::Dataset(format!("failed to parse json array: {e}")))?;
    values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| record_from_value(value, &format!("record {idx}")))
        .collect()
}

fn record_from_value(value: serde_json::Value, location: &str) -> TrainingResult<RawRecord> {
    serde_json::from_value(value)
        .map_err(|e| TrainingError::InvariantViolation(format!("{location}: {e}")))
}

pub fn validate_records(records: &[RawRecord]) -> TrainingResult<()> {
    if records.is_empty() {
        return Err(TrainingError::Dataset("dataset must not be empty".to_string()));
    }
    Ok(())
}

pub fn compute_dataset_id(records: &[RawRecord]) -> TrainingResult<DatasetId> {
    let mut hasher = Sha256::new();

    for record in records {
        let bytes = serde_json::to_vec(record)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}
