//! Experiment tracking sinks.

use crate::error::{TrainingError, TrainingResult};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

pub const METRICS_FILE: &str = "metrics.jsonl";

pub type MetricMap = BTreeMap<String, f64>;

pub trait MetricsSink: Send + Sync {
    fn log(&self, metrics: &MetricMap, step: u64) -> TrainingResult<()>;
}

/// Appends one JSON object per call to `metrics.jsonl`.
pub struct JsonlMetricsSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlMetricsSink {
    pub fn create(log_dir: &Path) -> TrainingResult<Self> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(METRICS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn log(&self, metrics: &MetricMap, step: u64) -> TrainingResult<()> {
        // Non-finite values serialize as null.
        let line = json!({ "step": step, "timestamp": Utc::now(), "metrics": metrics });
        let mut file = self
            .file
            .lock()
            .map_err(|_| TrainingError::Other(anyhow::anyhow!("metrics file lock poisoned")))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn log(&self, metrics: &MetricMap, step: u64) -> TrainingResult<()> {
        info!(step, metrics = ?metrics, "metrics");
        Ok(())
    }
}

/// Keeps every logged entry in memory.
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    entries: Mutex<Vec<(u64, MetricMap)>>,
}

impl MemoryMetricsSink {
    #[must_use]
    pub fn entries(&self) -> Vec<(u64, MetricMap)> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn log(&self, metrics: &MetricMap, step: u64) -> TrainingResult<()> {
        self.entries
            .lock()
            .map_err(|_| TrainingError::Other(anyhow::anyhow!("metrics buffer lock poisoned")))?
            .push((step, metrics.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_sink_appends_lines_and_nulls_nan() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlMetricsSink::create(temp.path()).unwrap();

        let mut metrics = MetricMap::new();
        metrics.insert("loss".to_string(), 1.5);
        metrics.insert("acc".to_string(), f64::NAN);
        sink.log(&metrics, 3).unwrap();
        sink.log(&metrics, 6).unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> =
            contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"], 6);
        assert_eq!(lines[0]["metrics"]["loss"], 1.5);
        assert!(lines[0]["metrics"]["acc"].is_null());
    }

    #[test]
    fn test_memory_sink_records_entries() {
        let sink = MemoryMetricsSink::default();
        sink.log(&MetricMap::new(), 9).unwrap();
        assert_eq!(sink.entries().len(), 1);
        assert_eq!(sink.entries()[0].0, 9);
    }

    #[test]
    fn test_tracing_sink_accepts_non_finite_values() {
        let mut metrics = MetricMap::new();
        metrics.insert("loss".to_string(), f64::NAN);
        assert!(TracingMetricsSink.log(&metrics, 1).is_ok());
    }
}
