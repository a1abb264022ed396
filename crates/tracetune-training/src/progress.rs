use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier for one training run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { run_id: RunId, steps_per_epoch: usize, n_epochs: usize, start_epoch: usize, start_step: usize },
    Step { epoch: usize, step: usize, global_step: u64, loss: f64, seq_len: usize, lr: f64 },
    Metrics { global_step: u64, loss: f64, acc: f64, lr: f64 },
    EpochFinished { epoch: usize, global_step: u64 },
    CheckpointSaved { path: PathBuf, global_step: u64 },
    Finished { run_id: RunId, global_step: u64 },
}

/// Receives loop progress. Only the leader's sink is expected to render anything.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { run_id, steps_per_epoch, n_epochs, start_epoch, start_step } => {
                info!(%run_id, steps_per_epoch, n_epochs, start_epoch, start_step, "training started");
            }
            ProgressEvent::Step { epoch, step, global_step, loss, seq_len, lr } => {
                debug!(epoch, step, global_step, loss, seq_len, lr, "step");
            }
            ProgressEvent::Metrics { global_step, loss, acc, lr } => {
                info!(global_step, loss, acc, lr, "metrics");
            }
            ProgressEvent::EpochFinished { epoch, global_step } => info!(epoch, global_step, "epoch finished"),
            ProgressEvent::CheckpointSaved { path, global_step } => {
                info!(checkpoint = %path.display(), global_step, "checkpoint saved");
            }
            ProgressEvent::Finished { run_id, global_step } => info!(%run_id, global_step, "training finished"),
        }
    }
}

/// Discards every event; used on non-leader workers.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}
