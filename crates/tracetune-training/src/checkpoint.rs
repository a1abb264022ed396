//! Checkpoint persistence, retention and resume.
//!
//! Layout: `{output_dir}/checkpoint-{epoch}-{global_step}/{tfmr/, training_state.json}`.
//! A checkpoint is written into a hidden staging directory, verified, renamed into
//! place, and only then are old checkpoints evicted.

use crate::distributed::DistributedContext;
use crate::error::{TrainingError, TrainingResult};
use crate::model::{CausalLm, MODEL_STATE_FILE};
use crate::tokenizer::Tokenizer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
pub const MODEL_DIR: &str = "tfmr";
pub const TRAINING_STATE_FILE: &str = "training_state.json";

/// Loop progress persisted with every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    /// Index of the last step processed within `epoch`.
    pub step: usize,
    pub global_step: u64,
    #[serde(default)]
    pub scheduler_step: u64,
    #[serde(default)]
    pub weights_sha256: String,
    pub saved_at: DateTime<Utc>,
}

impl TrainingState {
    #[must_use]
    pub fn new(epoch: usize, step: usize, global_step: u64, scheduler_step: u64) -> Self {
        Self { epoch, step, global_step, scheduler_step, weights_sha256: String::new(), saved_at: Utc::now() }
    }

    /// Where a resumed run starts: the step after the saved one, rolling over to
    /// the next epoch when the saved step closed its epoch.
    #[must_use]
    pub fn resume_position(&self, steps_per_epoch: usize) -> (usize, usize) {
        if self.step + 1 >= steps_per_epoch {
            (self.epoch + 1, 0)
        } else {
            (self.epoch, self.step + 1)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub path: PathBuf,
    pub epoch: usize,
    pub global_step: u64,
    pub created: SystemTime,
}

impl CheckpointRecord {
    pub fn read_state(&self) -> TrainingResult<TrainingState> {
        read_training_state(&self.path)
    }

    #[must_use]
    pub fn model_dir(&self) -> PathBuf {
        self.path.join(MODEL_DIR)
    }
}

#[must_use]
pub fn checkpoint_dir_name(epoch: usize, global_step: u64) -> String {
    format!("{CHECKPOINT_PREFIX}{epoch}-{global_step}")
}

/// Parse `checkpoint-{epoch}-{global_step}`.
#[must_use]
pub fn parse_checkpoint_name(name: &str) -> Option<(usize, u64)> {
    let rest = name.strip_prefix(CHECKPOINT_PREFIX)?;
    let (epoch, step) = rest.split_once('-')?;
    Some((epoch.parse().ok()?, step.parse().ok()?))
}

/// Checkpoint directories under `output_dir`, oldest first.
pub fn list_checkpoints(output_dir: &Path) -> TrainingResult<Vec<CheckpointRecord>> {
    let dir = match std::fs::read_dir(output_dir) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut out = Vec::new();
    for entry in dir {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some((epoch, global_step)) = path.file_name().and_then(|n| n.to_str()).and_then(parse_checkpoint_name)
        else {
            continue;
        };
        let metadata = entry.metadata()?;
        let created = metadata.created().or_else(|_| metadata.modified())?;
        out.push(CheckpointRecord { path, epoch, global_step, created });
    }

    out.sort_by(|a, b| (a.created, a.epoch, a.global_step).cmp(&(b.created, b.epoch, b.global_step)));
    Ok(out)
}

/// Resolve `latest` or an explicit checkpoint path.
pub fn resolve_checkpoint(output_dir: &Path, target: &str) -> TrainingResult<PathBuf> {
    if target == "latest" {
        return list_checkpoints(output_dir)?
            .into_iter()
            .max_by_key(|c| (c.global_step, c.epoch))
            .map(|c| c.path)
            .ok_or_else(|| {
                TrainingError::Checkpoint(format!("no checkpoints found in {}", output_dir.display()))
            });
    }
    let path = PathBuf::from(target);
    if !path.join(TRAINING_STATE_FILE).exists() {
        return Err(TrainingError::Checkpoint(format!(
            "not a checkpoint directory (missing {TRAINING_STATE_FILE}): {}",
            path.display()
        )));
    }
    Ok(path)
}

pub fn read_training_state(checkpoint_dir: &Path) -> TrainingResult<TrainingState> {
    let bytes = std::fs::read(checkpoint_dir.join(TRAINING_STATE_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Model state bytes of a checkpoint, checked against the recorded digest.
pub fn read_model_state(checkpoint_dir: &Path) -> TrainingResult<Vec<u8>> {
    let state = read_training_state(checkpoint_dir)?;
    let bytes = std::fs::read(checkpoint_dir.join(MODEL_DIR).join(MODEL_STATE_FILE))?;
    if !state.weights_sha256.is_empty() && sha256_hex(&bytes) != state.weights_sha256 {
        return Err(TrainingError::Checkpoint(format!(
            "model state digest mismatch in {}",
            checkpoint_dir.display()
        )));
    }
    Ok(bytes)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    Ok(sha256_hex(&std::fs::read(path)?))
}

pub struct CheckpointManager {
    output_dir: PathBuf,
    max_checkpoints: usize,
    ctx: DistributedContext,
}

impl CheckpointManager {
    /// `max_checkpoints == 0` keeps every checkpoint.
    #[must_use]
    pub fn new(output_dir: PathBuf, max_checkpoints: usize, ctx: DistributedContext) -> Self {
        Self { output_dir, max_checkpoints, ctx }
    }

    /// Persist model, tokenizer and `state`. Collective: every worker must call it.
    ///
    /// Returns the checkpoint directory on success. A failure on the leader is
    /// reported to every worker.
    pub fn save(&self, model: &dyn CausalLm, tokenizer: &dyn Tokenizer, state: &TrainingState) -> TrainingResult<PathBuf> {
        let final_dir = self.output_dir.join(checkpoint_dir_name(state.epoch, state.global_step));

        let model_bytes = if model.state_is_sharded() || self.ctx.is_leader() {
            Some(model.state_dict())
        } else {
            None
        };

        let local_result = match model_bytes {
            Some(Ok(bytes)) if self.ctx.is_leader() => self.write_checkpoint(&final_dir, &bytes, tokenizer, state),
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        };

        let mut failures = [if local_result.is_err() { 1.0 } else { 0.0 }];
        self.ctx.all_reduce_sum(&mut failures)?;
        local_result?;
        if failures[0] > 0.0 {
            return Err(TrainingError::Checkpoint(format!(
                "another worker failed while saving {}",
                final_dir.display()
            )));
        }

        info!(checkpoint = %final_dir.display(), "checkpoint saved");
        Ok(final_dir)
    }

    fn write_checkpoint(&self, final_dir: &Path, model_bytes: &[u8], tokenizer: &dyn Tokenizer, state: &TrainingState) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        let name = final_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TrainingError::Checkpoint(format!("invalid checkpoint path {}", final_dir.display())))?;
        let staging = self.output_dir.join(format!(".{name}.partial"));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }

        let model_dir = staging.join(MODEL_DIR);
        std::fs::create_dir_all(&model_dir)?;
        std::fs::write(model_dir.join(MODEL_STATE_FILE), model_bytes)?;
        tokenizer.save(&model_dir)?;

        let mut state = state.clone();
        state.weights_sha256 = sha256_hex(model_bytes);
        std::fs::write(staging.join(TRAINING_STATE_FILE), serde_json::to_vec_pretty(&state)?)?;

        self.verify(&staging, &state)?;

        if final_dir.exists() {
            std::fs::remove_dir_all(final_dir)?;
        }
        std::fs::rename(&staging, final_dir)?;

        self.enforce_retention(final_dir)
    }

    fn verify(&self, staging: &Path, expected: &TrainingState) -> TrainingResult<()> {
        let written = read_training_state(staging)?;
        if &written != expected {
            return Err(TrainingError::Checkpoint("training state read back differs from what was written".to_string()));
        }
        let digest = sha256_file(&staging.join(MODEL_DIR).join(MODEL_STATE_FILE))?;
        if digest != expected.weights_sha256 {
            return Err(TrainingError::Checkpoint("model state read back differs from what was written".to_string()));
        }
        Ok(())
    }

    /// Evict oldest checkpoints until at most `max_checkpoints` remain, never touching `keep`.
    fn enforce_retention(&self, keep: &Path) -> TrainingResult<()> {
        if self.max_checkpoints == 0 {
            return Ok(());
        }
        let existing = list_checkpoints(&self.output_dir)?;
        let excess = existing.len().saturating_sub(self.max_checkpoints);
        for old in existing.iter().filter(|c| c.path != keep).take(excess) {
            info!(checkpoint = %old.path.display(), "evicting old checkpoint");
            if let Err(e) = std::fs::remove_dir_all(&old.path) {
                warn!(checkpoint = %old.path.display(), error = %e, "failed to evict checkpoint");
            }
        }
        Ok(())
    }
}
