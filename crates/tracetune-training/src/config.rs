//! Training run configuration.
//!
//! Values are resolved in layers: built-in defaults, then a TOML file, then
//! command-line flags. Each layer is a [`TrainConfigOverrides`] merged onto a
//! [`TrainConfig`].

use crate::collator::InvalidRecordPolicy;
use crate::error::{TrainingError, TrainingResult};
use crate::template::ChatFamily;
use crate::thinking::ThinkingMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub experiment_name: String,
    pub model_path: PathBuf,
    pub data_path: PathBuf,
    pub base_model: ChatFamily,
    pub think_flag: u8,
    pub base_flag: u8,
    pub max_seq_len: usize,
    pub gradient_accumulation_steps: usize,
    pub train_bsz_per_gpu: usize,
    pub weight_decay: f64,
    pub learning_rate: f64,
    pub warmup_rates: f64,
    pub n_epochs: usize,
    /// 0 keeps every checkpoint.
    pub max_ckpts: usize,
    pub seed: u64,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Number of in-process workers.
    pub workers: usize,
    /// Report metrics every this many global steps.
    pub log_every: u64,
    pub preview_batches: usize,
    pub save_every_steps: Option<u64>,
    /// Checkpoint directory or `latest`.
    pub resume_from: Option<String>,
    pub on_invalid_record: InvalidRecordPolicy,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            experiment_name: String::new(),
            model_path: PathBuf::new(),
            data_path: PathBuf::new(),
            base_model: ChatFamily::Qwen,
            think_flag: 0,
            base_flag: 0,
            max_seq_len: 8192,
            gradient_accumulation_steps: 16,
            train_bsz_per_gpu: 1,
            weight_decay: 1e-4,
            learning_rate: 1e-5,
            warmup_rates: 0.05,
            n_epochs: 5,
            max_ckpts: 1,
            seed: 2002,
            output_dir: PathBuf::from("./ckpts"),
            log_dir: PathBuf::from("./train_logs"),
            workers: 1,
            log_every: 3,
            preview_batches: 2,
            save_every_steps: None,
            resume_from: None,
            on_invalid_record: InvalidRecordPolicy::Abort,
        }
    }
}

impl TrainConfig {
    #[must_use]
    pub fn thinking_mode(&self) -> ThinkingMode {
        ThinkingMode::from_flags(self.think_flag == 1, self.base_flag == 1)
    }

    /// Last component of `model_path`, used to name run directories.
    #[must_use]
    pub fn model_name(&self) -> String {
        self.model_path
            .file_name()
            .map_or_else(|| "model".to_string(), |n| n.to_string_lossy().into_owned())
    }

    pub fn apply(&mut self, overrides: &TrainConfigOverrides) {
        set(&mut self.experiment_name, &overrides.experiment_name);
        set(&mut self.model_path, &overrides.model_path);
        set(&mut self.data_path, &overrides.data_path);
        set(&mut self.base_model, &overrides.base_model);
        set(&mut self.think_flag, &overrides.think_flag);
        set(&mut self.base_flag, &overrides.base_flag);
        set(&mut self.max_seq_len, &overrides.max_seq_len);
        set(&mut self.gradient_accumulation_steps, &overrides.gradient_accumulation_steps);
        set(&mut self.train_bsz_per_gpu, &overrides.train_bsz_per_gpu);
        set(&mut self.weight_decay, &overrides.weight_decay);
        set(&mut self.learning_rate, &overrides.learning_rate);
        set(&mut self.warmup_rates, &overrides.warmup_rates);
        set(&mut self.n_epochs, &overrides.n_epochs);
        set(&mut self.max_ckpts, &overrides.max_ckpts);
        set(&mut self.seed, &overrides.seed);
        set(&mut self.output_dir, &overrides.output_dir);
        set(&mut self.log_dir, &overrides.log_dir);
        set(&mut self.workers, &overrides.workers);
        set(&mut self.log_every, &overrides.log_every);
        set(&mut self.preview_batches, &overrides.preview_batches);
        set(&mut self.on_invalid_record, &overrides.on_invalid_record);
        if overrides.save_every_steps.is_some() {
            self.save_every_steps = overrides.save_every_steps;
        }
        if overrides.resume_from.is_some() {
            self.resume_from.clone_from(&overrides.resume_from);
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        let fail = |msg: String| Err(TrainingError::InvalidConfig(msg));

        if self.experiment_name.trim().is_empty() {
            return fail("experiment_name is required".to_string());
        }
        if self.model_path.as_os_str().is_empty() {
            return fail("model_path is required".to_string());
        }
        if self.data_path.as_os_str().is_empty() {
            return fail("data_path is required".to_string());
        }
        if self.think_flag > 1 || self.base_flag > 1 {
            return fail(format!(
                "think_flag and base_flag must be 0 or 1 (got {} and {})",
                self.think_flag, self.base_flag
            ));
        }
        for (name, value) in [
            ("max_seq_len", self.max_seq_len),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("train_bsz_per_gpu", self.train_bsz_per_gpu),
            ("n_epochs", self.n_epochs),
            ("workers", self.workers),
        ] {
            if value == 0 {
                return fail(format!("{name} must be positive"));
            }
        }
        if self.log_every == 0 {
            return fail("log_every must be positive".to_string());
        }
        if self.save_every_steps == Some(0) {
            return fail("save_every_steps must be positive when set".to_string());
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return fail(format!("learning_rate must be a positive number (got {})", self.learning_rate));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return fail(format!("weight_decay must be non-negative (got {})", self.weight_decay));
        }
        if !(0.0..=1.0).contains(&self.warmup_rates) {
            return fail(format!("warmup_rates must be within [0, 1] (got {})", self.warmup_rates));
        }
        Ok(())
    }
}

fn set<T: Clone>(dst: &mut T, src: &Option<T>) {
    if let Some(value) = src {
        dst.clone_from(value);
    }
}

/// One configuration layer. Set fields replace the values below them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfigOverrides {
    pub experiment_name: Option<String>,
    pub model_path: Option<PathBuf>,
    pub data_path: Option<PathBuf>,
    pub base_model: Option<ChatFamily>,
    pub think_flag: Option<u8>,
    pub base_flag: Option<u8>,
    pub max_seq_len: Option<usize>,
    pub gradient_accumulation_steps: Option<usize>,
    pub train_bsz_per_gpu: Option<usize>,
    pub weight_decay: Option<f64>,
    pub learning_rate: Option<f64>,
    pub warmup_rates: Option<f64>,
    pub n_epochs: Option<usize>,
    pub max_ckpts: Option<usize>,
    pub seed: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub log_every: Option<u64>,
    pub preview_batches: Option<usize>,
    pub save_every_steps: Option<u64>,
    pub resume_from: Option<String>,
    pub on_invalid_record: Option<InvalidRecordPolicy>,
}

impl TrainConfigOverrides {
    /// Load a layer from a TOML file.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        if !path.exists() {
            return Err(TrainingError::InvalidConfig(format!("configuration file not found: {}", path.display())));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| TrainingError::InvalidConfig(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn complete() -> TrainConfig {
        TrainConfig {
            experiment_name: "exp".to_string(),
            model_path: PathBuf::from("/models/Qwen2.5-7B"),
            data_path: PathBuf::from("data.jsonl"),
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_defaults_match_launcher() {
        let config = TrainConfig::default();
        assert_eq!(config.max_seq_len, 8192);
        assert_eq!(config.gradient_accumulation_steps, 16);
        assert_eq!(config.seed, 2002);
        assert_eq!(config.max_ckpts, 1);
        assert_eq!(config.log_every, 3);
    }

    #[test]
    fn test_file_then_cli_precedence() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.toml");
        std::fs::write(&path, "learning_rate = 2e-5\nn_epochs = 2\nbase_model = \"Llama\"\non_invalid_record = \"skip\"\n")
            .unwrap();

        let mut config = complete();
        config.apply(&TrainConfigOverrides::load_from_file(&path).unwrap());
        config.apply(&TrainConfigOverrides { n_epochs: Some(7), ..Default::default() });

        assert!((config.learning_rate - 2e-5).abs() < f64::EPSILON);
        assert_eq!(config.n_epochs, 7);
        assert_eq!(config.base_model, ChatFamily::Llama);
        assert_eq!(config.on_invalid_record, InvalidRecordPolicy::Skip);
        assert_eq!(config.max_seq_len, 8192);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.toml");
        std::fs::write(&path, "learnig_rate = 1.0\n").unwrap();
        assert!(TrainConfigOverrides::load_from_file(&path).is_err());
        assert!(TrainConfigOverrides::load_from_file(&temp.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(complete().validate().is_ok());
        assert!(TrainConfig::default().validate().is_err());
        assert!(TrainConfig { think_flag: 2, ..complete() }.validate().is_err());
        assert!(TrainConfig { gradient_accumulation_steps: 0, ..complete() }.validate().is_err());
        assert!(TrainConfig { learning_rate: f64::NAN, ..complete() }.validate().is_err());
        assert!(TrainConfig { warmup_rates: 1.5, ..complete() }.validate().is_err());
        assert!(TrainConfig { save_every_steps: Some(0), ..complete() }.validate().is_err());
    }

    #[test]
    fn test_thinking_mode_and_model_name() {
        let config = TrainConfig { think_flag: 0, base_flag: 1, ..complete() };
        assert_eq!(config.thinking_mode(), ThinkingMode::Strip);
        assert_eq!(config.model_name(), "Qwen2.5-7B");
    }
}
