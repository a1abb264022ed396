use crate::config::TrainConfig;
use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Filesystem layout for one run.
///
/// Checkpoints go under `<output_dir>/<experiment>/<model>/think_flag<N>` and
/// logs under the same suffix of `<log_dir>`.
#[derive(Debug, Clone)]
pub struct RunLayout {
    checkpoints_dir: PathBuf,
    log_dir: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(checkpoints_dir: PathBuf, log_dir: PathBuf) -> Self {
        Self { checkpoints_dir, log_dir }
    }

    #[must_use]
    pub fn for_config(config: &TrainConfig) -> Self {
        let suffix = Self::run_suffix(config);
        Self::new(config.output_dir.join(&suffix), config.log_dir.join(&suffix))
    }

    fn run_suffix(config: &TrainConfig) -> PathBuf {
        PathBuf::from(&config.experiment_name)
            .join(config.model_name())
            .join(format!("think_flag{}", config.think_flag))
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> &Path {
        &self.checkpoints_dir
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Display name for tracking: `<model>_think_flag<N>_<timestamp>`.
    #[must_use]
    pub fn run_name(config: &TrainConfig) -> String {
        format!(
            "{}_think_flag{}_{}",
            config.model_name(),
            config.think_flag,
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        )
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.checkpoints_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}
