//! Resolving `tracetune train` settings.
//!
//! Precedence: flags > `--config` file > built-in defaults.

use crate::commands::types::TrainArgs;
use anyhow::{Context, Result};
use tracetune_training::{TrainConfig, TrainConfigOverrides};

pub fn resolve_train_config(args: &TrainArgs) -> Result<TrainConfig> {
    let mut config = TrainConfig::default();

    if let Some(path) = &args.config {
        let file_layer = TrainConfigOverrides::load_from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?;
        config.apply(&file_layer);
    }

    config.apply(&flag_layer(args));
    config.validate()?;
    Ok(config)
}

fn flag_layer(args: &TrainArgs) -> TrainConfigOverrides {
    TrainConfigOverrides {
        experiment_name: args.experiment_name.clone(),
        model_path: args.model_path.clone(),
        data_path: args.data_path.clone(),
        base_model: args.base_model,
        think_flag: args.think_flag,
        base_flag: args.base_flag,
        max_seq_len: args.max_seq_len,
        gradient_accumulation_steps: args.gradient_accumulation_steps,
        train_bsz_per_gpu: args.train_bsz_per_gpu,
        weight_decay: args.weight_decay,
        learning_rate: args.learning_rate,
        warmup_rates: args.warmup_rates,
        n_epochs: args.n_epochs,
        max_ckpts: args.max_ckpts,
        seed: args.seed,
        output_dir: args.output_dir.clone(),
        log_dir: args.log_dir.clone(),
        workers: args.workers,
        log_every: args.log_every,
        preview_batches: args.preview_batches,
        save_every_steps: args.save_every_steps,
        resume_from: args.resume.clone(),
        on_invalid_record: args.on_invalid_record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn required() -> TrainArgs {
        TrainArgs {
            experiment_name: Some("exp".to_string()),
            model_path: Some(PathBuf::from("models/tiny")),
            data_path: Some(PathBuf::from("data.jsonl")),
            think_flag: Some(1),
            base_flag: Some(0),
            ..TrainArgs::default()
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.toml");
        std::fs::write(&path, "n_epochs = 2\nworkers = 4\nlearning_rate = 3e-4\n").unwrap();

        let args = TrainArgs { config: Some(path), n_epochs: Some(9), ..required() };
        let config = resolve_train_config(&args).unwrap();
        assert_eq!(config.n_epochs, 9);
        assert_eq!(config.workers, 4);
        assert!((config.learning_rate - 3e-4).abs() < f64::EPSILON);
        assert_eq!(config.gradient_accumulation_steps, 16);
    }

    #[test]
    fn test_missing_required_values_fail_validation() {
        let args = TrainArgs { experiment_name: None, ..required() };
        assert!(resolve_train_config(&args).is_err());
    }
}
