//! Argument types shared by the command implementations.

use clap::{Args, Subcommand};
use std::path::PathBuf;
use tracetune_training::{ChatFamily, InvalidRecordPolicy};

/// Flags for `tracetune train`. Every flag is optional here so a config file
/// can supply it; the merged configuration is validated before training.
///
/// Underscore spellings (`--model_path`) are accepted as aliases.
#[derive(Args, Debug, Clone, Default)]
pub struct TrainArgs {
    /// TOML file with training settings (flags override it)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Experiment name, used in the run directory layout
    #[arg(long, alias = "experiment_name")]
    pub experiment_name: Option<String>,

    /// Model directory (tokenizer and weights)
    #[arg(long, alias = "model_path")]
    pub model_path: Option<PathBuf>,

    /// Dataset file (.json array or .jsonl)
    #[arg(long, alias = "data_path")]
    pub data_path: Option<PathBuf>,

    /// Chat template family (Qwen, Llama)
    #[arg(long, alias = "base_model")]
    pub base_model: Option<ChatFamily>,

    /// 1 trains on the thinking trace, 0 does not
    #[arg(long, alias = "think_flag", value_parser = clap::value_parser!(u8).range(0..=1))]
    pub think_flag: Option<u8>,

    /// With think_flag 0: 1 drops the thinking block entirely, 0 keeps an empty one
    #[arg(long, alias = "base_flag", value_parser = clap::value_parser!(u8).range(0..=1))]
    pub base_flag: Option<u8>,

    /// Maximum tokens per example [default: 8192]
    #[arg(long, alias = "max_seq_len")]
    pub max_seq_len: Option<usize>,

    /// Micro-steps per optimizer step [default: 16]
    #[arg(long, alias = "gradient_accumulation_steps")]
    pub gradient_accumulation_steps: Option<usize>,

    /// Records per worker per step [default: 1]
    #[arg(long, alias = "train_bsz_per_gpu")]
    pub train_bsz_per_gpu: Option<usize>,

    /// [default: 1e-4]
    #[arg(long, alias = "weight_decay")]
    pub weight_decay: Option<f64>,

    /// Peak learning rate [default: 1e-5]
    #[arg(long, alias = "learning_rate")]
    pub learning_rate: Option<f64>,

    /// Fraction of optimizer steps spent warming up [default: 0.05]
    #[arg(long, alias = "warmup_rates")]
    pub warmup_rates: Option<f64>,

    /// [default: 5]
    #[arg(long, alias = "n_epochs")]
    pub n_epochs: Option<usize>,

    /// Checkpoints to keep, 0 keeps all [default: 1]
    #[arg(long, alias = "max_ckpts")]
    pub max_ckpts: Option<usize>,

    /// Shuffle seed [default: 2002]
    #[arg(long)]
    pub seed: Option<u64>,

    /// Checkpoint root [default: ./ckpts]
    #[arg(long, alias = "output_dir")]
    pub output_dir: Option<PathBuf>,

    /// Metrics log root [default: ./train_logs]
    #[arg(long, alias = "log_dir")]
    pub log_dir: Option<PathBuf>,

    /// In-process data-parallel workers [default: 1]
    #[arg(long)]
    pub workers: Option<usize>,

    /// Report metrics every N global steps [default: 3]
    #[arg(long, alias = "log_every")]
    pub log_every: Option<u64>,

    /// Batches whose last example is decoded to the log [default: 2]
    #[arg(long, alias = "preview_batches")]
    pub preview_batches: Option<usize>,

    /// Also checkpoint every N global steps inside an epoch
    #[arg(long, alias = "save_every_steps")]
    pub save_every_steps: Option<u64>,

    /// Resume from a checkpoint directory, or `latest`
    #[arg(long)]
    pub resume: Option<String>,

    /// What to do with a record that cannot be built (abort, skip) [default: abort]
    #[arg(long, alias = "on_invalid_record", value_parser = parse_policy)]
    pub on_invalid_record: Option<InvalidRecordPolicy>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_policy(value: &str) -> Result<InvalidRecordPolicy, String> {
    match value {
        "abort" => Ok(InvalidRecordPolicy::Abort),
        "skip" => Ok(InvalidRecordPolicy::Skip),
        other => Err(format!("unknown policy '{other}' (expected abort or skip)")),
    }
}

#[derive(Args, Debug, Clone)]
pub struct PreviewArgs {
    /// Model directory (tokenizer)
    #[arg(long, alias = "model_path")]
    pub model_path: PathBuf,

    /// Dataset file (.json array or .jsonl)
    #[arg(long, alias = "data_path")]
    pub data_path: PathBuf,

    /// Chat template family (Qwen, Llama)
    #[arg(long, alias = "base_model", default_value = "Qwen")]
    pub base_model: ChatFamily,

    #[arg(long, alias = "think_flag", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub think_flag: u8,

    #[arg(long, alias = "base_flag", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub base_flag: u8,

    #[arg(long, alias = "max_seq_len", default_value_t = 8192)]
    pub max_seq_len: usize,

    /// Number of records to show
    #[arg(short = 'n', long, default_value_t = 3)]
    pub count: usize,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CheckpointsCommand {
    /// List checkpoints in a run directory, oldest first
    List {
        /// Directory holding `checkpoint-*` directories
        #[arg(long, alias = "output_dir")]
        output_dir: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
