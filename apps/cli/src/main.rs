//! Tracetune CLI - supervised fine-tuning with thinking traces
//!
//! This CLI provides a `tracetune` command for training on prompt/response
//! records, previewing how records are rendered and masked, and inspecting
//! saved checkpoints.

mod commands;
mod config;
mod progress;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::types::{CheckpointsCommand, PreviewArgs, TrainArgs};

/// Tracetune CLI - fine-tune causal language models on reasoning traces
#[derive(Parser, Debug)]
#[command(
    name = "tracetune",
    author,
    version,
    about = "Tracetune - supervised fine-tuning with thinking traces",
    long_about = "Tracetune turns (question, response) records into masked training examples,\nruns a data-parallel training loop with gradient accumulation, and rotates checkpoints."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (text, json)
    #[arg(long, default_value = "text", global = true, value_parser = ["text", "json"])]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fine-tune a model on a prompt/response dataset
    ///
    /// Settings come from built-in defaults, then `--config <file.toml>`, then flags.
    Train(Box<TrainArgs>),

    /// Render and tokenize the first records without training
    ///
    /// Shows the assistant text, the prompt/response token boundary and the
    /// number of trainable tokens for each record.
    Preview(PreviewArgs),

    /// Inspect saved checkpoints
    #[command(subcommand)]
    Checkpoints(CheckpointsCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(&args.log_level, &args.log_format)?;

    match args.command {
        Command::Train(train_args) => commands::train::execute(*train_args).await,
        Command::Preview(preview_args) => commands::preview::execute(preview_args).await,
        Command::Checkpoints(command) => commands::checkpoints::execute(command).await,
    }
}

fn init_tracing(log_level: &str, log_format: &str) -> anyhow::Result<()> {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so `--json` output on stdout stays machine readable.
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);
    if log_format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.without_time().finish())?;
    }
    Ok(())
}
