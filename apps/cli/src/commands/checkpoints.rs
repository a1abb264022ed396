//! Checkpoints command implementation.

use crate::commands::types::CheckpointsCommand;
use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracetune_training::list_checkpoints;

#[derive(Debug, Serialize)]
struct CheckpointRow {
    name: String,
    path: PathBuf,
    epoch: usize,
    global_step: u64,
    step: Option<usize>,
    saved_at: Option<String>,
}

pub async fn execute(command: CheckpointsCommand) -> Result<()> {
    match command {
        CheckpointsCommand::List { output_dir, json } => list(&output_dir, json),
    }
}

fn list(output_dir: &Path, json_output: bool) -> Result<()> {
    let rows: Vec<CheckpointRow> = list_checkpoints(output_dir)
        .with_context(|| format!("Failed to list checkpoints in {}", output_dir.display()))?
        .into_iter()
        .map(|record| {
            let state = record.read_state().ok();
            CheckpointRow {
                name: record.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                epoch: record.epoch,
                global_step: record.global_step,
                step: state.as_ref().map(|s| s.step),
                saved_at: state.map(|s| s.saved_at.to_rfc3339()),
                path: record.path,
            }
        })
        .collect();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Checkpoints ({})", rows.len()).bold().cyan());
    println!();

    if rows.is_empty() {
        println!("  {}", format!("No checkpoints found in {}", output_dir.display()).dimmed());
        println!();
        return Ok(());
    }

    println!("{:<28} {:>6} {:>6} {:>12}  {}", "Name", "Epoch", "Step", "Global step", "Saved at");
    println!("{}", "─".repeat(90));
    for row in rows {
        println!(
            "{:<28} {:>6} {:>6} {:>12}  {}",
            row.name.green(),
            row.epoch,
            row.step.map_or_else(|| "-".to_string(), |s| s.to_string()),
            row.global_step,
            row.saved_at.as_deref().unwrap_or("-").dimmed()
        );
    }
    println!();
    Ok(())
}
