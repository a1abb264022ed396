//! Training command implementation.

use crate::commands::types::TrainArgs;
use crate::config::resolve_train_config;
use crate::progress::BarProgressSink;
use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use std::sync::Arc;
use tracetune_training::{
    load_dataset, run_worker, DistributedContext, JsonlMetricsSink, MetricsSink, NullProgressSink,
    ProgressSink, RunId, RunLayout, RunSummary, ThreadCollective, TrainingError, WorkerHooks,
};
use tracing::info;

pub async fn execute(args: TrainArgs) -> Result<()> {
    let config = Arc::new(resolve_train_config(&args)?);
    let layout = RunLayout::for_config(&config);
    layout.ensure_dirs().context("Failed to create run directories")?;

    let dataset = load_dataset(&config)
        .with_context(|| format!("Failed to load dataset {}", config.data_path.display()))?;
    let run_id = RunId::new();
    info!(
        %run_id,
        run_name = %RunLayout::run_name(&config),
        checkpoints = %layout.checkpoints_dir().display(),
        logs = %layout.log_dir().display(),
        "starting run"
    );

    let metrics_sink: Arc<dyn MetricsSink> =
        Arc::new(JsonlMetricsSink::create(layout.log_dir()).context("Failed to open metrics log")?);

    let contexts: Vec<DistributedContext> = if config.workers == 1 {
        vec![DistributedContext::local()]
    } else {
        ThreadCollective::group(config.workers)
            .into_iter()
            .map(|handle| DistributedContext::new(Arc::new(handle)))
            .collect()
    };

    let mut handles = Vec::with_capacity(contexts.len());
    for ctx in contexts {
        let leader = ctx.is_leader();
        let progress: Arc<dyn ProgressSink> =
            if leader { Arc::new(BarProgressSink::new()) } else { Arc::new(NullProgressSink) };
        let hooks = WorkerHooks {
            run_id: run_id.clone(),
            progress,
            metrics_sink: leader.then(|| metrics_sink.clone()),
        };
        let config = config.clone();
        let dataset = dataset.clone();
        handles.push(tokio::task::spawn_blocking(move || run_worker(&config, &dataset, ctx, hooks)));
    }

    let mut leader_summary = None;
    let mut root_cause = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.await.context("Training worker panicked")? {
            Ok(summary) if rank == 0 => leader_summary = Some(summary),
            Ok(_) | Err(TrainingError::PeerAborted) => {}
            Err(e) => {
                root_cause.get_or_insert((rank, e));
            }
        }
    }

    if let Some((rank, e)) = root_cause {
        return Err(anyhow::Error::new(e).context(format!("Training failed on worker {rank}")));
    }
    let summary = leader_summary.context("Leader worker did not report a summary")?;
    print_summary(&summary, &layout, &dataset.id.to_string(), args.json)
}

fn print_summary(summary: &RunSummary, layout: &RunLayout, dataset_id: &str, json_output: bool) -> Result<()> {
    let (loss, acc) = summary.last_metrics.map_or((f64::NAN, f64::NAN), |m| (m.mean_loss, m.accuracy));

    if json_output {
        let out = json!({
            "run_id": summary.run_id.to_string(),
            "dataset_id": dataset_id,
            "global_step": summary.global_step,
            "optimizer_steps": summary.optimizer_steps,
            "loss": loss,
            "acc": acc,
            "skipped_records": summary.skipped_records,
            "last_checkpoint": summary.last_checkpoint,
            "log_dir": layout.log_dir(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Run:        {}", summary.run_id.to_string().cyan());
    println!("  Steps:      {} ({} optimizer steps)", summary.global_step, summary.optimizer_steps);
    println!("  Loss / acc: {loss:.4} / {acc:.4}");
    if summary.skipped_records > 0 {
        println!("  Skipped:    {}", summary.skipped_records.to_string().yellow());
    }
    match &summary.last_checkpoint {
        Some(path) => println!("  Checkpoint: {}", path.display().to_string().dimmed()),
        None => println!("  Checkpoint: {}", "none".dimmed()),
    }
    println!("  Metrics:    {}", layout.log_dir().join("metrics.jsonl").display().to_string().dimmed());
    println!();
    Ok(())
}
