//! Wiring a configured run together on one worker.

use crate::bigram::{AdamWConfig, BigramLm};
use crate::checkpoint::{resolve_checkpoint, CheckpointManager};
use crate::collator::BatchCollator;
use crate::config::TrainConfig;
use crate::dataset::{compute_dataset_id, load_records, DatasetId, RawRecord};
use crate::distributed::DistributedContext;
use crate::error::TrainingResult;
use crate::example::{BuilderOptions, ExampleBuilder};
use crate::layout::RunLayout;
use crate::progress::{ProgressSink, RunId};
use crate::sampler::EpochSampler;
use crate::scheduler::CosineWarmupSchedule;
use crate::tokenizer::load_tokenizer;
use crate::trainer::{LoopComponents, LoopOptions, RunSummary, TrainingLoop};
use crate::tracking::MetricsSink;
use std::sync::Arc;
use tracing::info;

/// Records loaded once and shared by every worker of the run.
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub records: Arc<Vec<RawRecord>>,
    pub id: DatasetId,
}

pub fn load_dataset(config: &TrainConfig) -> TrainingResult<LoadedDataset> {
    let records = load_records(&config.data_path)?;
    let id = compute_dataset_id(&records)?;
    info!(path = %config.data_path.display(), records = records.len(), dataset_id = %id, "dataset loaded");
    Ok(LoadedDataset { records: Arc::new(records), id })
}

/// Sinks for one worker. Non-leaders usually get a null progress sink and no metrics sink.
pub struct WorkerHooks {
    pub run_id: RunId,
    pub progress: Arc<dyn ProgressSink>,
    pub metrics_sink: Option<Arc<dyn MetricsSink>>,
}

/// Build every component for this worker and run the loop to completion.
///
/// Must be called on every worker of `ctx` with the same config and dataset.
/// A worker that fails aborts the group so its peers stop too.
pub fn run_worker(
    config: &TrainConfig,
    dataset: &LoadedDataset,
    ctx: DistributedContext,
    hooks: WorkerHooks,
) -> TrainingResult<RunSummary> {
    let result = build_and_run(config, dataset, ctx.clone(), hooks);
    if result.is_err() {
        ctx.abort();
    }
    result
}

fn build_and_run(
    config: &TrainConfig,
    dataset: &LoadedDataset,
    ctx: DistributedContext,
    hooks: WorkerHooks,
) -> TrainingResult<RunSummary> {
    config.validate()?;
    let layout = RunLayout::for_config(config);
    layout.ensure_dirs()?;

    let tokenizer = load_tokenizer(&config.model_path)?;
    let strategy = config.base_model.strategy(tokenizer.as_ref())?;
    let builder = Arc::new(ExampleBuilder::new(
        tokenizer.clone(),
        BuilderOptions { strategy, thinking: config.thinking_mode(), max_seq_len: config.max_seq_len },
    ));
    let preview = if ctx.is_leader() { config.preview_batches } else { 0 };
    let collator = BatchCollator::new(builder, config.on_invalid_record, preview);

    let sampler = EpochSampler::new(dataset.records.len(), config.train_bsz_per_gpu, &ctx, config.seed)?;
    let total_steps =
        (sampler.steps_per_epoch() * config.n_epochs / config.gradient_accumulation_steps) as u64;
    let scheduler = CosineWarmupSchedule::for_run(config.learning_rate, config.warmup_rates, total_steps);

    let adamw = AdamWConfig { weight_decay: config.weight_decay, ..AdamWConfig::default() };
    let model = BigramLm::from_dir(&config.model_path, tokenizer.vocab_size(), adamw, ctx.clone())?;

    if ctx.is_leader() {
        info!(
            gradient_accumulation_steps = config.gradient_accumulation_steps,
            data_path = %config.data_path.display(),
            lr = config.learning_rate,
            num_training_steps = total_steps,
            warmup_steps = scheduler.warmup_steps(),
            world_size = ctx.world_size(),
            "training configured"
        );
    }

    let parts = LoopComponents {
        records: dataset.records.clone(),
        sampler,
        collator,
        model: Box::new(model),
        tokenizer,
        scheduler: Box::new(scheduler),
        checkpoints: CheckpointManager::new(layout.checkpoints_dir().to_path_buf(), config.max_ckpts, ctx.clone()),
    };
    let options = LoopOptions {
        n_epochs: config.n_epochs,
        gradient_accumulation_steps: config.gradient_accumulation_steps,
        log_every: config.log_every,
        save_every_steps: config.save_every_steps,
    };

    let mut training = TrainingLoop::new(ctx, options, parts)
        .with_run_id(hooks.run_id)
        .with_progress(hooks.progress);
    if let Some(sink) = hooks.metrics_sink {
        training = training.with_metrics_sink(sink);
    }

    if let Some(target) = &config.resume_from {
        let checkpoint = resolve_checkpoint(layout.checkpoints_dir(), target)?;
        training.resume(&checkpoint)?;
    }

    training.run()
}
