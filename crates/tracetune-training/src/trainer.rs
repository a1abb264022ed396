//! Training loop controller.
//!
//! One [`TrainingLoop`] runs per worker. Every collective call (metric
//! reduction, gradient sync inside the model, barriers, checkpoint saves) is
//! made at the same global step on every worker.

use crate::checkpoint::{read_model_state, read_training_state, CheckpointManager, TrainingState};
use crate::collator::BatchCollator;
use crate::dataset::RawRecord;
use crate::distributed::DistributedContext;
use crate::error::TrainingResult;
use crate::metric::{MetricAggregator, ReducedMetrics};
use crate::model::CausalLm;
use crate::progress::{NullProgressSink, ProgressEvent, ProgressSink, RunId};
use crate::sampler::EpochSampler;
use crate::scheduler::LrScheduler;
use crate::tokenizer::Tokenizer;
use crate::tracking::{MetricMap, MetricsSink, TracingMetricsSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerStatus {
    Idle,
    Running { epoch: usize, step: usize },
    Checkpointing { epoch: usize, global_step: u64 },
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    pub n_epochs: usize,
    pub gradient_accumulation_steps: usize,
    pub log_every: u64,
    pub save_every_steps: Option<u64>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self { n_epochs: 5, gradient_accumulation_steps: 16, log_every: 3, save_every_steps: None }
    }
}

/// Everything a loop drives. Built once per worker.
pub struct LoopComponents {
    pub records: Arc<Vec<RawRecord>>,
    pub sampler: EpochSampler,
    pub collator: BatchCollator,
    pub model: Box<dyn CausalLm>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub scheduler: Box<dyn LrScheduler>,
    pub checkpoints: CheckpointManager,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub global_step: u64,
    pub optimizer_steps: u64,
    pub last_checkpoint: Option<PathBuf>,
    pub last_metrics: Option<ReducedMetrics>,
    pub skipped_records: u64,
}

pub struct TrainingLoop {
    ctx: DistributedContext,
    options: LoopOptions,
    parts: LoopComponents,
    metrics: MetricAggregator,
    metrics_sink: Arc<dyn MetricsSink>,
    progress: Arc<dyn ProgressSink>,
    status: TrainerStatus,
    run_id: RunId,
    start_epoch: usize,
    start_step: usize,
    global_step: u64,
    last_checkpoint: Option<PathBuf>,
    last_metrics: Option<ReducedMetrics>,
}

impl TrainingLoop {
    #[must_use]
    pub fn new(ctx: DistributedContext, options: LoopOptions, parts: LoopComponents) -> Self {
        Self {
            metrics: MetricAggregator::new(ctx.clone()),
            ctx,
            options,
            parts,
            metrics_sink: Arc::new(TracingMetricsSink),
            progress: Arc::new(NullProgressSink),
            status: TrainerStatus::Idle,
            run_id: RunId::new(),
            start_epoch: 0,
            start_step: 0,
            global_step: 0,
            last_checkpoint: None,
            last_metrics: None,
        }
    }

    /// Only the leader ever writes to the sink. Defaults to the tracing log.
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    #[must_use]
    pub fn status(&self) -> &TrainerStatus {
        &self.status
    }

    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Restore model weights, scheduler position and loop position from a checkpoint.
    pub fn resume(&mut self, checkpoint_dir: &Path) -> TrainingResult<()> {
        let state = read_training_state(checkpoint_dir)?;
        let weights = read_model_state(checkpoint_dir)?;
        self.parts.model.load_state_dict(&weights)?;
        self.parts.scheduler.set_steps_taken(state.scheduler_step);

        let (epoch, step) = state.resume_position(self.parts.sampler.steps_per_epoch());
        self.start_epoch = epoch;
        self.start_step = step;
        self.global_step = state.global_step;
        info!(
            checkpoint = %checkpoint_dir.display(),
            epoch,
            step,
            global_step = state.global_step,
            "resuming training"
        );
        Ok(())
    }

    pub fn run(&mut self) -> TrainingResult<RunSummary> {
        match self.run_epochs() {
            Ok(summary) => {
                self.status = TrainerStatus::Done;
                Ok(summary)
            }
            Err(e) => {
                warn!(rank = self.ctx.rank(), error = %e, "training failed");
                self.status = TrainerStatus::Failed(e.to_string());
                self.ctx.abort();
                Err(e)
            }
        }
    }

    fn run_epochs(&mut self) -> TrainingResult<RunSummary> {
        let steps_per_epoch = self.parts.sampler.steps_per_epoch();
        self.ctx.verify_equal_steps(steps_per_epoch)?;

        self.progress.on_event(ProgressEvent::Started {
            run_id: self.run_id.clone(),
            steps_per_epoch,
            n_epochs: self.options.n_epochs,
            start_epoch: self.start_epoch,
            start_step: self.start_step,
        });

        let mut optimizer_steps = 0;
        let mut steps_run = 0u64;
        for epoch in self.start_epoch..self.options.n_epochs {
            let batches = self.parts.sampler.epoch_batches(epoch);
            let mut last_step = None;

            for (step, indices) in batches.iter().enumerate() {
                // Linear skip, not a seek: the shuffle is replayed identically.
                if epoch == self.start_epoch && step < self.start_step {
                    continue;
                }
                self.status = TrainerStatus::Running { epoch, step };
                if self.train_step(epoch, step, indices)? {
                    optimizer_steps += 1;
                }
                steps_run += 1;
                last_step = Some(step);

                if self.options.log_every > 0 && self.global_step % self.options.log_every == 0 {
                    self.report()?;
                }
                if let Some(every) = self.options.save_every_steps {
                    if self.global_step % every == 0 && step + 1 < steps_per_epoch {
                        self.checkpoint(epoch, step)?;
                    }
                }
            }

            self.ctx.barrier()?;
            self.progress.on_event(ProgressEvent::EpochFinished { epoch, global_step: self.global_step });
            if let Some(step) = last_step {
                self.checkpoint(epoch, step)?;
            }
        }

        if steps_run > 0 && self.global_step % self.options.log_every.max(1) != 0 {
            self.report()?;
        }

        self.progress.on_event(ProgressEvent::Finished { run_id: self.run_id.clone(), global_step: self.global_step });
        Ok(RunSummary {
            run_id: self.run_id.clone(),
            global_step: self.global_step,
            optimizer_steps,
            last_checkpoint: self.last_checkpoint.clone(),
            last_metrics: self.last_metrics,
            skipped_records: self.parts.collator.skipped(),
        })
    }

    /// One micro-step. Returns whether an optimizer step was taken.
    fn train_step(&mut self, epoch: usize, step: usize, indices: &[usize]) -> TrainingResult<bool> {
        let records: Vec<&RawRecord> = indices.iter().map(|&i| &self.parts.records[i]).collect();
        let batch = self.parts.collator.collate(&records)?;
        let accumulation = self.options.gradient_accumulation_steps.max(1);

        let mut loss = f64::NAN;
        if batch.is_empty() {
            warn!(epoch, step, "every record in the batch was skipped");
        } else {
            let output = self.parts.model.forward(&batch.input_ids, &batch.labels)?;
            self.parts.model.backward(1.0 / accumulation as f64)?;
            self.metrics.update(&output.logits, &batch.labels, output.loss)?;
            loss = output.loss;
        }

        let window_closed = (self.global_step + 1) % accumulation as u64 == 0;
        if window_closed {
            let lr = self.parts.scheduler.current_lr();
            self.parts.model.optimizer_step(lr)?;
            self.parts.scheduler.step();
            self.parts.model.zero_gradients();
        }
        self.global_step += 1;

        self.progress.on_event(ProgressEvent::Step {
            epoch,
            step,
            global_step: self.global_step,
            loss,
            seq_len: batch.seq_len(),
            lr: self.parts.scheduler.current_lr(),
        });
        Ok(window_closed)
    }

    /// Collective metric reduction; the leader forwards the result to the sink.
    fn report(&mut self) -> TrainingResult<()> {
        let reduced = self.metrics.reduce()?;
        self.last_metrics = Some(reduced);
        if !self.ctx.is_leader() {
            return Ok(());
        }

        let lr = self.parts.scheduler.current_lr();
        let skip = if self.parts.model.optimizer_step_was_skipped() { 1.0 } else { 0.0 };
        let mut map = MetricMap::new();
        map.insert("loss".to_string(), reduced.mean_loss);
        map.insert("acc".to_string(), reduced.accuracy);
        map.insert("lr".to_string(), lr);
        map.insert("skip".to_string(), skip);
        self.metrics_sink.log(&map, self.global_step)?;
        self.progress.on_event(ProgressEvent::Metrics {
            global_step: self.global_step,
            loss: reduced.mean_loss,
            acc: reduced.accuracy,
            lr,
        });
        Ok(())
    }

    fn checkpoint(&mut self, epoch: usize, step: usize) -> TrainingResult<()> {
        self.status = TrainerStatus::Checkpointing { epoch, global_step: self.global_step };
        let state = TrainingState::new(epoch, step, self.global_step, self.parts.scheduler.steps_taken());
        let path = self.parts.checkpoints.save(self.parts.model.as_ref(), self.parts.tokenizer.as_ref(), &state)?;
        self.progress.on_event(ProgressEvent::CheckpointSaved { path: path.clone(), global_step: self.global_step });
        self.last_checkpoint = Some(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bigram::{AdamWConfig, BigramLm};
    use crate::checkpoint::list_checkpoints;
    use crate::collator::InvalidRecordPolicy;
    use crate::example::{BuilderOptions, ExampleBuilder};
    use crate::model::ForwardOutput;
    use crate::scheduler::CosineWarmupSchedule;
    use crate::template::RenderStrategy;
    use crate::thinking::ThinkingMode;
    use crate::tokenizer::ByteTokenizer;
    use crate::tracking::MemoryMetricsSink;
    use ndarray::{Array2, Array3};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Calls {
        forwards: usize,
        backward_scales: Vec<f64>,
        optimizer_lrs: Vec<f64>,
        zeroed: usize,
    }

    /// Records every call and reports a constant loss.
    struct RecordingLm {
        calls: Arc<Mutex<Calls>>,
        vocab: usize,
    }

    impl CausalLm for RecordingLm {
        fn forward(&mut self, input_ids: &Array2<u32>, _labels: &Array2<i64>) -> TrainingResult<ForwardOutput> {
            self.calls.lock().unwrap().forwards += 1;
            let (b, t) = input_ids.dim();
            Ok(ForwardOutput { loss: 2.0, logits: Array3::zeros((b, t, self.vocab)) })
        }

        fn backward(&mut self, loss_scale: f64) -> TrainingResult<()> {
            self.calls.lock().unwrap().backward_scales.push(loss_scale);
            Ok(())
        }

        fn optimizer_step(&mut self, learning_rate: f64) -> TrainingResult<()> {
            self.calls.lock().unwrap().optimizer_lrs.push(learning_rate);
            Ok(())
        }

        fn zero_gradients(&mut self) {
            self.calls.lock().unwrap().zeroed += 1;
        }

        fn state_dict(&self) -> TrainingResult<Vec<u8>> {
            Ok(b"weights".to_vec())
        }

        fn load_state_dict(&mut self, _bytes: &[u8]) -> TrainingResult<()> {
            Ok(())
        }
    }

    fn records(n: usize) -> Arc<Vec<RawRecord>> {
        Arc::new(
            (0..n)
                .map(|i| RawRecord::new(format!("{i}+{i}?"), format!("<think>add</think>{}", i * 2)))
                .collect(),
        )
    }

    fn components(
        dir: &Path,
        n_records: usize,
        batch: usize,
        model: Box<dyn CausalLm>,
        scheduler: CosineWarmupSchedule,
        max_ckpts: usize,
    ) -> LoopComponents {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(ByteTokenizer::default());
        let builder = Arc::new(ExampleBuilder::new(
            tokenizer.clone(),
            BuilderOptions { strategy: RenderStrategy::ChatMl, thinking: ThinkingMode::IncludeTrace, max_seq_len: 64 },
        ));
        let ctx = DistributedContext::local();
        LoopComponents {
            records: records(n_records),
            sampler: EpochSampler::new(n_records, batch, &ctx, 2002).unwrap(),
            collator: BatchCollator::new(builder, InvalidRecordPolicy::Abort, 0),
            model,
            tokenizer,
            scheduler: Box::new(scheduler),
            checkpoints: CheckpointManager::new(dir.to_path_buf(), max_ckpts, ctx),
        }
    }

    #[test]
    fn test_accumulation_window_and_metric_cadence() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Calls::default()));
        let model = Box::new(RecordingLm { calls: calls.clone(), vocab: ByteTokenizer::default().vocab_size() });
        let parts = components(temp.path(), 6, 1, model, CosineWarmupSchedule::new(1e-3, 0, 3), 0);
        let sink = Arc::new(MemoryMetricsSink::default());

        let options = LoopOptions { n_epochs: 1, gradient_accumulation_steps: 2, log_every: 3, save_every_steps: None };
        let mut training = TrainingLoop::new(DistributedContext::local(), options, parts).with_metrics_sink(sink.clone());
        let summary = training.run().unwrap();

        assert_eq!(summary.global_step, 6);
        assert_eq!(summary.optimizer_steps, 3);
        assert_eq!(training.status(), &TrainerStatus::Done);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.forwards, 6);
        assert!(calls.backward_scales.iter().all(|&s| (s - 0.5).abs() < f64::EPSILON));
        assert_eq!(calls.optimizer_lrs.len(), 3);
        assert_eq!(calls.zeroed, 3);
        // Cosine decay from the base rate with no warmup.
        assert!((calls.optimizer_lrs[0] - 1e-3).abs() < 1e-12);
        assert!(calls.optimizer_lrs[1] < calls.optimizer_lrs[0]);

        let logged: Vec<u64> = sink.entries().iter().map(|(step, _)| *step).collect();
        assert_eq!(logged, vec![3, 6]);
        let (_, first) = &sink.entries()[0];
        assert!((first["loss"] - 2.0).abs() < 1e-12);
        assert_eq!(first["skip"], 0.0);
        assert!(first.contains_key("acc") && first.contains_key("lr"));

        let saved = list_checkpoints(temp.path()).unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].path.ends_with("checkpoint-0-6"));
    }

    #[test]
    fn test_epoch_checkpoints_follow_retention() {
        let temp = TempDir::new().unwrap();
        let tok = ByteTokenizer::default();
        let model = Box::new(BigramLm::new(tok.vocab_size(), AdamWConfig::default(), DistributedContext::local()).unwrap());
        let parts = components(temp.path(), 4, 2, model, CosineWarmupSchedule::new(1e-2, 0, 6), 2);

        let options = LoopOptions { n_epochs: 3, gradient_accumulation_steps: 1, log_every: 3, save_every_steps: None };
        let summary = TrainingLoop::new(DistributedContext::local(), options, parts).run().unwrap();

        assert_eq!(summary.global_step, 6);
        let names: Vec<String> = list_checkpoints(temp.path())
            .unwrap()
            .iter()
            .map(|c| c.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["checkpoint-1-4".to_string(), "checkpoint-2-6".to_string()]);
        let state = read_training_state(&temp.path().join("checkpoint-2-6")).unwrap();
        assert_eq!((state.epoch, state.step, state.global_step, state.scheduler_step), (2, 1, 6, 6));
    }

    #[test]
    fn test_resume_skips_completed_steps() {
        let temp = TempDir::new().unwrap();
        let tok = ByteTokenizer::default();
        let ctx = DistributedContext::local();

        let first_model = Box::new(BigramLm::new(tok.vocab_size(), AdamWConfig::default(), ctx.clone()).unwrap());
        let parts = components(temp.path(), 4, 1, first_model, CosineWarmupSchedule::new(1e-2, 0, 8), 0);
        let options = LoopOptions { n_epochs: 1, gradient_accumulation_steps: 1, log_every: 3, save_every_steps: Some(2) };
        TrainingLoop::new(ctx.clone(), options, parts).run().unwrap();
        let mid = temp.path().join("checkpoint-0-2");
        assert!(mid.exists());
        assert!(temp.path().join("checkpoint-0-4").exists());

        let calls = Arc::new(Mutex::new(Calls::default()));
        let model = Box::new(RecordingLm { calls: calls.clone(), vocab: tok.vocab_size() });
        let parts = components(temp.path(), 4, 1, model, CosineWarmupSchedule::new(1e-2, 0, 8), 0);
        let options = LoopOptions { n_epochs: 2, gradient_accumulation_steps: 1, log_every: 3, save_every_steps: None };
        let mut resumed = TrainingLoop::new(ctx, options, parts);
        resumed.resume(&mid).unwrap();
        let summary = resumed.run().unwrap();

        // Steps 2 and 3 of epoch 0, then all of epoch 1.
        assert_eq!(calls.lock().unwrap().forwards, 6);
        assert_eq!(summary.global_step, 8);
    }

    #[test]
    fn test_failure_moves_to_failed_state() {
        struct FailingLm;
        impl CausalLm for FailingLm {
            fn forward(&mut self, _: &Array2<u32>, _: &Array2<i64>) -> TrainingResult<ForwardOutput> {
                Err(crate::error::TrainingError::Model("device lost".to_string()))
            }
            fn backward(&mut self, _: f64) -> TrainingResult<()> {
                Ok(())
            }
            fn optimizer_step(&mut self, _: f64) -> TrainingResult<()> {
                Ok(())
            }
            fn zero_gradients(&mut self) {}
            fn state_dict(&self) -> TrainingResult<Vec<u8>> {
                Ok(Vec::new())
            }
            fn load_state_dict(&mut self, _: &[u8]) -> TrainingResult<()> {
                Ok(())
            }
        }

        let temp = TempDir::new().unwrap();
        let parts = components(temp.path(), 2, 1, Box::new(FailingLm), CosineWarmupSchedule::new(1e-3, 0, 2), 0);
        let mut training = TrainingLoop::new(DistributedContext::local(), LoopOptions::default(), parts);
        assert!(training.run().is_err());
        assert!(matches!(training.status(), TrainerStatus::Failed(reason) if reason.contains("device lost")));
    }
}
