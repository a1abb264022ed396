use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracetune_training::{
    list_checkpoints, load_dataset, run_worker, ChatFamily, DistributedContext, JsonlMetricsSink,
    LoadedDataset, MetricsSink, NullProgressSink, ProgressSink, RunId, RunLayout, RunSummary,
    ThreadCollective, TracingProgressSink, TrainConfig, TrainingError, TrainingResult, WorkerHooks,
};

fn write_dataset(dir: &Path, n: usize) -> std::path::PathBuf {
    let path = dir.join("train.jsonl");
    let lines: Vec<String> = (0..n)
        .map(|i| {
            serde_json::json!({
                "question": format!("What is {i}+{i}?"),
                "response": format!("<think>Add {i} to itself.</think>\nThe answer is {}.", i * 2),
            })
            .to_string()
        })
        .collect();
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

fn config(temp: &TempDir, data_path: std::path::PathBuf) -> TrainConfig {
    TrainConfig {
        experiment_name: "arith".to_string(),
        model_path: temp.path().join("byte-bigram"),
        data_path,
        base_model: ChatFamily::Qwen,
        think_flag: 1,
        base_flag: 0,
        max_seq_len: 96,
        gradient_accumulation_steps: 2,
        learning_rate: 1e-2,
        n_epochs: 2,
        max_ckpts: 1,
        output_dir: temp.path().join("ckpts"),
        log_dir: temp.path().join("logs"),
        workers: 2,
        preview_batches: 1,
        ..TrainConfig::default()
    }
}

fn run_group(config: &TrainConfig, dataset: &LoadedDataset) -> Vec<TrainingResult<RunSummary>> {
    let run_id = RunId::new();
    let layout = RunLayout::for_config(config);
    std::thread::scope(|scope| {
        let handles: Vec<_> = ThreadCollective::group(config.workers)
            .into_iter()
            .map(|handle| {
                let ctx = DistributedContext::new(Arc::new(handle));
                let run_id = run_id.clone();
                let log_dir = layout.log_dir().to_path_buf();
                scope.spawn(move || {
                    let progress: Arc<dyn ProgressSink> = if ctx.is_leader() {
                        Arc::new(TracingProgressSink)
                    } else {
                        Arc::new(NullProgressSink)
                    };
                    let metrics_sink: Option<Arc<dyn MetricsSink>> = if ctx.is_leader() {
                        Some(Arc::new(JsonlMetricsSink::create(&log_dir)?))
                    } else {
                        None
                    };
                    run_worker(config, dataset, ctx, WorkerHooks { run_id, progress, metrics_sink })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn two_workers_train_in_lockstep_and_rotate_checkpoints() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp, write_dataset(temp.path(), 8));
    let dataset = load_dataset(&config).unwrap();

    let summaries: Vec<RunSummary> = run_group(&config, &dataset).into_iter().map(Result::unwrap).collect();

    // 8 records / (2 workers * batch 1) = 4 steps per epoch.
    for summary in &summaries {
        assert_eq!(summary.global_step, 8);
        assert_eq!(summary.optimizer_steps, 4);
        let metrics = summary.last_metrics.unwrap();
        assert!(metrics.mean_loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.accuracy));
    }
    assert_eq!(summaries[0].run_id, summaries[1].run_id);

    let layout = RunLayout::for_config(&config);
    assert!(layout.checkpoints_dir().ends_with("arith/byte-bigram/think_flag1"));
    let checkpoints = list_checkpoints(layout.checkpoints_dir()).unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert!(checkpoints[0].path.ends_with("checkpoint-1-8"));
    assert!(checkpoints[0].model_dir().join("model_state.bin").exists());

    let metric_lines = std::fs::read_to_string(layout.log_dir().join("metrics.jsonl")).unwrap();
    let steps: Vec<u64> = metric_lines
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["step"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, vec![3, 6, 8]);
}

#[test]
fn resume_from_latest_continues_after_saved_epoch() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp, write_dataset(temp.path(), 8));
    let dataset = load_dataset(&config).unwrap();
    for result in run_group(&config, &dataset) {
        result.unwrap();
    }

    config.n_epochs = 3;
    config.resume_from = Some("latest".to_string());
    let summaries = run_group(&config, &dataset);
    for summary in summaries {
        assert_eq!(summary.unwrap().global_step, 12);
    }

    let checkpoints = list_checkpoints(RunLayout::for_config(&config).checkpoints_dir()).unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert!(checkpoints[0].path.ends_with("checkpoint-2-12"));
    let state = checkpoints[0].read_state().unwrap();
    assert_eq!((state.epoch, state.step, state.scheduler_step), (2, 3, 6));
}

#[test]
fn too_small_dataset_is_rejected_on_every_worker() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp, write_dataset(temp.path(), 3));
    config.train_bsz_per_gpu = 2;
    let dataset = load_dataset(&config).unwrap();

    for result in run_group(&config, &dataset) {
        assert!(matches!(result, Err(TrainingError::DistributedDesync(_))));
    }
}
