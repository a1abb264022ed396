//! Tracetune Training
//!
//! Supervised fine-tuning on prompt/response records with thinking traces:
//! - Building masked token examples from raw records (`ExampleBuilder`)
//! - Collating them into padded batches (`BatchCollator`)
//! - Reducing token accuracy and loss across workers (`MetricAggregator`)
//! - Rotating checkpoints with resume support (`CheckpointManager`)
//! - Driving epochs, accumulation and scheduling (`TrainingLoop`)

pub mod bigram;
pub mod checkpoint;
pub mod collator;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod example;
pub mod layout;
pub mod metric;
pub mod model;
pub mod progress;
pub mod run;
pub mod sampler;
pub mod scheduler;
pub mod template;
pub mod thinking;
pub mod tokenizer;
pub mod tracking;
pub mod trainer;

pub use bigram::{AdamWConfig, BigramLm};
pub use checkpoint::{list_checkpoints, resolve_checkpoint, CheckpointManager, CheckpointRecord, TrainingState};
pub use collator::{BatchCollator, InvalidRecordPolicy, PaddedBatch};
pub use config::{TrainConfig, TrainConfigOverrides};
pub use dataset::{compute_dataset_id, load_records, DatasetId, RawRecord};
pub use distributed::{Collective, DistributedContext, LocalCollective, ThreadCollective};
pub use error::{TrainingError, TrainingResult};
pub use example::{BuilderOptions, BuiltExample, ExampleBuilder, TokenExample, MASK_VALUE};
pub use layout::RunLayout;
pub use metric::{MetricAggregator, ReducedMetrics};
pub use model::{CausalLm, ForwardOutput};
pub use progress::{NullProgressSink, ProgressEvent, ProgressSink, RunId, TracingProgressSink};
pub use run::{load_dataset, run_worker, LoadedDataset, WorkerHooks};
pub use sampler::EpochSampler;
pub use scheduler::{CosineWarmupSchedule, LrScheduler};
pub use template::{ChatFamily, ChatTemplate, RenderStrategy, RenderedExchange};
pub use thinking::{ThinkingMode, ThinkingSplit};
pub use tokenizer::{load_tokenizer, ByteTokenizer, HfTokenizer, Tokenizer};
pub use tracking::{JsonlMetricsSink, MemoryMetricsSink, MetricsSink, TracingMetricsSink};
pub use trainer::{LoopComponents, LoopOptions, RunSummary, TrainerStatus, TrainingLoop};
