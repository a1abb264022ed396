//! Records -> padded rectangular batch.

use crate::dataset::RawRecord;
use crate::error::{TrainingError, TrainingResult};
use crate::example::{ExampleBuilder, TokenExample, MASK_VALUE};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// What to do with a record that fails to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidRecordPolicy {
    /// Stop the run.
    #[default]
    Abort,
    /// Drop the record from its batch and keep going.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    pub input_ids: Array2<u32>,
    pub labels: Array2<i64>,
}

impl PaddedBatch {
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch_size() == 0
    }

    /// Stack examples, truncating each to the batch length and right-padding.
    pub fn from_examples(examples: &[TokenExample], max_seq_len: usize, pad_id: u32) -> TrainingResult<Self> {
        let len = examples.iter().map(TokenExample::len).max().unwrap_or(0).min(max_seq_len);

        let mut input_ids = Vec::with_capacity(examples.len() * len);
        let mut labels = Vec::with_capacity(examples.len() * len);
        for ex in examples {
            let keep = ex.len().min(len);
            input_ids.extend_from_slice(&ex.input_ids[..keep]);
            input_ids.extend(std::iter::repeat_n(pad_id, len - keep));
            labels.extend_from_slice(&ex.labels[..keep]);
            labels.extend(std::iter::repeat_n(MASK_VALUE, len - keep));
        }

        let shape = (examples.len(), len);
        Ok(Self {
            input_ids: Array2::from_shape_vec(shape, input_ids)
                .map_err(|e| TrainingError::InvariantViolation(format!("input batch shape: {e}")))?,
            labels: Array2::from_shape_vec(shape, labels)
                .map_err(|e| TrainingError::InvariantViolation(format!("label batch shape: {e}")))?,
        })
    }
}

pub struct BatchCollator {
    builder: Arc<ExampleBuilder>,
    policy: InvalidRecordPolicy,
    preview_count: usize,
    skipped: u64,
}

impl BatchCollator {
    /// `preview_count` batches get their last example decoded to the log.
    #[must_use]
    pub fn new(builder: Arc<ExampleBuilder>, policy: InvalidRecordPolicy, preview_count: usize) -> Self {
        Self { builder, policy, preview_count, skipped: 0 }
    }

    /// Records dropped under [`InvalidRecordPolicy::Skip`].
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn collate(&mut self, records: &[&RawRecord]) -> TrainingResult<PaddedBatch> {
        let mut examples = Vec::with_capacity(records.len());
        for record in records {
            match self.builder.build(record) {
                Ok(ex) => examples.push(ex),
                Err(e) if e.is_record_level() && self.policy == InvalidRecordPolicy::Skip => {
                    self.skipped += 1;
                    warn!(error = %e, question = %record.question, "skipping invalid record");
                }
                Err(e) => return Err(e),
            }
        }

        let options = self.builder.options();
        let batch = PaddedBatch::from_examples(&examples, options.max_seq_len, self.builder.tokenizer().eos_id())?;

        if self.preview_count > 0 && !batch.is_empty() {
            self.preview_count -= 1;
            self.preview(&batch)?;
        }

        Ok(batch)
    }

    fn preview(&self, batch: &PaddedBatch) -> TrainingResult<()> {
        let last = batch.batch_size() - 1;
        let tokenizer = self.builder.tokenizer();

        let input: Vec<u32> = batch.input_ids.row(last).to_vec();
        let trained: Vec<u32> = batch
            .labels
            .row(last)
            .iter()
            .filter(|&&l| l != MASK_VALUE)
            .map(|&l| l as u32)
            .collect();

        info!(input = %tokenizer.decode(&input)?, "batch preview: input_ids");
        info!(labels = %tokenizer.decode(&trained)?, "batch preview: unmasked labels");
        Ok(())
    }
}
