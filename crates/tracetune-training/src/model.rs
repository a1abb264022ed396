//! Model service seam.

use crate::error::TrainingResult;
use ndarray::{Array2, Array3};

/// File name for serialized model state inside a checkpoint's `tfmr/` directory.
pub const MODEL_STATE_FILE: &str = "model_state.bin";

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Mean cross-entropy over unmasked next-token positions.
    pub loss: f64,
    /// `(batch, seq_len, vocab)`.
    pub logits: Array3<f32>,
}

/// A causal language model with its optimizer.
///
/// Gradient synchronization across workers, if any, happens inside the model;
/// the training loop only decides when each call is made.
pub trait CausalLm: Send {
    fn forward(&mut self, input_ids: &Array2<u32>, labels: &Array2<i64>) -> TrainingResult<ForwardOutput>;

    /// Accumulate gradients of the last forward pass, multiplied by `loss_scale`.
    fn backward(&mut self, loss_scale: f64) -> TrainingResult<()>;

    fn optimizer_step(&mut self, learning_rate: f64) -> TrainingResult<()>;

    fn zero_gradients(&mut self);

    /// Whether the last optimizer step was skipped (e.g. on overflow).
    fn optimizer_step_was_skipped(&self) -> bool {
        false
    }

    fn state_dict(&self) -> TrainingResult<Vec<u8>>;

    fn load_state_dict(&mut self, bytes: &[u8]) -> TrainingResult<()>;

    /// When true every worker must call [`CausalLm::state_dict`] to gather the
    /// full state; otherwise only the leader does.
    fn state_is_sharded(&self) -> bool {
        false
    }
}
