//! Dense bigram language model trained with AdamW.
//!
//! The logits at position `t` are the weight row of token `t`. Small enough to
//! run the full pipeline on a laptop with the byte tokenizer.

use crate::distributed::DistributedContext;
use crate::error::{TrainingError, TrainingResult};
use crate::example::MASK_VALUE;
use crate::model::{CausalLm, ForwardOutput, MODEL_STATE_FILE};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Largest vocabulary the dense table accepts.
pub const MAX_BIGRAM_VOCAB: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self { beta1: 0.9, beta2: 0.95, eps: 1e-8, weight_decay: 1e-4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BigramState {
    vocab_size: usize,
    weights: Vec<f32>,
    adam_m: Vec<f32>,
    adam_v: Vec<f32>,
    adam_step: u64,
}

pub struct BigramLm {
    state: BigramState,
    grads: Vec<f64>,
    adamw: AdamWConfig,
    ctx: DistributedContext,
    /// `(previous token, target token)` pairs of the last forward pass.
    last_pairs: Vec<(usize, usize)>,
}

impl BigramLm {
    pub fn new(vocab_size: usize, adamw: AdamWConfig, ctx: DistributedContext) -> TrainingResult<Self> {
        if vocab_size == 0 || vocab_size > MAX_BIGRAM_VOCAB {
            return Err(TrainingError::Model(format!(
                "bigram model supports vocabularies of 1..={MAX_BIGRAM_VOCAB} tokens, got {vocab_size}"
            )));
        }
        let params = vocab_size * vocab_size;
        Ok(Self {
            state: BigramState {
                vocab_size,
                weights: vec![0.0; params],
                adam_m: vec![0.0; params],
                adam_v: vec![0.0; params],
                adam_step: 0,
            },
            grads: vec![0.0; params],
            adamw,
            ctx,
            last_pairs: Vec::new(),
        })
    }

    /// Load `model_state.bin` from `dir` when present, otherwise start from zeros.
    pub fn from_dir(dir: &Path, vocab_size: usize, adamw: AdamWConfig, ctx: DistributedContext) -> TrainingResult<Self> {
        let mut model = Self::new(vocab_size, adamw, ctx)?;
        let state_path = dir.join(MODEL_STATE_FILE);
        if state_path.exists() {
            info!(path = %state_path.display(), "loading bigram weights");
            model.load_state_dict(&std::fs::read(&state_path)?)?;
        }
        Ok(model)
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.state.vocab_size
    }

    fn row(&self, token: usize) -> &[f32] {
        let v = self.state.vocab_size;
        &self.state.weights[token * v..(token + 1) * v]
    }

    fn check_token(&self, token: i64) -> TrainingResult<usize> {
        usize::try_from(token)
            .ok()
            .filter(|&t| t < self.state.vocab_size)
            .ok_or_else(|| {
                TrainingError::Model(format!(
                    "token id {token} outside bigram vocabulary of {}",
                    self.state.vocab_size
                ))
            })
    }
}

fn log_sum_exp(row: &[f32]) -> f64 {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f64 = row.iter().map(|&x| f64::from(x - max).exp()).sum();
    f64::from(max) + sum.ln()
}

impl CausalLm for BigramLm {
    fn forward(&mut self, input_ids: &Array2<u32>, labels: &Array2<i64>) -> TrainingResult<ForwardOutput> {
        let (batch, seq) = input_ids.dim();
        let vocab = self.state.vocab_size;
        let mut logits = Array3::<f32>::zeros((batch, seq, vocab));
        let mut pairs = Vec::new();
        let mut loss_sum = 0.0;

        for b in 0..batch {
            for t in 0..seq {
                let prev = self.check_token(i64::from(input_ids[[b, t]]))?;
                let row = self.row(prev);
                logits
                    .slice_mut(ndarray::s![b, t, ..])
                    .iter_mut()
                    .zip(row)
                    .for_each(|(dst, &w)| *dst = w);

                if t + 1 < seq && labels[[b, t + 1]] != MASK_VALUE {
                    let target = self.check_token(labels[[b, t + 1]])?;
                    loss_sum += log_sum_exp(row) - f64::from(row[target]);
                    pairs.push((prev, target));
                }
            }
        }

        // Mean over no targets is undefined, as with a mean-reduced cross-entropy.
        let loss = if pairs.is_empty() { f64::NAN } else { loss_sum / pairs.len() as f64 };
        self.last_pairs = pairs;
        Ok(ForwardOutput { loss, logits })
    }

    fn backward(&mut self, loss_scale: f64) -> TrainingResult<()> {
        if self.last_pairs.is_empty() {
            return Ok(());
        }
        let vocab = self.state.vocab_size;
        let scale = loss_scale / self.last_pairs.len() as f64;
        let pairs = std::mem::take(&mut self.last_pairs);

        for &(prev, target) in &pairs {
            let row = self.row(prev);
            let lse = log_sum_exp(row);
            let probs: Vec<f64> = row.iter().map(|&w| (f64::from(w) - lse).exp()).collect();
            let grad_row = &mut self.grads[prev * vocab..(prev + 1) * vocab];
            for (j, p) in probs.into_iter().enumerate() {
                let indicator = if j == target { 1.0 } else { 0.0 };
                grad_row[j] += scale * (p - indicator);
            }
        }
        Ok(())
    }

    fn optimizer_step(&mut self, learning_rate: f64) -> TrainingResult<()> {
        let world = self.ctx.world_size();
        if world > 1 {
            self.ctx.all_reduce_sum(&mut self.grads)?;
            let inv = 1.0 / world as f64;
            self.grads.iter_mut().for_each(|g| *g *= inv);
        }

        let AdamWConfig { beta1, beta2, eps, weight_decay } = self.adamw;
        let state = &mut self.state;
        state.adam_step += 1;
        let t = state.adam_step as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        for i in 0..state.weights.len() {
            let g = self.grads[i];
            let m = beta1 * f64::from(state.adam_m[i]) + (1.0 - beta1) * g;
            let v = beta2 * f64::from(state.adam_v[i]) + (1.0 - beta2) * g * g;
            state.adam_m[i] = m as f32;
            state.adam_v[i] = v as f32;

            let mut w = f64::from(state.weights[i]);
            w *= 1.0 - learning_rate * weight_decay;
            w -= learning_rate * (m / bias1) / ((v / bias2).sqrt() + eps);
            state.weights[i] = w as f32;
        }
        Ok(())
    }

    fn zero_gradients(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = 0.0);
    }

    fn state_dict(&self) -> TrainingResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    fn load_state_dict(&mut self, bytes: &[u8]) -> TrainingResult<()> {
        let state: BigramState = serde_json::from_slice(bytes)?;
        let params = state.vocab_size * state.vocab_size;
        if state.vocab_size != self.state.vocab_size
            || state.weights.len() != params
            || state.adam_m.len() != params
            || state.adam_v.len() != params
        {
            return Err(TrainingError::Model(format!(
                "bigram state for vocabulary {} does not fit model with vocabulary {}",
                state.vocab_size, self.state.vocab_size
            )));
        }
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn model(vocab: usize) -> BigramLm {
        BigramLm::new(vocab, AdamWConfig { weight_decay: 0.0, ..Default::default() }, DistributedContext::local()).unwrap()
    }

    #[test]
    fn test_uniform_model_loss_is_log_vocab() {
        let mut m = model(8);
        let out = m.forward(&array![[1, 2, 3]], &array![[MASK_VALUE, 2, 3]]).unwrap();
        assert!((out.loss - (8f64).ln()).abs() < 1e-6);
        assert_eq!(out.logits.dim(), (1, 3, 8));
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut m = model(6);
        let inputs = array![[1u32, 2, 3, 4]];
        let labels = array![[MASK_VALUE, 2, 3, 4]];

        let first = m.forward(&inputs, &labels).unwrap().loss;
        for _ in 0..20 {
            m.forward(&inputs, &labels).unwrap();
            m.backward(1.0).unwrap();
            m.optimizer_step(0.1).unwrap();
            m.zero_gradients();
        }
        let last = m.forward(&inputs, &labels).unwrap().loss;
        assert!(last < first);
    }

    #[test]
    fn test_rejects_oversized_vocab_and_out_of_range_tokens() {
        assert!(BigramLm::new(MAX_BIGRAM_VOCAB + 1, AdamWConfig::default(), DistributedContext::local()).is_err());
        let mut m = model(4);
        assert!(m.forward(&array![[9]], &array![[MASK_VALUE]]).is_err());
    }

    #[test]
    fn test_state_dict_round_trip_and_vocab_check() {
        let mut m = model(4);
        m.forward(&array![[1, 2]], &array![[MASK_VALUE, 2]]).unwrap();
        m.backward(1.0).unwrap();
        m.optimizer_step(0.5).unwrap();
        let bytes = m.state_dict().unwrap();

        let mut restored = model(4);
        restored.load_state_dict(&bytes).unwrap();
        assert_eq!(restored.state.weights, m.state.weights);
        assert_eq!(restored.state.adam_step, 1);

        assert!(model(5).load_state_dict(&bytes).is_err());
    }

    #[test]
    fn test_fully_masked_batch_has_nan_loss_and_no_gradient() {
        let mut m = model(4);
        let out = m.forward(&array![[1, 2]], &array![[MASK_VALUE, MASK_VALUE]]).unwrap();
        assert!(out.loss.is_nan());
        m.backward(1.0).unwrap();
        assert!(m.grads.iter().all(|&g| g == 0.0));
    }
}
