//! Token accuracy and loss, accumulated locally and reduced across workers.

use crate::distributed::DistributedContext;
use crate::error::{TrainingError, TrainingResult};
use crate::example::MASK_VALUE;
use ndarray::{Array2, Array3, ArrayView1, Axis};

/// Metrics after a cross-worker reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReducedMetrics {
    /// NaN when no unmasked position was seen since the last reduction.
    pub accuracy: f64,
    /// NaN when no step with an unmasked target was recorded since the last reduction.
    pub mean_loss: f64,
}

#[derive(Debug)]
pub struct MetricAggregator {
    ctx: DistributedContext,
    correct: u64,
    total: u64,
    summed_loss: f64,
    loss_steps: u64,
    steps_since_reset: u64,
}

impl MetricAggregator {
    #[must_use]
    pub fn new(ctx: DistributedContext) -> Self {
        Self { ctx, correct: 0, total: 0, summed_loss: 0.0, loss_steps: 0, steps_since_reset: 0 }
    }

    #[must_use]
    pub fn steps_since_reset(&self) -> u64 {
        self.steps_since_reset
    }

    /// Record one micro-step. Position `t` predicts token `t + 1`.
    ///
    /// A step without any unmasked target adds nothing to the loss average.
    pub fn update(&mut self, logits: &Array3<f32>, labels: &Array2<i64>, loss: f64) -> TrainingResult<()> {
        let (batch, seq, _) = logits.dim();
        if labels.dim() != (batch, seq) {
            return Err(TrainingError::InvariantViolation(format!(
                "logits shape {:?} does not match labels shape {:?}",
                logits.dim(),
                labels.dim()
            )));
        }

        self.steps_since_reset += 1;
        let mut targets = 0;
        for (b, rows) in logits.axis_iter(Axis(0)).enumerate() {
            for t in 0..seq.saturating_sub(1) {
                let label = labels[[b, t + 1]];
                if label == MASK_VALUE {
                    continue;
                }
                targets += 1;
                if argmax(rows.row(t)) as i64 == label {
                    self.correct += 1;
                }
            }
        }

        self.total += targets;
        if targets > 0 {
            self.summed_loss += loss;
            self.loss_steps += 1;
        }
        Ok(())
    }

    /// Sum-reduce across workers, reset local counters, and return the group metrics.
    ///
    /// Mean loss divides by the summed count of loss-bearing steps of all workers,
    /// which equals `world_size * steps` whenever every batch has targets.
    pub fn reduce(&mut self) -> TrainingResult<ReducedMetrics> {
        let mut values = [
            self.correct as f64,
            self.total as f64,
            self.summed_loss,
            self.loss_steps as f64,
        ];
        self.ctx.all_reduce_sum(&mut values)?;
        self.reset();

        let [correct, total, loss, steps] = values;
        Ok(ReducedMetrics {
            accuracy: if total > 0.0 { correct / total } else { f64::NAN },
            mean_loss: if steps > 0.0 { loss / steps } else { f64::NAN },
        })
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
        self.summed_loss = 0.0;
        self.loss_steps = 0;
        self.steps_since_reset = 0;
    }
}

pub(crate) fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (idx, &value) in row.iter().enumerate() {
        if value > best_value {
            best = idx;
            best_value = value;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ThreadCollective;
    use ndarray::{array, Array3};
    use std::sync::Arc;

    /// Logits that predict `preds[t]` at position `t`.
    fn one_hot_logits(preds: &[usize], vocab: usize) -> Array3<f32> {
        let mut logits = Array3::<f32>::zeros((1, preds.len(), vocab));
        for (t, &p) in preds.iter().enumerate() {
            logits[[0, t, p]] = 1.0;
        }
        logits
    }

    #[test]
    fn test_shifted_accuracy_excludes_masked_positions() {
        let mut metric = MetricAggregator::new(DistributedContext::local());
        // labels[1..] = [-100, 3, 2]; preds[..3] = [9, 3, 1] -> 1 of 2 correct
        let logits = one_hot_logits(&[9, 3, 1, 0], 10);
        let labels = array![[MASK_VALUE, MASK_VALUE, 3, 2]];

        metric.update(&logits, &labels, 2.0).unwrap();
        let reduced = metric.reduce().unwrap();
        assert!((reduced.accuracy - 0.5).abs() < 1e-12);
        assert!((reduced.mean_loss - 2.0).abs() < 1e-12);
        assert_eq!(metric.steps_since_reset(), 0);
    }

    #[test]
    fn test_all_masked_reports_nan_accuracy_and_loss() {
        let mut metric = MetricAggregator::new(DistributedContext::local());
        let logits = one_hot_logits(&[1, 1], 4);
        metric.update(&logits, &array![[MASK_VALUE, MASK_VALUE]], 0.0).unwrap();
        let reduced = metric.reduce().unwrap();
        assert!(reduced.accuracy.is_nan());
        assert!(reduced.mean_loss.is_nan());
    }

    #[test]
    fn test_targetless_step_does_not_dilute_mean_loss() {
        let mut metric = MetricAggregator::new(DistributedContext::local());
        let logits = one_hot_logits(&[1, 1], 4);
        metric.update(&logits, &array![[MASK_VALUE, 1]], 2.0).unwrap();
        metric.update(&logits, &array![[MASK_VALUE, MASK_VALUE]], 0.0).unwrap();
        assert_eq!(metric.steps_since_reset(), 2);

        let reduced = metric.reduce().unwrap();
        assert!((reduced.mean_loss - 2.0).abs() < 1e-12);
        assert!((reduced.accuracy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let mut metric = MetricAggregator::new(DistributedContext::local());
        let logits = one_hot_logits(&[1, 1], 4);
        assert!(metric.update(&logits, &array![[1, 2, 3]], 1.0).is_err());
    }

    #[test]
    fn test_cross_worker_reduction_formula() {
        // Worker i: steps = 2, per step one correct out of (i + 1) positions, loss i + 1.
        let world = 3;
        let handles: Vec<_> = ThreadCollective::group(world)
            .into_iter()
            .map(|c| {
                std::thread::spawn(move || {
                    let ctx = DistributedContext::new(Arc::new(c));
                    let rank = ctx.rank();
                    let mut metric = MetricAggregator::new(ctx);
                    for _ in 0..2 {
                        let mut preds = vec![0usize; rank + 2];
                        preds[0] = 7;
                        let logits = one_hot_logits(&preds, 8);
                        let mut labels = Array2::<i64>::from_elem((1, rank + 2), 5);
                        labels[[0, 1]] = 7;
                        metric.update(&logits, &labels, (rank + 1) as f64).unwrap();
                    }
                    metric.reduce().unwrap()
                })
            })
            .collect();

        let results: Vec<ReducedMetrics> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // correct = 2 per worker = 6; total = 2 * (1 + 2 + 3) = 12
        // loss = 2 * (1 + 2 + 3) = 12 over world * steps = 6
        for r in &results {
            assert!((r.accuracy - 6.0 / 12.0).abs() < 1e-12);
            assert!((r.mean_loss - 2.0).abs() < 1e-12);
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }
}
