//! Learning rate schedule.

use std::f64::consts::PI;

pub trait LrScheduler: Send {
    /// Learning rate for the next optimizer step.
    fn current_lr(&self) -> f64;

    fn step(&mut self);

    /// Number of `step` calls so far.
    fn steps_taken(&self) -> u64;

    /// Jump to a previously reached position (resume).
    fn set_steps_taken(&mut self, steps: u64);
}

/// Linear warmup from 0 to `base_lr`, then cosine decay to 0 at `total_steps`.
#[derive(Debug, Clone)]
pub struct CosineWarmupSchedule {
    base_lr: f64,
    warmup_steps: u64,
    total_steps: u64,
    current_step: u64,
}

impl CosineWarmupSchedule {
    #[must_use]
    pub fn new(base_lr: f64, warmup_steps: u64, total_steps: u64) -> Self {
        Self { base_lr, warmup_steps, total_steps, current_step: 0 }
    }

    /// Build from the run shape: `warmup_rate` is a fraction of all optimizer steps.
    #[must_use]
    pub fn for_run(base_lr: f64, warmup_rate: f64, total_steps: u64) -> Self {
        let warmup = (warmup_rate * total_steps as f64).floor() as u64;
        Self::new(base_lr, warmup, total_steps)
    }

    #[must_use]
    pub fn warmup_steps(&self) -> u64 {
        self.warmup_steps
    }

    #[must_use]
    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    fn factor(&self) -> f64 {
        let step = self.current_step as f64;
        if self.current_step < self.warmup_steps {
            return step / self.warmup_steps.max(1) as f64;
        }
        let decay_span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let progress = (step - self.warmup_steps as f64) / decay_span;
        (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
    }
}

impl LrScheduler for CosineWarmupSchedule {
    fn current_lr(&self) -> f64 {
        self.base_lr * self.factor()
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn steps_taken(&self) -> u64 {
        self.current_step
    }

    fn set_steps_taken(&mut self, steps: u64) {
        self.current_step = steps;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_is_linear() {
        let mut s = CosineWarmupSchedule::new(1.0, 4, 20);
        assert!(s.current_lr().abs() < 1e-12);
        s.step();
        assert!((s.current_lr() - 0.25).abs() < 1e-12);
        s.set_steps_taken(4);
        assert!((s.current_lr() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_reaches_half_then_zero() {
        let mut s = CosineWarmupSchedule::new(2.0, 0, 10);
        s.set_steps_taken(5);
        assert!((s.current_lr() - 1.0).abs() < 1e-12);
        s.set_steps_taken(10);
        assert!(s.current_lr().abs() < 1e-12);
        s.set_steps_taken(15);
        assert!(s.current_lr() >= 0.0);
    }

    #[test]
    fn test_for_run_floors_warmup() {
        let s = CosineWarmupSchedule::for_run(1e-5, 0.05, 50);
        assert_eq!(s.warmup_steps(), 2);
        assert_eq!(s.total_steps(), 50);
    }

    #[test]
    fn test_zero_total_steps_does_not_divide_by_zero() {
        let s = CosineWarmupSchedule::new(1.0, 0, 0);
        assert!(s.current_lr().is_finite());
    }
}
