//! Terminal progress bar for the leader worker.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use tracetune_training::{ProgressEvent, ProgressSink};

pub struct BarProgressSink {
    bar: Mutex<Option<ProgressBar>>,
    last_acc: Mutex<f64>,
}

impl Default for BarProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BarProgressSink {
    pub fn new() -> Self {
        Self { bar: Mutex::new(None), last_acc: Mutex::new(f64::NAN) }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }
}

impl ProgressSink for BarProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { steps_per_epoch, n_epochs, start_epoch, start_step, .. } => {
                let bar = ProgressBar::new((steps_per_epoch * n_epochs) as u64);
                bar.set_style(
                    ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar.set_position((start_epoch * steps_per_epoch + start_step) as u64);
                if let Ok(mut slot) = self.bar.lock() {
                    *slot = Some(bar);
                }
            }
            ProgressEvent::Step { epoch, step, loss, seq_len, lr, .. } => {
                let acc = self.last_acc.lock().map_or(f64::NAN, |a| *a);
                self.with_bar(|bar| {
                    bar.inc(1);
                    bar.set_message(format!(
                        "epoch={epoch} step={step} loss={loss:.3} acc={acc:.3} len={seq_len} lr={lr:.2e}"
                    ));
                });
            }
            ProgressEvent::Metrics { acc, .. } => {
                if let Ok(mut last) = self.last_acc.lock() {
                    *last = acc;
                }
            }
            ProgressEvent::EpochFinished { epoch, global_step } => {
                self.with_bar(|bar| bar.println(format!("epoch {epoch} finished at global step {global_step}")));
            }
            ProgressEvent::CheckpointSaved { path, .. } => {
                self.with_bar(|bar| {
                    bar.println(format!("{} {}", "checkpoint".green(), path.display().to_string().dimmed()));
                });
            }
            ProgressEvent::Finished { .. } => {
                self.with_bar(|bar| bar.finish_with_message("done"));
            }
        }
    }
}
