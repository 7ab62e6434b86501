//! Per-epoch progress bars and console summaries.

use indicatif::{ProgressBar, ProgressStyle};
use radiant_core::train::StepOutcome;
use radiant_core::{EpochReport, Evaluation, TrainHooks};

/// Draws one bar per epoch and prints evaluation results to stdout.
pub struct ProgressHooks {
    bar: Option<ProgressBar>,
    epochs: usize,
    quiet: bool,
}

impl ProgressHooks {
    /// With `quiet` nothing is printed to stdout; bars still go to stderr.
    pub fn new(epochs: usize, quiet: bool) -> Self {
        Self {
            bar: None,
            epochs,
            quiet,
        }
    }
}

fn create_progress_bar(total: u64, epoch: usize, epochs: usize) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    pb.set_prefix(format!("epoch {}/{}", epoch + 1, epochs));
    pb
}

impl TrainHooks for ProgressHooks {
    fn on_epoch_start(&mut self, epoch: usize, batches: usize) {
        self.bar = Some(create_progress_bar(batches as u64, epoch, self.epochs));
    }

    fn on_batch(&mut self, _epoch: usize, _index: usize, outcome: &StepOutcome) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("loss {:.4}", outcome.loss));
            bar.inc(1);
        }
    }

    fn on_evaluation(&mut self, epoch: usize, evaluation: &Evaluation, saved: bool) {
        if self.quiet {
            return;
        }
        let line = match evaluation.pixel_auc {
            Some(pixel_auc) => format!(
                "epoch {epoch}: pAUC {pixel_auc:.4}  AUC {:.4}",
                evaluation.image_auc
            ),
            None => format!("epoch {epoch}: AUC {:.4}", evaluation.image_auc),
        };
        let line = if saved {
            format!("{line}  (best, checkpoint saved)")
        } else {
            line
        };
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    fn on_epoch_end(&mut self, report: &EpochReport) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        if !self.quiet {
            println!("epoch {}: mean loss {:.4}", report.epoch, report.mean_loss);
        }
    }
}
