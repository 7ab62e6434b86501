//! The `radiant train` command.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Args;
use radiant_core::train::EpochReport;
use radiant_core::{Config, OutputWriter, Radiant, TrainHooks};

use super::progress::ProgressHooks;
use super::{expand_path, ReportFormat, RunOverrides};

/// Arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,

    /// Number of epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Images per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Adam learning rate
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Write one report per epoch to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Report format
    #[arg(short, long, value_enum, default_value = "jsonl")]
    pub format: ReportFormat,

    /// Suppress per-epoch console summaries
    #[arg(short, long)]
    pub quiet: bool,
}

impl TrainArgs {
    fn apply(&self, config: Config) -> anyhow::Result<Config> {
        let mut config = config;
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.training.learning_rate = learning_rate;
        }
        self.overrides.apply(config)
    }
}

/// Forwards every epoch report to the output file as it completes.
struct ReportingHooks<H> {
    inner: H,
    writer: Option<OutputWriter<BufWriter<File>>>,
    error: Option<std::io::Error>,
}

impl<H: TrainHooks> TrainHooks for ReportingHooks<H> {
    fn on_epoch_start(&mut self, epoch: usize, batches: usize) {
        self.inner.on_epoch_start(epoch, batches);
    }

    fn on_batch(&mut self, epoch: usize, index: usize, outcome: &radiant_core::train::StepOutcome) {
        self.inner.on_batch(epoch, index, outcome);
    }

    fn on_evaluation(&mut self, epoch: usize, evaluation: &radiant_core::Evaluation, saved: bool) {
        self.inner.on_evaluation(epoch, evaluation, saved);
    }

    fn on_epoch_end(&mut self, report: &EpochReport) {
        self.inner.on_epoch_end(report);
        if let Some(writer) = &mut self.writer {
            if let Err(e) = writer.write(report) {
                tracing::warn!("Failed to write epoch report: {e}");
                self.error.get_or_insert(e);
            }
        }
    }
}

/// Execute the train command.
pub fn execute(config: Config, args: TrainArgs) -> anyhow::Result<()> {
    let config = args.apply(config)?;
    let epochs = config.training.epochs;
    let target = config.training.target;
    let checkpoint_path = config.checkpoint_path(target);

    let writer = match &args.output {
        Some(path) => {
            let file = File::create(expand_path(path))?;
            Some(OutputWriter::new(BufWriter::new(file), args.format.into(), false))
        }
        None => None,
    };

    let radiant = Radiant::new(config)?;
    let mut hooks = ReportingHooks {
        inner: ProgressHooks::new(epochs, args.quiet),
        writer,
        error: None,
    };
    let history = radiant.train(&mut hooks)?;

    if let Some(e) = hooks.error {
        tracing::warn!("Epoch report file is incomplete: {e}");
    }

    match history.best() {
        Some(best) => println!(
            "Best {} score {:.4} at epoch {} -> {}",
            target,
            best.score.unwrap_or_default(),
            best.epoch,
            checkpoint_path.display()
        ),
        None => println!("No evaluation ran; train for at least 2 epochs to save a checkpoint"),
    }
    Ok(())
}
