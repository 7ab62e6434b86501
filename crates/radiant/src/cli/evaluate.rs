//! The `radiant eval` command.

use std::path::PathBuf;

use clap::Args;
use radiant_core::{Config, OutputFormat, OutputWriter, Radiant};

use super::{expand_path, ReportFormat, RunOverrides};

/// Arguments for the `eval` command.
#[derive(Args, Debug)]
pub struct EvalArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,

    /// Checkpoint to evaluate (defaults to the target's best checkpoint)
    #[arg(short, long)]
    pub checkpoint: Option<PathBuf>,

    /// Print the result as JSON instead of text
    #[arg(long, value_enum)]
    pub format: Option<ReportFormat>,
}

/// Execute the eval command.
pub fn execute(config: Config, args: EvalArgs) -> anyhow::Result<()> {
    let config = args.overrides.apply(config)?;
    let target = config.training.target;
    let checkpoint = args
        .checkpoint
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(|| config.checkpoint_path(target));
    if !checkpoint.exists() {
        anyhow::bail!(
            "Checkpoint not found: {}\nTrain first with `radiant train --target {}`.",
            checkpoint.display(),
            target
        );
    }

    let radiant = Radiant::new(config)?;
    let evaluation = radiant.evaluate_checkpoint(&checkpoint)?;

    match args.format {
        Some(format) => {
            let format: OutputFormat = format.into();
            let mut writer = OutputWriter::new(std::io::stdout(), format, format == OutputFormat::Json);
            writer.write(&evaluation)?;
        }
        None => {
            if let Some(pixel_auc) = evaluation.pixel_auc {
                println!("{target} pAUC: {pixel_auc:.4}");
            }
            println!("{target} AUC: {:.4}", evaluation.image_auc);
        }
    }
    Ok(())
}
