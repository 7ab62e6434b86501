//! Radiant CLI - zero-shot medical anomaly detection with CLIP adapters.
//!
//! Trains adapters on every class group except a held-out target, evaluating
//! the target between epochs and keeping the best checkpoint.
//!
//! # Usage
//!
//! ```bash
//! # Train with Brain held out
//! radiant train --target Brain
//!
//! # Evaluate a saved checkpoint
//! radiant eval --target Brain --checkpoint ~/.radiant/checkpoints/zero-shot/Brain.safetensors
//!
//! # View configuration
//! radiant config show
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod cli;
mod logging;

/// Radiant - zero-shot medical anomaly detection with multi-depth CLIP adapters.
#[derive(Parser, Debug)]
#[command(name = "radiant")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, env = "RADIANT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Train adapters with one class group held out
    Train(cli::train::TrainArgs),

    /// Evaluate a checkpoint on the held-out class group
    Eval(cli::evaluate::EvalArgs),

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging isn't initialized yet, so config warnings go through eprintln.
    let config = match cli::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Warning: Failed to load config: {e}\n  \
                 Using default configuration. Check your config file with `radiant config path`."
            );
            radiant_core::Config::default()
        }
    };
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("Radiant v{}", radiant_core::VERSION);

    match cli.command {
        Commands::Train(args) => cli::train::execute(config, args),
        Commands::Eval(args) => cli::evaluate::execute(config, args),
        Commands::Config(args) => cli::config::execute(cli.config.as_deref(), args),
    }
}
