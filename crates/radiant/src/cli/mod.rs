//! Subcommand implementations.

pub mod config;
pub mod evaluate;
mod progress;
pub mod train;

use std::path::{Path, PathBuf};

use clap::{Args, ValueEnum};
use radiant_core::{ClassGroup, Config};

/// Load `path` when given, else the default config location.
pub fn load_config(path: Option<&Path>) -> Result<Config, radiant_core::ConfigError> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Report output formats.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ReportFormat {
    /// Single JSON document
    Json,
    /// One JSON object per line
    Jsonl,
}

impl From<ReportFormat> for radiant_core::OutputFormat {
    fn from(format: ReportFormat) -> Self {
        match format {
            ReportFormat::Json => Self::Json,
            ReportFormat::Jsonl => Self::JsonLines,
        }
    }
}

/// Flags that override the config file for a single run.
#[derive(Args, Debug, Default, Clone)]
pub struct RunOverrides {
    /// Class group held out for zero-shot evaluation
    #[arg(short, long)]
    pub target: Option<ClassGroup>,

    /// Backbone variant (ViT-L-14-336, ViT-B-16)
    #[arg(long)]
    pub backbone: Option<String>,

    /// Input resolution in pixels
    #[arg(long)]
    pub image_size: Option<usize>,

    /// Comma-separated 1-indexed backbone depths to tap
    #[arg(long, value_delimiter = ',')]
    pub taps: Option<Vec<usize>>,

    /// Device: auto, cpu, cuda or metal
    #[arg(long)]
    pub device: Option<String>,

    /// Seed for shuffling and initialization
    #[arg(long)]
    pub seed: Option<u64>,

    /// Dataset root
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl RunOverrides {
    /// Apply the flags and re-validate the result.
    pub fn apply(&self, mut config: Config) -> anyhow::Result<Config> {
        if let Some(target) = self.target {
            config.training.target = target;
        }
        if let Some(backbone) = &self.backbone {
            config.backbone.name = backbone.clone();
        }
        if let Some(image_size) = self.image_size {
            config.backbone.image_size = image_size;
        }
        if let Some(taps) = &self.taps {
            config.model.taps = taps.clone();
        }
        if let Some(device) = &self.device {
            config.runtime.device = device.clone();
        }
        if let Some(seed) = self.seed {
            config.runtime.seed = seed;
        }
        if let Some(data_dir) = &self.data_dir {
            config.general.data_dir = expand_path(data_dir);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Expand `~` in a CLI-supplied path.
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_config_values() {
        let overrides = RunOverrides {
            target: Some(ClassGroup::Brain),
            taps: Some(vec![3, 6, 9, 12]),
            seed: Some(7),
            ..Default::default()
        };
        let config = overrides.apply(Config::default()).unwrap();
        assert_eq!(config.training.target, ClassGroup::Brain);
        assert_eq!(config.model.taps, vec![3, 6, 9, 12]);
        assert_eq!(config.runtime.seed, 7);
        assert_eq!(config.backbone.name, Config::default().backbone.name);
    }

    #[test]
    fn test_overrides_are_validated() {
        let overrides = RunOverrides {
            taps: Some(vec![12, 6]),
            ..Default::default()
        };
        assert!(overrides.apply(Config::default()).is_err());
    }
}
