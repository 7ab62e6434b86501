//! Configuration management for Radiant.
//!
//! Configuration is loaded from the platform config directory (falling back to
//! `~/.radiant/config.toml`) with defaults that reproduce the reference
//! zero-shot setup: ViT-L-14-336 at 240px, taps at depths 6/12/18/24.

mod types;
mod validate;

pub use types::*;

use crate::class_group::ClassGroup;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure for Radiant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory settings
    pub general: GeneralConfig,

    /// Frozen backbone settings
    pub backbone: BackboneConfig,

    /// Adapter and decoder settings
    pub model: ModelConfig,

    /// Training loop settings
    pub training: TrainingConfig,

    /// Device and seed
    pub runtime: RuntimeConfig,

    /// Prompt-ensemble vocabulary
    pub prompts: PromptConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// - macOS: ~/Library/Application Support/com.radiant.radiant/config.toml
    /// - Linux: ~/.config/radiant/config.toml
    /// - Windows: C:\Users\<User>\AppData\Roaming\radiant\config\config.toml
    ///
    /// Falls back to ~/.radiant/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "radiant", "radiant")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".radiant").join("config.toml")
            })
    }

    /// Resolved model directory for the configured backbone variant.
    pub fn backbone_dir(&self) -> PathBuf {
        expand(&self.general.model_dir).join(&self.backbone.name)
    }

    /// Resolved dataset root.
    pub fn data_dir(&self) -> PathBuf {
        expand(&self.general.data_dir)
    }

    /// Resolved checkpoint root.
    pub fn checkpoint_dir(&self) -> PathBuf {
        expand(&self.general.checkpoint_dir)
    }

    /// Resolved text-table cache directory.
    pub fn text_cache_dir(&self) -> PathBuf {
        expand(&self.general.cache_dir).join("text")
    }

    /// Checkpoint file for a held-out class group.
    pub fn checkpoint_path(&self, group: ClassGroup) -> PathBuf {
        self.checkpoint_dir()
            .join("zero-shot")
            .join(format!("{}.safetensors", group.name()))
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

fn expand(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&path_str).into_owned())
}
