//! Sub-configuration structs with defaults matching the reference training setup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::class_group::ClassGroup;

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory where backbone weights and the text encoder are stored
    pub model_dir: PathBuf,

    /// Root of the medical anomaly datasets
    pub data_dir: PathBuf,

    /// Root for checkpoints (`{checkpoint_dir}/zero-shot/{class_group}.safetensors`)
    pub checkpoint_dir: PathBuf,

    /// Cache for encoded text tables
    pub cache_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("~/.radiant/models"),
            data_dir: PathBuf::from("./data"),
            checkpoint_dir: PathBuf::from("./ckpt"),
            cache_dir: PathBuf::from("~/.radiant/cache"),
        }
    }
}

/// Frozen backbone settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// Variant name ("ViT-L-14-336" or "ViT-B-16")
    pub name: String,

    /// Square input resolution fed to the backbone
    pub image_size: usize,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            name: "ViT-L-14-336".to_string(),
            image_size: 240,
        }
    }
}

/// Adapter and decoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// 1-indexed backbone depths to tap, strictly ascending
    pub taps: Vec<usize>,

    /// Segmentation adapter bottleneck width (also the decoder width)
    pub seg_bottleneck: usize,

    /// Detection adapter bottleneck width; must equal the text embedding dim
    pub det_bottleneck: usize,

    /// Attention heads in each decoder fusion block
    pub decoder_heads: usize,

    /// Feed-forward width in each decoder fusion block
    pub decoder_ff_dim: usize,

    /// Carry the decoder's contextualized tokens into the next depth's
    /// running average. When false the raw adapter features are averaged.
    pub carry_contextualized: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            taps: vec![6, 12, 18, 24],
            seg_bottleneck: 128,
            det_bottleneck: 768,
            decoder_heads: 4,
            decoder_ff_dim: 2048,
            carry_contextualized: true,
        }
    }
}

/// Training loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Held-out class group; every other group is used for training
    pub target: ClassGroup,

    /// Number of epochs
    pub epochs: usize,

    /// Images per training batch (one class group per batch)
    pub batch_size: usize,

    /// Adam learning rate, shared by all four components
    pub learning_rate: f64,

    /// Adam first-moment decay
    pub beta1: f64,

    /// Adam second-moment decay
    pub beta2: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            target: ClassGroup::RetinaResc,
            epochs: 50,
            batch_size: 2,
            learning_rate: 1e-4,
            beta1: 0.5,
            beta2: 0.999,
        }
    }
}

/// Device and determinism settings, threaded through construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// "auto", "cpu", "cuda" or "metal"
    pub device: String,

    /// Seed for epoch reshuffling and (where supported) device RNG
    pub seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            seed: 111,
        }
    }
}

/// Prompt-ensemble vocabulary.
///
/// Each state is formatted with the class group's prompt name, then wrapped by
/// every template. Both use `{}` as the placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub normal_states: Vec<String>,
    pub abnormal_states: Vec<String>,
    pub templates: Vec<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            normal_states: owned(&[
                "{}",
                "flawless {}",
                "perfect {}",
                "unblemished {}",
                "{} without flaw",
                "{} without defect",
                "{} without damage",
            ]),
            abnormal_states: owned(&[
                "damaged {}",
                "broken {}",
                "{} with flaw",
                "{} with defect",
                "{} with damage",
            ]),
            templates: owned(&[
                "a bad photo of a {}.",
                "a low resolution photo of the {}.",
                "a bad photo of the {}.",
                "a cropped photo of the {}.",
                "a bright photo of a {}.",
                "a dark photo of the {}.",
                "a photo of my {}.",
                "a photo of the cool {}.",
                "a close-up photo of a {}.",
                "a black and white photo of the {}.",
                "a bright photo of the {}.",
                "a cropped photo of a {}.",
                "a jpeg corrupted photo of a {}.",
                "a blurry photo of the {}.",
                "a photo of the {}.",
                "a good photo of the {}.",
                "a photo of one {}.",
                "a close-up photo of the {}.",
                "a photo of a {}.",
                "a low resolution photo of a {}.",
                "a photo of a large {}.",
                "a blurry photo of a {}.",
                "a jpeg corrupted photo of the {}.",
                "a good photo of a {}.",
                "a photo of the small {}.",
                "a photo of the large {}.",
                "a black and white photo of a {}.",
                "a dark photo of a {}.",
                "a photo of a cool {}.",
                "a photo of a small {}.",
                "there is a {} in the scene.",
                "there is the {} in the scene.",
                "this is a {} in the scene.",
                "this is the {} in the scene.",
                "this is one {} in the scene.",
            ]),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
