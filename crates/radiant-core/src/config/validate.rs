//! Configuration validation with range checks.
//!
//! Checks here are limited to what the file alone can decide. Tap depths
//! against the backbone's block count and the detection width against the text
//! dimension are checked when the model is built.

use crate::error::ConfigError;

use super::Config;

impl Config {
    /// Validate configuration values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let taps = &self.model.taps;
        if taps.is_empty() {
            return Err(ConfigError::ValidationError(
                "model.taps must name at least one depth".into(),
            ));
        }
        if taps.contains(&0) {
            return Err(ConfigError::ValidationError(
                "model.taps are 1-indexed; depth 0 is invalid".into(),
            ));
        }
        if taps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::ValidationError(
                "model.taps must be strictly ascending".into(),
            ));
        }
        if self.model.seg_bottleneck == 0 || self.model.det_bottleneck == 0 {
            return Err(ConfigError::ValidationError(
                "model.seg_bottleneck and model.det_bottleneck must be > 0".into(),
            ));
        }
        if self.model.decoder_heads == 0
            || self.model.seg_bottleneck % self.model.decoder_heads != 0
        {
            return Err(ConfigError::ValidationError(
                "model.decoder_heads must be > 0 and divide model.seg_bottleneck".into(),
            ));
        }
        if self.model.decoder_ff_dim == 0 {
            return Err(ConfigError::ValidationError(
                "model.decoder_ff_dim must be > 0".into(),
            ));
        }
        if self.backbone.image_size == 0 {
            return Err(ConfigError::ValidationError(
                "backbone.image_size must be > 0".into(),
            ));
        }
        if self.training.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "training.batch_size must be > 0".into(),
            ));
        }
        if self.training.learning_rate <= 0.0 {
            return Err(ConfigError::ValidationError(
                "training.learning_rate must be > 0".into(),
            ));
        }
        for (name, beta) in [
            ("training.beta1", self.training.beta1),
            ("training.beta2", self.training.beta2),
        ] {
            if !(0.0..1.0).contains(&beta) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be in [0.0, 1.0)"
                )));
            }
        }
        if !matches!(
            self.runtime.device.as_str(),
            "auto" | "cpu" | "cuda" | "metal"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "runtime.device must be auto, cpu, cuda or metal (got '{}')",
                self.runtime.device
            )));
        }
        if self.prompts.normal_states.is_empty()
            || self.prompts.abnormal_states.is_empty()
            || self.prompts.templates.is_empty()
        {
            return Err(ConfigError::ValidationError(
                "prompts.normal_states, prompts.abnormal_states and prompts.templates must be non-empty"
                    .into(),
            ));
        }
        Ok(())
    }
}
