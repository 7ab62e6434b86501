//! Radiant Core - zero-shot medical anomaly detection on a frozen CLIP ViT.
//!
//! Lightweight adapters are attached to selected depths of a frozen CLIP
//! vision transformer. Each tapped depth yields a segmentation stream, fused
//! across depths by a cross-modal decoder, and a detection stream scored
//! against normal/abnormal text embeddings. Only the adapters, the decoder and
//! the text projection are trained.
//!
//! # Architecture
//!
//! ```text
//! Image → CLIP ViT blocks ─┬─ tap k: seg adapter → fusion → decoder → pixel map
//!                          └─ tap k: det adapter → text similarity → image score
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use radiant_core::{Config, NoopHooks, Radiant};
//!
//! fn main() -> radiant_core::Result<()> {
//!     let config = Config::load()?;
//!     let radiant = Radiant::new(config)?;
//!     let history = radiant.train(&mut NoopHooks)?;
//!     println!("Best epoch: {:?}", history.best().map(|r| r.epoch));
//!     Ok(())
//! }
//! ```

pub mod class_group;
pub mod config;
pub mod data;
pub mod error;
pub mod math;
pub mod model;
pub mod output;
pub mod runtime;
pub mod text;
pub mod train;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;

pub use class_group::ClassGroup;
pub use config::Config;
pub use error::{
    ConfigError, DataError, MetricError, ModelError, ModelResult, RadiantError, Result, TextError,
};
pub use model::{AnomalyModel, Component};
pub use output::{OutputFormat, OutputWriter};
pub use runtime::Runtime;
pub use train::{EpochReport, Evaluation, NoopHooks, TrainHooks, TrainingHistory};

use data::{MedicalTestSet, MedicalTrainSet};
use model::{ClipVisionTransformer, ClipVitConfig, VisionBackbone};
use text::{ClipTextEncoder, TextBank};
use train::{checkpoint, Trainer, TrainerOptions};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A configured model ready to train or evaluate.
pub struct Radiant {
    config: Config,
    runtime: Runtime,
    model: AnomalyModel,
}

impl Radiant {
    /// Resolve the device, load the frozen backbone and build fresh trainable
    /// components.
    pub fn new(config: Config) -> Result<Self> {
        tracing::debug!("Initializing Radiant v{}", VERSION);
        let runtime = Runtime::from_config(&config.runtime)?;

        let vit_config = ClipVitConfig::for_variant(&config.backbone.name)?;
        let backbone: Arc<dyn VisionBackbone> = Arc::new(ClipVisionTransformer::load(
            vit_config,
            config.backbone.image_size,
            &config.backbone_dir(),
            &runtime.device,
        )?);
        let model = AnomalyModel::new(backbone, &config.model, &runtime.device, &mut runtime.rng())?;

        Ok(Self {
            config,
            runtime,
            model,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model(&self) -> &AnomalyModel {
        &self.model
    }

    /// Text tables of every class group, from the on-disk cache when valid.
    pub fn text_bank(&self) -> Result<TextBank> {
        let text_dim = self.model.router().backbone().text_dim();
        let encoder = ClipTextEncoder::new(&self.config.backbone_dir(), text_dim)?;
        let cache_dir = self.config.text_cache_dir();
        Ok(TextBank::build(
            &encoder,
            &self.config.prompts,
            &self.config.backbone.name,
            Some(&cache_dir),
        )?)
    }

    /// Train on every class group except the configured target, evaluating
    /// the target between epochs and checkpointing the best score.
    pub fn train(self, hooks: &mut dyn TrainHooks) -> Result<TrainingHistory> {
        let bank = self.text_bank()?;
        let text = bank.tensors(&self.runtime.device)?;

        let target = self.config.training.target;
        let image_size = self.config.backbone.image_size as u32;
        let data_dir = self.config.data_dir();
        let mut rng = self.runtime.rng();
        let mut train_set = MedicalTrainSet::open(
            &data_dir,
            target,
            image_size,
            self.config.training.batch_size,
            &mut rng,
        )?;
        let test_set = MedicalTestSet::open(&data_dir, target, image_size)?;

        let options = TrainerOptions::from_config(&self.config);
        tracing::info!(
            "Training {} epochs, holding out {} (checkpoint {:?})",
            options.epochs,
            target,
            options.checkpoint_path
        );
        let mut trainer = Trainer::new(self.model, text, options)?;
        trainer.run(&mut train_set, &test_set, &mut rng, hooks)
    }

    /// Restore `checkpoint_path` and evaluate the target group once.
    pub fn evaluate_checkpoint(&self, checkpoint_path: &Path) -> Result<Evaluation> {
        checkpoint::restore(self.model.params(), checkpoint_path, &self.runtime.device)?;

        let target = self.config.training.target;
        let bank = self.text_bank()?;
        let text = bank.tensor(target, &self.runtime.device)?;
        let test_set = MedicalTestSet::open(
            &self.config.data_dir(),
            target,
            self.config.backbone.image_size as u32,
        )?;
        train::evaluate(
            &self.model,
            &test_set,
            &text,
            target,
            self.config.model.carry_contextualized,
        )
    }
}
