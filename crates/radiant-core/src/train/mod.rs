//! Training and evaluation of the adapter-fused model.
//!
//! Only the four trainable components are ever updated; the backbone stays
//! frozen.

pub mod checkpoint;
pub mod evaluate;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod scoring;
pub mod trainer;

pub use evaluate::{evaluate, predict, Evaluation, ImagePrediction};
pub use metrics::{min_max_normalize, roc_auc};
pub use optim::{AdamSettings, ComponentOptimizers};
pub use scoring::{anomaly_map, detection_score, segmentation_maps, ProgressiveFusion};
pub use trainer::{
    BestScore, EpochReport, NoopHooks, StepOutcome, TrainHooks, Trainer, TrainerOptions,
    TrainingHistory,
};
