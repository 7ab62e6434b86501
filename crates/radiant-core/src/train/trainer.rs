//! Epoch loop: evaluate the held-out group, keep the best checkpoint, train
//! one pass over every other group.

use std::collections::BTreeMap;
use std::path::PathBuf;

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use serde::Serialize;

use crate::class_group::ClassGroup;
use crate::config::Config;
use crate::data::{to_tensor, TestSource, TrainBatch, TrainSource};
use crate::error::{ModelError, Result, TextError};
use crate::model::{AnomalyModel, Component};

use super::checkpoint;
use super::evaluate::{evaluate, Evaluation};
use super::loss::{bce_with_logits, dice_loss, focal_loss};
use super::optim::{AdamSettings, ComponentOptimizers};
use super::scoring::{detection_score, segmentation_maps};

/// Settings of one training run.
#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub epochs: usize,
    pub adam: AdamSettings,
    pub carry_contextualized: bool,
    /// Held-out class group, evaluated but never trained on.
    pub target: ClassGroup,
    pub checkpoint_path: PathBuf,
}

impl TrainerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            epochs: config.training.epochs,
            adam: AdamSettings::from_config(&config.training),
            carry_contextualized: config.model.carry_contextualized,
            target: config.training.target,
            checkpoint_path: config.checkpoint_path(config.training.target),
        }
    }
}

/// Losses of a single optimization step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub loss: f32,
    pub det_loss: f32,
    /// `None` for groups trained on image labels only.
    pub seg_loss: Option<f32>,
    pub stepped: Vec<Component>,
}

/// Best composite score seen so far. Starts at zero; ties go to the later
/// epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestScore {
    best: f64,
    epoch: Option<usize>,
}

impl BestScore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `score` for `epoch`; returns true when it should be saved.
    pub fn offer(&mut self, epoch: usize, score: f64) -> bool {
        if score >= self.best {
            self.best = score;
            self.epoch = Some(epoch);
            true
        } else {
            false
        }
    }

    pub fn score(&self) -> f64 {
        self.best
    }

    pub fn epoch(&self) -> Option<usize> {
        self.epoch
    }
}

/// Summary of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub mean_loss: f32,
    /// Evaluation run at the start of this epoch, absent for epoch 0.
    pub image_auc: Option<f64>,
    pub pixel_auc: Option<f64>,
    pub score: Option<f64>,
    /// Whether this epoch's evaluation produced a new checkpoint.
    pub saved: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochReport>,
}

impl TrainingHistory {
    pub fn push(&mut self, report: EpochReport) {
        self.epochs.push(report);
    }

    /// The last epoch whose evaluation was saved.
    pub fn best(&self) -> Option<&EpochReport> {
        self.epochs.iter().rev().find(|r| r.saved)
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

/// Progress callbacks. Every method defaults to doing nothing.
pub trait TrainHooks {
    fn on_epoch_start(&mut self, _epoch: usize, _batches: usize) {}

    fn on_batch(&mut self, _epoch: usize, _index: usize, _outcome: &StepOutcome) {}

    fn on_evaluation(&mut self, _epoch: usize, _evaluation: &Evaluation, _saved: bool) {}

    fn on_epoch_end(&mut self, _report: &EpochReport) {}
}

/// Hooks that ignore every event.
pub struct NoopHooks;

impl TrainHooks for NoopHooks {}

/// Owns the model, its optimizers and the per-group text tensors.
pub struct Trainer {
    model: AnomalyModel,
    optimizers: ComponentOptimizers,
    text: BTreeMap<ClassGroup, Tensor>,
    options: TrainerOptions,
    best: BestScore,
}

impl Trainer {
    pub fn new(
        model: AnomalyModel,
        text: BTreeMap<ClassGroup, Tensor>,
        options: TrainerOptions,
    ) -> Result<Self> {
        if !text.contains_key(&options.target) {
            return Err(TextError::MissingTable(options.target.name().to_string()).into());
        }
        let optimizers = ComponentOptimizers::new(model.params(), options.adam)?;
        Ok(Self {
            model,
            optimizers,
            text,
            options,
            best: BestScore::new(),
        })
    }

    pub fn model(&self) -> &AnomalyModel {
        &self.model
    }

    pub fn options(&self) -> &TrainerOptions {
        &self.options
    }

    pub fn best(&self) -> BestScore {
        self.best
    }

    pub fn optimizers(&self) -> &ComponentOptimizers {
        &self.optimizers
    }

    fn text_for(&self, group: ClassGroup) -> Result<&Tensor> {
        self.text
            .get(&group)
            .ok_or_else(|| TextError::MissingTable(group.name().to_string()).into())
    }

    /// One forward, one shared backward, one step of every optimizer that
    /// received a gradient.
    ///
    /// The segmentation adapters are only updated on pixel-supervised batches,
    /// even though the detection loss reaches them through the residual
    /// stream.
    pub fn train_step(&mut self, batch: &TrainBatch) -> Result<StepOutcome> {
        let text = self.text_for(batch.group)?.clone();
        let device = self.model.device().clone();

        let images = to_tensor(&batch.images, &device)?;
        let (n, _, h, w) = images.dims4()?;
        let labels = Tensor::from_slice(&batch.labels, (n,), &device)?;
        let features = self.model.forward(&images)?;

        let mut det_loss = Tensor::zeros((), DType::F32, &device)?;
        for det in &features.det {
            let score = detection_score(det, &text)?;
            det_loss = (det_loss + bce_with_logits(&score, &labels)?)?;
        }

        let seg_loss = if batch.group.has_pixel_masks() {
            let masks = to_tensor(&batch.masks, &device)?;
            if masks.dims() != [n, h, w] {
                return Err(ModelError::DimensionMismatch {
                    component: format!("{} mask", batch.group),
                    expected: h * w,
                    actual: masks.elem_count() / n.max(1),
                }
                .into());
            }
            let maps = segmentation_maps(
                &self.model,
                &features.seg,
                &text,
                h,
                w,
                self.options.carry_contextualized,
            )?;
            let mut total = Tensor::zeros((), DType::F32, &device)?;
            for map in &maps {
                let abnormal = map.narrow(1, 1, 1)?.squeeze(1)?;
                total = ((total + focal_loss(map, &masks)?)? + dice_loss(&abnormal, &masks)?)?;
            }
            Some(total)
        } else {
            None
        };

        let loss = match &seg_loss {
            Some(seg) => (seg + &det_loss)?,
            None => det_loss.clone(),
        };
        let grads = loss.backward()?;
        let components: &[Component] = if seg_loss.is_some() {
            &Component::ALL[..]
        } else {
            &[Component::DetAdapters, Component::Decoder, Component::TextProj][..]
        };
        let stepped = self.optimizers.step(&grads, components)?;

        let outcome = StepOutcome {
            loss: loss.to_scalar::<f32>()?,
            det_loss: det_loss.to_scalar::<f32>()?,
            seg_loss: seg_loss.map(|s| s.to_scalar::<f32>()).transpose()?,
            stepped,
        };
        tracing::debug!(
            "{} batch of {}: loss {:.4} (det {:.4}, seg {:?})",
            batch.group,
            n,
            outcome.loss,
            outcome.det_loss,
            outcome.seg_loss
        );
        Ok(outcome)
    }

    /// Evaluate the target group with the current weights.
    pub fn evaluate(&self, test: &dyn TestSource) -> Result<Evaluation> {
        let text = self.text_for(self.options.target)?;
        evaluate(
            &self.model,
            test,
            text,
            self.options.target,
            self.options.carry_contextualized,
        )
    }

    /// Run every epoch.
    ///
    /// Each epoch > 0 opens with an evaluation; a score at least as good as
    /// the best so far overwrites the checkpoint. The weights produced by the
    /// final epoch are not evaluated.
    pub fn run(
        &mut self,
        train: &mut dyn TrainSource,
        test: &dyn TestSource,
        rng: &mut StdRng,
        hooks: &mut dyn TrainHooks,
    ) -> Result<TrainingHistory> {
        let mut history = TrainingHistory::default();

        for epoch in 0..self.options.epochs {
            hooks.on_epoch_start(epoch, train.len());

            let evaluation = if epoch > 0 {
                Some(self.evaluate(test)?)
            } else {
                None
            };
            let mut saved = false;
            if let Some(evaluation) = &evaluation {
                if self.best.offer(epoch, evaluation.score) {
                    checkpoint::save(self.model.params(), &self.options.checkpoint_path)?;
                    saved = true;
                }
                tracing::info!(
                    "Epoch {}: {} image AUC {:.4}, pixel AUC {}, score {:.4}{}",
                    epoch,
                    self.options.target,
                    evaluation.image_auc,
                    evaluation
                        .pixel_auc
                        .map(|a| format!("{a:.4}"))
                        .unwrap_or_else(|| "n/a".to_string()),
                    evaluation.score,
                    if saved { " (best)" } else { "" }
                );
                hooks.on_evaluation(epoch, evaluation, saved);
            }

            let mut losses = Vec::with_capacity(train.len());
            for index in 0..train.len() {
                let batch = train.batch(index)?;
                let outcome = self.train_step(&batch)?;
                losses.push(outcome.loss);
                hooks.on_batch(epoch, index, &outcome);
            }
            let mean_loss = if losses.is_empty() {
                0.0
            } else {
                losses.iter().sum::<f32>() / losses.len() as f32
            };
            train.reshuffle(rng);

            let report = EpochReport {
                epoch,
                mean_loss,
                image_auc: evaluation.map(|e| e.image_auc),
                pixel_auc: evaluation.and_then(|e| e.pixel_auc),
                score: evaluation.map(|e| e.score),
                saved,
            };
            tracing::info!("Epoch {}: mean loss {:.4}", epoch, mean_loss);
            hooks.on_epoch_end(&report);
            history.push(report);
        }

        Ok(history)
    }
}
