//! Held-out evaluation of the target class group.

use candle_core::Tensor;
use serde::Serialize;

use crate::class_group::ClassGroup;
use crate::data::{to_tensor, TestSource};
use crate::error::Result;
use crate::model::AnomalyModel;

use super::metrics::{min_max_normalize, roc_auc};
use super::scoring::{anomaly_map, detection_score, segmentation_maps};

/// AUCs of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    pub image_auc: f64,
    /// Present only for groups with pixel ground truth.
    pub pixel_auc: Option<f64>,
    /// `pixel_auc + image_auc`, or `image_auc` alone.
    pub score: f64,
}

/// Per-image outputs before normalization.
#[derive(Debug, Clone)]
pub struct ImagePrediction {
    /// Sum over depths of the mean abnormal probability.
    pub score: f32,
    /// Sum over depths of the abnormal probability, row-major `(H, W)`.
    pub pixel_scores: Option<Vec<f32>>,
}

/// Score one `(1, 3, H, W)` image without tracking gradients.
pub fn predict(
    model: &AnomalyModel,
    pixels: &Tensor,
    text: &Tensor,
    with_map: bool,
    carry_contextualized: bool,
) -> Result<ImagePrediction> {
    let features = model.forward(pixels)?;

    let det: Vec<Tensor> = features.det.iter().map(|t| t.detach()).collect();
    let score = image_score(&det, text)?.sum_all()?.to_scalar::<f32>()?;

    let pixel_scores = if with_map {
        let (_, _, h, w) = pixels.dims4()?;
        let seg: Vec<Tensor> = features.seg.iter().map(|t| t.detach()).collect();
        let maps = segmentation_maps(model, &seg, text, h, w, carry_contextualized)?;
        let map = anomaly_map(&maps)?.detach();
        Some(map.flatten_all()?.to_vec1::<f32>()?)
    } else {
        None
    };

    Ok(ImagePrediction {
        score,
        pixel_scores,
    })
}

/// Evaluate the whole test split of `group`.
///
/// Image scores and pixel scores are min-max normalized independently over
/// the full set before ROC-AUC.
pub fn evaluate(
    model: &AnomalyModel,
    test: &dyn TestSource,
    text: &Tensor,
    group: ClassGroup,
    carry_contextualized: bool,
) -> Result<Evaluation> {
    let with_maps = group.has_pixel_masks();

    let mut image_scores = Vec::with_capacity(test.len());
    let mut image_labels = Vec::with_capacity(test.len());
    let mut pixel_scores = Vec::new();
    let mut pixel_labels = Vec::new();

    for index in 0..test.len() {
        let sample = test.sample(index)?;
        let pixels = to_tensor(&sample.image, model.device())?;
        let prediction = predict(model, &pixels, text, with_maps, carry_contextualized)?;

        image_scores.push(prediction.score);
        image_labels.push(sample.label);
        if let Some(scores) = prediction.pixel_scores {
            pixel_scores.extend(scores);
            pixel_labels.extend(sample.mask.iter().map(|&m| u8::from(m > 0.0)));
        }
    }

    let image_auc = roc_auc(&min_max_normalize(&image_scores), &image_labels)?;
    let pixel_auc = if with_maps {
        Some(roc_auc(&min_max_normalize(&pixel_scores), &pixel_labels)?)
    } else {
        None
    };
    let score = image_auc + pixel_auc.unwrap_or(0.0);

    tracing::debug!(
        "Evaluated {} images of {}: image AUC {:.4}, pixel AUC {:?}",
        test.len(),
        group,
        image_auc,
        pixel_auc
    );

    Ok(Evaluation {
        image_auc,
        pixel_auc,
        score,
    })
}

/// Image-level score: mean abnormal probability per depth, summed over
/// depths. Returns `(batch,)`.
pub fn image_score(det_features: &[Tensor], text: &Tensor) -> candle_core::Result<Tensor> {
    let scores = det_features
        .iter()
        .map(|det| detection_score(det, text))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Tensor::stack(&scores, 0)?.sum(0)
}
