//! Turning tap features into anomaly scores and maps.

use candle_core::{Result, Tensor, D};

use crate::error::{ModelError, ModelResult};
use crate::math::l2_normalize_last;
use crate::model::resize::{resize_bilinear, Alignment};
use crate::model::{AnomalyModel, LOGIT_SCALE};

/// Weight of both the running value and the incoming depth in progressive
/// fusion.
const FUSION_WEIGHT: f64 = 0.5;

/// Per-patch abnormal probability of the detection stream.
///
/// `tokens` is `(batch, N, text_dim)` with the class token first; `text` is the
/// `(text_dim, 2)` class table. Returns `(batch, N − 1)`.
pub fn detection_probabilities(tokens: &Tensor, text: &Tensor) -> Result<Tensor> {
    let seq = tokens.dim(1)?;
    let patches = l2_normalize_last(&tokens.narrow(1, 1, seq - 1)?)?;
    let logits = (patches.broadcast_matmul(text)? * LOGIT_SCALE)?;
    candle_nn::ops::softmax(&logits, D::Minus1)?
        .narrow(D::Minus1, 1, 1)?
        .squeeze(D::Minus1)
}

/// Image-level score of one depth: mean abnormal probability, `(batch,)`.
pub fn detection_score(tokens: &Tensor, text: &Tensor) -> Result<Tensor> {
    detection_probabilities(tokens, text)?.mean(D::Minus1)
}

/// Running fusion of per-depth segmentation streams.
///
/// The first depth enters as is; every later depth is averaged 50/50 with the
/// running value. The running value can be replaced between depths (by the
/// decoder's contextualized tokens) with [`ProgressiveFusion::carry`].
#[derive(Debug, Default)]
pub struct ProgressiveFusion {
    current: Option<Tensor>,
}

impl ProgressiveFusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the next depth and return the fused value.
    pub fn push(&mut self, features: &Tensor) -> Result<Tensor> {
        let fused = match &self.current {
            None => features.clone(),
            Some(current) => {
                (current.affine(FUSION_WEIGHT, 0.0)? + features.affine(FUSION_WEIGHT, 0.0)?)?
            }
        };
        self.current = Some(fused.clone());
        Ok(fused)
    }

    /// Replace the running value.
    pub fn carry(&mut self, value: Tensor) {
        self.current = Some(value);
    }
}

/// `(batch, L, 2)` patch logits → `(batch, 2, out_h, out_w)` channel
/// probabilities, upsampled with corner alignment.
pub fn upsample_map(map: &Tensor, out_h: usize, out_w: usize) -> ModelResult<Tensor> {
    let (batch, patches, channels) = map.dims3()?;
    let side = (patches as f64).sqrt().round() as usize;
    if side * side != patches {
        return Err(ModelError::NonSquareGrid { patches });
    }
    let grid = map
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, channels, side, side))?;
    let resized = resize_bilinear(&grid, out_h, out_w, Alignment::Corners)?;
    Ok(candle_nn::ops::softmax(&resized, 1)?)
}

/// Decode every depth of the segmentation stream into probability maps at
/// `(out_h, out_w)`, one `(batch, 2, out_h, out_w)` tensor per tap.
///
/// With `carry_contextualized` the decoder output of each depth becomes the
/// running fusion value for the next.
pub fn segmentation_maps(
    model: &AnomalyModel,
    seg_features: &[Tensor],
    text: &Tensor,
    out_h: usize,
    out_w: usize,
    carry_contextualized: bool,
) -> ModelResult<Vec<Tensor>> {
    let mut fusion = ProgressiveFusion::new();
    let mut maps = Vec::with_capacity(seg_features.len());
    for (ith, features) in seg_features.iter().enumerate() {
        let fused = fusion.push(features)?;
        let (contextualized, logits) = model.decode(&fused, text, ith)?;
        if carry_contextualized {
            fusion.carry(contextualized);
        }
        maps.push(upsample_map(&logits, out_h, out_w)?);
    }
    Ok(maps)
}

/// Sum over depths of the abnormal-channel probability: `(batch, out_h, out_w)`.
pub fn anomaly_map(maps: &[Tensor]) -> ModelResult<Tensor> {
    let mut abnormal = maps
        .iter()
        .map(|m| m.narrow(1, 1, 1)?.squeeze(1))
        .collect::<Result<Vec<_>>>()?
        .into_iter();
    let Some(first) = abnormal.next() else {
        return Err(ModelError::InvalidTapSet {
            depths: vec![],
            reason: "no maps to combine".to_string(),
        });
    };
    let mut total = first;
    for map in abnormal {
        total = (total + map)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{text_table, tiny_model, TINY_IMAGE};
    use candle_core::{DType, Device};

    #[test]
    fn test_progressive_fusion_law() {
        let f: Vec<Tensor> = [1f32, 2.0, 4.0]
            .iter()
            .map(|&v| Tensor::full(v, (1, 3, 2), &Device::Cpu).unwrap())
            .collect();
        let mut fusion = ProgressiveFusion::new();
        let mut last = None;
        for t in &f {
            last = Some(fusion.push(t).unwrap());
        }
        // 0.5·(0.5·1 + 0.5·2) + 0.5·4
        let expected = 0.5 * (0.5 * 1.0 + 0.5 * 2.0) + 0.5 * 4.0;
        let values = last.unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v - expected).abs() < 1e-6));
    }

    #[test]
    fn test_progressive_fusion_recurrence_for_any_depth() {
        let inputs = [3f32, -1.0, 0.5, 8.0, 2.0];
        let mut fusion = ProgressiveFusion::new();
        let mut expected = inputs[0];
        fusion.push(&Tensor::new(&[inputs[0]], &Device::Cpu).unwrap()).unwrap();
        for &x in &inputs[1..] {
            expected = 0.5 * expected + 0.5 * x;
            let fused = fusion
                .push(&Tensor::new(&[x], &Device::Cpu).unwrap())
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            assert!((fused[0] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_carry_replaces_running_value() {
        let mut fusion = ProgressiveFusion::new();
        fusion.push(&Tensor::new(&[10f32], &Device::Cpu).unwrap()).unwrap();
        fusion.carry(Tensor::new(&[2f32], &Device::Cpu).unwrap());
        let fused = fusion.push(&Tensor::new(&[4f32], &Device::Cpu).unwrap()).unwrap();
        assert_eq!(fused.to_vec1::<f32>().unwrap(), vec![3.0]);
    }

    #[test]
    fn test_detection_score_is_a_probability() {
        let tokens = Tensor::randn(0f32, 1.0, (2, 17, 16), &Device::Cpu).unwrap();
        let score = detection_score(&tokens, &text_table(16)).unwrap();
        assert_eq!(score.dims(), &[2]);
        for s in score.to_vec1::<f32>().unwrap() {
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn test_upsampled_channels_sum_to_one() {
        let logits = Tensor::randn(0f32, 5.0, (2, 16, 2), &Device::Cpu).unwrap();
        let probs = upsample_map(&logits, 10, 10).unwrap();
        assert_eq!(probs.dims(), &[2, 2, 10, 10]);
        let sums = probs.sum(1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_non_square_grid_is_rejected() {
        let logits = Tensor::zeros((1, 15, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            upsample_map(&logits, 8, 8),
            Err(ModelError::NonSquareGrid { patches: 15 })
        ));
    }

    #[test]
    fn test_end_to_end_map_at_image_resolution() {
        let model = tiny_model();
        let pixels = Tensor::randn(0f32, 1.0, (1, 3, TINY_IMAGE, TINY_IMAGE), &Device::Cpu).unwrap();
        let features = model.forward(&pixels).unwrap();

        let tokens = 1 + model.grid_size() * model.grid_size();
        assert_eq!(features.len(), 2);
        for (seg, det) in features.seg.iter().zip(&features.det) {
            assert_eq!(seg.dims(), &[1, tokens, 8]);
            assert_eq!(det.dims(), &[1, tokens, 16]);
        }

        let text = text_table(16);
        let maps =
            segmentation_maps(&model, &features.seg, &text, TINY_IMAGE, TINY_IMAGE, true).unwrap();
        let composite = anomaly_map(&maps).unwrap();
        assert_eq!(composite.dims(), &[1, TINY_IMAGE, TINY_IMAGE]);
        let values = composite.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| (0.0..=2.0).contains(&v)));
    }
}
