//! Training objectives.
//!
//! - image level: binary cross-entropy with logits on the mean abnormal
//!   probability of the detection stream
//! - pixel level: focal loss on the two-channel probability map plus soft dice
//!   on the abnormal channel

use candle_core::{bail, Result, Tensor};

/// Label smoothing for the focal loss one-hot targets.
const FOCAL_SMOOTH: f64 = 1e-5;
/// Additive smoothing of the dice ratio.
const DICE_SMOOTH: f64 = 1.0;

/// Mean binary cross-entropy of `sigmoid(logits)` against `targets`.
///
/// Uses `max(x, 0) - x·y + log(1 + e^{-|x|})`, which never overflows.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    if logits.shape() != targets.shape() {
        bail!(
            "bce: logits {:?} vs targets {:?}",
            logits.shape(),
            targets.shape()
        );
    }
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    ((logits.relu()? - (logits * targets)?)? + softplus)?.mean_all()
}

/// Focal loss over a softmaxed two-channel map.
///
/// `probs` is `(batch, 2, H, W)`, `mask` is `(batch, H, W)` in {0, 1}.
pub fn focal_loss(probs: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (batch, channels, h, w) = probs.dims4()?;
    if channels != 2 || mask.dims() != [batch, h, w] {
        bail!(
            "focal: probabilities {:?} vs mask {:?}",
            probs.shape(),
            mask.shape()
        );
    }
    let one_hot = Tensor::stack(&[&mask.affine(-1.0, 1.0)?, mask], 1)?
        .clamp(FOCAL_SMOOTH, 1.0 - FOCAL_SMOOTH)?;
    let pt = ((one_hot * probs)?.sum(1)? + FOCAL_SMOOTH)?;
    // Focusing exponent 2.
    let modulation = pt.affine(-1.0, 1.0)?.sqr()?;
    (modulation * pt.log()?)?.mean_all()?.neg()
}

/// Soft dice loss between abnormal probabilities and a binary mask, both
/// `(batch, H, W)`.
pub fn dice_loss(probs: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if probs.shape() != mask.shape() {
        bail!("dice: probabilities {:?} vs mask {:?}", probs.shape(), mask.shape());
    }
    let probs = probs.flatten_from(1)?;
    let mask = mask.flatten_from(1)?;
    let intersection = (&probs * &mask)?.sum(1)?;
    let numerator = intersection.affine(2.0, DICE_SMOOTH)?;
    let denominator = ((probs.sum(1)? + mask.sum(1)?)? + DICE_SMOOTH)?;
    (numerator / denominator)?.mean_all()?.affine(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_bce_matches_closed_form() {
        let logits = Tensor::new(&[0.0f32, 2.0, -3.0], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1.0f32, 0.0, 0.0], &Device::Cpu).unwrap();
        let expected = [(0.0f32, 1.0f32), (2.0, 0.0), (-3.0, 0.0)]
            .iter()
            .map(|&(x, y)| {
                let p = 1.0 / (1.0 + (-x).exp());
                -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            })
            .sum::<f32>()
            / 3.0;
        let loss = scalar(bce_with_logits(&logits, &targets).unwrap());
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_bce_is_stable_for_large_logits() {
        let logits = Tensor::new(&[500.0f32, -500.0], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1.0f32, 0.0], &Device::Cpu).unwrap();
        let loss = scalar(bce_with_logits(&logits, &targets).unwrap());
        assert!(loss.is_finite());
        assert!(loss < 1e-5);
    }

    #[test]
    fn test_focal_loss_rewards_confident_correct_maps() {
        let mask = Tensor::new(&[[[0f32, 1.0], [1.0, 0.0]]], &Device::Cpu).unwrap();
        let abnormal = Tensor::new(&[[[0.01f32, 0.99], [0.99, 0.01]]], &Device::Cpu).unwrap();
        let good = Tensor::stack(&[&abnormal.affine(-1.0, 1.0).unwrap(), &abnormal], 1).unwrap();
        let bad_abnormal = abnormal.affine(-1.0, 1.0).unwrap();
        let bad = Tensor::stack(&[&abnormal, &bad_abnormal], 1).unwrap();

        let good_loss = scalar(focal_loss(&good, &mask).unwrap());
        let bad_loss = scalar(focal_loss(&bad, &mask).unwrap());
        assert!(good_loss >= 0.0);
        assert!(good_loss < 1e-3);
        assert!(bad_loss > 1.0);
    }

    #[test]
    fn test_focal_loss_single_pixel_value() {
        // p = 0.5 for the true class: pt ≈ 0.5, loss ≈ 0.25·ln 2.
        let probs = Tensor::full(0.5f32, (1, 2, 1, 1), &Device::Cpu).unwrap();
        let mask = Tensor::zeros((1, 1, 1), DType::F32, &Device::Cpu).unwrap();
        let loss = scalar(focal_loss(&probs, &mask).unwrap());
        assert!((loss - 0.25 * 2f32.ln()).abs() < 1e-4);
    }

    #[test]
    fn test_dice_loss_bounds() {
        let mask = Tensor::new(&[[[0f32, 1.0], [1.0, 0.0]]], &Device::Cpu).unwrap();
        let perfect = scalar(dice_loss(&mask, &mask).unwrap());
        assert!(perfect.abs() < 1e-6);

        let inverted = mask.affine(-1.0, 1.0).unwrap();
        // (0 + 1) / (2 + 2 + 1)
        let worst = scalar(dice_loss(&inverted, &mask).unwrap());
        assert!((worst - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_dice_on_empty_mask_and_empty_prediction_is_zero() {
        let zeros = Tensor::zeros((2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(scalar(dice_loss(&zeros, &zeros).unwrap()).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let probs = Tensor::zeros((1, 2, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::zeros((1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(focal_loss(&probs, &mask).is_err());
        assert!(dice_loss(&probs.narrow(1, 1, 1).unwrap().squeeze(1).unwrap(), &mask).is_err());
    }
}
