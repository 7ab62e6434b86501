//! Bilinear resizing expressed as two matrix products.
//!
//! `out = Wy · X · Wxᵀ`, where each `W` row holds the two interpolation weights
//! for one output coordinate. Keeping resizing inside plain matmuls means
//! gradients flow through it without a dedicated backward op.

use candle_core::{Device, Result, Tensor};

/// Sampling-grid convention, as in PyTorch's `align_corners`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Corner pixels of input and output coincide.
    Corners,
    /// Pixel centers are mapped onto each other.
    Centers,
}

/// `(output, input)` interpolation matrix for one axis.
pub fn interpolation_weights(input: usize, output: usize, alignment: Alignment) -> Vec<f32> {
    let mut weights = vec![0.0f32; output * input];
    for o in 0..output {
        let src = match alignment {
            Alignment::Corners => {
                if output > 1 {
                    o as f64 * (input as f64 - 1.0) / (output as f64 - 1.0)
                } else {
                    0.0
                }
            }
            Alignment::Centers => {
                let scale = input as f64 / output as f64;
                ((o as f64 + 0.5) * scale - 0.5).max(0.0)
            }
        };
        let src = src.min((input - 1) as f64);
        let i0 = src.floor() as usize;
        let i1 = (i0 + 1).min(input - 1);
        let frac = (src - i0 as f64) as f32;
        weights[o * input + i0] += 1.0 - frac;
        weights[o * input + i1] += frac;
    }
    weights
}

fn weight_matrix(input: usize, output: usize, alignment: Alignment, device: &Device) -> Result<Tensor> {
    Tensor::from_vec(
        interpolation_weights(input, output, alignment),
        (output, input),
        device,
    )
}

/// Resize the last two dimensions of `xs` (`(…, H, W)`) to `(out_h, out_w)`.
pub fn resize_bilinear(xs: &Tensor, out_h: usize, out_w: usize, alignment: Alignment) -> Result<Tensor> {
    let rank = xs.rank();
    let in_h = xs.dim(rank - 2)?;
    let in_w = xs.dim(rank - 1)?;
    if in_h == out_h && in_w == out_w {
        return Ok(xs.clone());
    }
    let device = xs.device();
    let wy = weight_matrix(in_h, out_h, alignment, device)?.to_dtype(xs.dtype())?;
    let wx = weight_matrix(in_w, out_w, alignment, device)?.to_dtype(xs.dtype())?;
    let cols = xs.broadcast_matmul(&wx.t()?)?;
    wy.broadcast_matmul(&cols)
}
