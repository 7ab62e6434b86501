//! Layer normalization built from primitive tensor ops.
//!
//! `candle_nn::LayerNorm` dispatches contiguous inputs to a fused kernel with
//! no backward pass. Every norm sitting between a trainable parameter and the
//! loss has to use this one instead.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

/// Affine layer norm over the last dimension.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = match dtype {
            DType::F16 | DType::BF16 => xs.to_dtype(DType::F32)?,
            _ => xs.clone(),
        };
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered
            .broadcast_div(&(var + self.eps)?.sqrt()?)?
            .to_dtype(dtype)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Same naming and initialization as `candle_nn::layer_norm`.
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(LayerNorm::new(weight, bias, eps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn test_matches_fused_layer_norm() {
        let xs = Tensor::randn(0f32, 2.0, (2, 5, 8), &Device::Cpu).unwrap();
        let weight = Tensor::randn(1f32, 0.1, 8, &Device::Cpu).unwrap();
        let bias = Tensor::randn(0f32, 0.1, 8, &Device::Cpu).unwrap();

        let ours = LayerNorm::new(weight.clone(), bias.clone(), 1e-5).forward(&xs).unwrap();
        let fused = candle_nn::LayerNorm::new(weight, bias, 1e-5).forward(&xs).unwrap();
        let diff = (ours - fused)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "max difference {diff}");
    }

    #[test]
    fn test_gradients_reach_input_and_affine() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = layer_norm(8, 1e-5, vb).unwrap();
        let input = Var::randn(0f32, 1.0, (3, 8), &Device::Cpu).unwrap();
        let scale = Tensor::arange(0f32, 8.0, &Device::Cpu).unwrap();

        let loss = norm
            .forward(input.as_tensor())
            .unwrap()
            .broadcast_mul(&scale)
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();

        assert!(grads.get(input.as_tensor()).is_some());
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }
}
