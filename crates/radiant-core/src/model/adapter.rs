//! Bottleneck adapter applied to frozen backbone tokens.
//!
//! ```text
//! x (…, D) ──fc1──► leaky_relu ──► bottleneck (…, B)
//!                                     │
//!                                    fc2──► leaky_relu ──► reconstruction (…, D)
//! ```
//!
//! Both projections are bias-free. The bottleneck is what downstream scoring
//! consumes; the reconstruction is what gets blended back into the backbone.

use candle_core::{bail, Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

use crate::math::leaky_relu;

/// Negative slope of the adapter nonlinearity.
const NEGATIVE_SLOPE: f64 = 0.01;

/// Two-stage bottleneck transform with its own parameters.
#[derive(Debug, Clone)]
pub struct Adapter {
    fc1: Linear,
    fc2: Linear,
    input_dim: usize,
    bottleneck_dim: usize,
}

impl Adapter {
    /// Create an adapter; weights live under `fc1.weight` / `fc2.weight` in `vb`.
    pub fn new(input_dim: usize, bottleneck_dim: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear_no_bias(input_dim, bottleneck_dim, vb.pp("fc1"))?;
        let fc2 = linear_no_bias(bottleneck_dim, input_dim, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            input_dim,
            bottleneck_dim,
        })
    }

    /// Returns `(bottleneck, reconstruction)`.
    ///
    /// Fails when the last dimension of `xs` is not the adapter's input dim.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let dim = xs.dim(D::Minus1)?;
        if dim != self.input_dim {
            bail!(
                "adapter expects input dim {}, got {} (shape {:?})",
                self.input_dim,
                dim,
                xs.shape()
            );
        }
        let hidden = leaky_relu(&self.fc1.forward(xs)?, NEGATIVE_SLOPE)?;
        let recon = leaky_relu(&self.fc2.forward(&hidden)?, NEGATIVE_SLOPE)?;
        Ok((hidden, recon))
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn bottleneck_dim(&self) -> usize {
        self.bottleneck_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn adapter(input: usize, bottleneck: usize) -> (VarMap, Adapter) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let adapter = Adapter::new(input, bottleneck, vb).unwrap();
        (varmap, adapter)
    }

    #[test]
    fn test_forward_shapes() {
        let (_vm, adapter) = adapter(32, 8);
        let xs = Tensor::randn(0f32, 1.0, (2, 5, 32), &Device::Cpu).unwrap();
        let (hidden, recon) = adapter.forward(&xs).unwrap();
        assert_eq!(hidden.dims(), &[2, 5, 8]);
        assert_eq!(recon.dims(), &[2, 5, 32]);
    }

    #[test]
    fn test_parameters_are_two_bias_free_matrices() {
        let (varmap, _adapter) = adapter(32, 8);
        let data = varmap.data().lock().unwrap();
        let mut names: Vec<_> = data.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["fc1.weight", "fc2.weight"]);
        assert_eq!(data["fc1.weight"].as_tensor().dims(), &[8, 32]);
        assert_eq!(data["fc2.weight"].as_tensor().dims(), &[32, 8]);
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let (_vm, adapter) = adapter(32, 8);
        let xs = Tensor::zeros((1, 3, 16), DType::F32, &Device::Cpu).unwrap();
        let err = adapter.forward(&xs).unwrap_err();
        assert!(err.to_string().contains("expects input dim 32"));
    }

    #[test]
    fn test_negative_inputs_are_not_zeroed() {
        let (varmap, adapter) = adapter(2, 2);
        {
            let data = varmap.data().lock().unwrap();
            let identity = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
            data["fc1.weight"].set(&identity).unwrap();
            data["fc2.weight"].set(&identity).unwrap();
        }
        let xs = Tensor::new(&[[-1f32, 2.0]], &Device::Cpu).unwrap();
        let (hidden, recon) = adapter.forward(&xs).unwrap();
        let hidden = hidden.to_vec2::<f32>().unwrap();
        let recon = recon.to_vec2::<f32>().unwrap();
        assert!((hidden[0][0] + 0.01).abs() < 1e-7);
        assert!((recon[0][0] + 0.0001).abs() < 1e-8);
        assert_eq!(recon[0][1], 2.0);
    }
}
