//! Dataset collaborators: sample types, the source traits the training loop
//! consumes, and the on-disk medical anomaly benchmark layout.

pub mod discovery;
pub mod medical;
pub mod preprocess;

use candle_core::{Device, Tensor};
use ndarray::{Array, Array2, Array3, Array4, Dimension};
use rand::rngs::StdRng;

use crate::class_group::ClassGroup;
use crate::error::DataError;

pub use discovery::discover_images;
pub use medical::{MedicalTestSet, MedicalTrainSet};
pub use preprocess::{preprocess_image, preprocess_mask};

/// One training step's worth of images from a single class group.
#[derive(Debug, Clone)]
pub struct TrainBatch {
    /// `(batch, 3, size, size)`, CLIP-normalized.
    pub images: Array4<f32>,
    /// 0 = normal, 1 = anomalous.
    pub labels: Vec<f32>,
    /// `(batch, size, size)` in {0, 1}; all zeros for groups without masks.
    pub masks: Array3<f32>,
    pub group: ClassGroup,
}

impl TrainBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// One held-out image.
#[derive(Debug, Clone)]
pub struct TestSample {
    /// `(1, 3, size, size)`.
    pub image: Array4<f32>,
    pub label: u8,
    /// `(size, size)` in {0, 1}.
    pub mask: Array2<f32>,
}

/// Batched training data, one class group per batch.
pub trait TrainSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batch(&self, index: usize) -> Result<TrainBatch, DataError>;

    /// Regroup and reorder batches before the next epoch.
    fn reshuffle(&mut self, rng: &mut StdRng);
}

/// Held-out evaluation data for the target class group.
pub trait TestSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sample(&self, index: usize) -> Result<TestSample, DataError>;
}

/// Copy an ndarray into a candle tensor of the same shape.
pub fn to_tensor<D: Dimension>(array: &Array<f32, D>, device: &Device) -> candle_core::Result<Tensor> {
    let standard = array.as_standard_layout();
    match standard.as_slice() {
        Some(values) => Tensor::from_slice(values, array.shape(), device),
        None => candle_core::bail!("array of shape {:?} is not contiguous", array.shape()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_tensor_preserves_layout() {
        let array = Array3::from_shape_fn((2, 3, 4), |(a, b, c)| (a * 100 + b * 10 + c) as f32);
        let tensor = to_tensor(&array, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[2, 3, 4]);
        let values = tensor.to_vec3::<f32>().unwrap();
        assert_eq!(values[1][2][3], 123.0);
    }

    #[test]
    fn test_to_tensor_handles_transposed_views() {
        let array = Array2::from_shape_vec((2, 3), vec![1f32, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap()
            .reversed_axes();
        let tensor = to_tensor(&array, &Device::Cpu).unwrap();
        assert_eq!(
            tensor.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 4.0], vec![2.0, 5.0], vec![3.0, 6.0]]
        );
    }
}
