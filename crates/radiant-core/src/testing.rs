//! Shared fixtures for unit tests: a tiny randomly initialized CLIP tower,
//! a deterministic text encoder and in-memory datasets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use ndarray::{s, Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::class_group::ClassGroup;
use crate::config::ModelConfig;
use crate::data::{TestSample, TestSource, TrainBatch, TrainSource};
use crate::error::{DataError, TextError};
use crate::math::l2_normalize_in_place;
use crate::model::{AnomalyModel, ClipVisionTransformer, ClipVitConfig, VisionBackbone};
use crate::text::TextEncoder;

/// Image side used by most model tests: a 4×4 patch grid.
pub const TINY_IMAGE: usize = 16;

pub fn tiny_vit_config() -> ClipVitConfig {
    ClipVitConfig {
        hidden_size: 32,
        intermediate_size: 64,
        num_heads: 4,
        num_layers: 4,
        patch_size: 4,
        pretrained_image_size: 16,
        text_dim: 16,
        layer_norm_eps: 1e-5,
    }
}

pub fn tiny_backbone(image_size: usize) -> ClipVisionTransformer {
    tiny_backbone_with_varmap(image_size).0
}

/// Backbone plus the map holding its weights, for tests that inspect them.
pub fn tiny_backbone_with_varmap(image_size: usize) -> (ClipVisionTransformer, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let backbone = ClipVisionTransformer::new(tiny_vit_config(), image_size, vb.pp("vision_model"))
        .expect("tiny backbone");
    (backbone, varmap)
}

pub fn tiny_model_config() -> ModelConfig {
    ModelConfig {
        taps: vec![2, 4],
        seg_bottleneck: 8,
        det_bottleneck: 16,
        decoder_heads: 2,
        decoder_ff_dim: 32,
        carry_contextualized: true,
    }
}

pub fn tiny_model() -> AnomalyModel {
    tiny_model_with_backbone_vars().0
}

/// A tiny model whose trainable components are drawn from `seed`.
pub fn tiny_model_with_seed(seed: u64) -> AnomalyModel {
    tiny_model_seeded(seed).0
}

pub fn tiny_model_with_backbone_vars() -> (AnomalyModel, VarMap) {
    tiny_model_seeded(0)
}

fn tiny_model_seeded(seed: u64) -> (AnomalyModel, VarMap) {
    let (backbone, varmap) = tiny_backbone_with_varmap(TINY_IMAGE);
    let backbone: Arc<dyn VisionBackbone> = Arc::new(backbone);
    let model = AnomalyModel::new(
        backbone,
        &tiny_model_config(),
        &Device::Cpu,
        &mut StdRng::seed_from_u64(seed),
    )
    .expect("tiny model");
    (model, varmap)
}

/// A `(dim, 2)` text table with distinct unit columns.
pub fn text_table(dim: usize) -> Tensor {
    let mut normal: Vec<f32> = (0..dim).map(|i| (i as f32 * 0.7).cos()).collect();
    let mut abnormal: Vec<f32> = (0..dim).map(|i| (i as f32 * 1.3 + 0.5).sin()).collect();
    l2_normalize_in_place(&mut normal);
    l2_normalize_in_place(&mut abnormal);
    let rows = Tensor::from_vec([normal, abnormal].concat(), (2, dim), &Device::Cpu)
        .expect("text table");
    rows.t().and_then(|t| t.contiguous()).expect("text table")
}

/// Maps each prompt to a unit vector derived from its blake3 hash.
pub struct FakeTextEncoder {
    dim: usize,
    calls: AtomicUsize,
    fingerprint: String,
    salt: String,
}

impl FakeTextEncoder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            calls: AtomicUsize::new(0),
            fingerprint: String::new(),
            salt: String::new(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: &str) -> Self {
        self.fingerprint = fingerprint.to_string();
        self
    }

    /// Mixed into every hash, standing in for different weights.
    pub fn with_salt(mut self, salt: &str) -> Self {
        self.salt = salt.to_string();
        self
    }

    /// Number of `encode_batch` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextEncoder for FakeTextEncoder {
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TextError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|text| {
                let mut bytes = vec![0u8; self.dim];
                blake3::Hasher::new()
                    .update(self.salt.as_bytes())
                    .update(text.as_bytes())
                    .finalize_xof()
                    .fill(&mut bytes);
                let mut v: Vec<f32> = bytes.iter().map(|&b| b as f32 / 255.0 - 0.5).collect();
                l2_normalize_in_place(&mut v);
                v
            })
            .collect())
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn random_image(rng: &mut StdRng, size: usize) -> Array3<f32> {
    Array3::from_shape_fn((3, size, size), |_| rng.gen_range(-1.0f32..1.0))
}

/// Anomalous samples are masked over the upper-left quadrant.
fn anomaly_mask(size: usize) -> Array2<f32> {
    let mut mask = Array2::zeros((size, size));
    mask.slice_mut(s![..size / 2, ..size / 2]).fill(1.0);
    mask
}

/// Batches held in memory, one class group per batch.
pub struct InMemoryTrainSet {
    batches: Vec<TrainBatch>,
}

impl InMemoryTrainSet {
    /// A batch of `n` alternating normal/anomalous images.
    pub fn synthetic_batch(group: ClassGroup, n: usize, size: usize) -> TrainBatch {
        Self::batch_with_rng(group, n, size, &mut StdRng::seed_from_u64(group.index() as u64))
    }

    fn batch_with_rng(group: ClassGroup, n: usize, size: usize, rng: &mut StdRng) -> TrainBatch {
        let mut images = Array4::zeros((n, 3, size, size));
        let mut masks = Array3::zeros((n, size, size));
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let anomalous = i % 2 == 1;
            images.slice_mut(s![i, .., .., ..]).assign(&random_image(rng, size));
            if anomalous && group.has_pixel_masks() {
                masks.slice_mut(s![i, .., ..]).assign(&anomaly_mask(size));
            }
            labels.push(if anomalous { 1.0 } else { 0.0 });
        }
        TrainBatch {
            images,
            labels,
            masks,
            group,
        }
    }

    /// `batches_per_group` batches of `batch_size` images for each group.
    pub fn synthetic(
        groups: &[ClassGroup],
        batches_per_group: usize,
        batch_size: usize,
        size: usize,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(3);
        let batches = groups
            .iter()
            .flat_map(|&g| std::iter::repeat(g).take(batches_per_group))
            .map(|g| Self::batch_with_rng(g, batch_size, size, &mut rng))
            .collect();
        Self { batches }
    }
}

impl TrainSource for InMemoryTrainSet {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batch(&self, index: usize) -> Result<TrainBatch, DataError> {
        self.batches.get(index).cloned().ok_or(DataError::OutOfRange {
            index,
            len: self.batches.len(),
        })
    }

    fn reshuffle(&mut self, rng: &mut StdRng) {
        self.batches.shuffle(rng);
    }
}

/// Alternating normal/anomalous test images.
pub struct InMemoryTestSet {
    samples: Vec<TestSample>,
}

impl InMemoryTestSet {
    /// `n` images; with `with_masks` anomalous images carry a square mask.
    pub fn synthetic(n: usize, size: usize, with_masks: bool) -> Self {
        let mut rng = StdRng::seed_from_u64(11);
        let samples = (0..n)
            .map(|i| {
                let anomalous = i % 2 == 1;
                let image = random_image(&mut rng, size).insert_axis(ndarray::Axis(0));
                let mask = if anomalous && with_masks {
                    anomaly_mask(size)
                } else {
                    Array2::zeros((size, size))
                };
                TestSample {
                    image,
                    label: u8::from(anomalous),
                    mask,
                }
            })
            .collect();
        Self { samples }
    }
}

impl TestSource for InMemoryTestSet {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn sample(&self, index: usize) -> Result<TestSample, DataError> {
        self.samples.get(index).cloned().ok_or(DataError::OutOfRange {
            index,
            len: self.samples.len(),
        })
    }
}
