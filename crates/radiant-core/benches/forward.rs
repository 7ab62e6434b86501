//! Benchmarks for the adapter-fused forward pass on a tiny random backbone.
//!
//! Run with: cargo bench -p radiant-core

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use radiant_core::config::ModelConfig;
use radiant_core::model::{AnomalyModel, ClipVisionTransformer, ClipVitConfig, VisionBackbone};
use radiant_core::train::segmentation_maps;

const IMAGE_SIZE: usize = 64;

fn small_model() -> AnomalyModel {
    let config = ClipVitConfig {
        hidden_size: 64,
        intermediate_size: 256,
        num_heads: 4,
        num_layers: 8,
        patch_size: 8,
        pretrained_image_size: IMAGE_SIZE,
        text_dim: 32,
        layer_norm_eps: 1e-5,
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let backbone: Arc<dyn VisionBackbone> = Arc::new(
        ClipVisionTransformer::new(config, IMAGE_SIZE, vb.pp("vision_model")).unwrap(),
    );
    let model_config = ModelConfig {
        taps: vec![2, 4, 6, 8],
        seg_bottleneck: 16,
        det_bottleneck: 32,
        decoder_heads: 4,
        decoder_ff_dim: 64,
        carry_contextualized: true,
    };
    AnomalyModel::new(backbone, &model_config, &Device::Cpu, &mut StdRng::seed_from_u64(0)).unwrap()
}

fn benchmark_router_forward(c: &mut Criterion) {
    let model = small_model();
    let pixels = Tensor::randn(0f32, 1.0, (1, 3, IMAGE_SIZE, IMAGE_SIZE), &Device::Cpu).unwrap();

    c.bench_function("router_forward_4_taps", |b| {
        b.iter(|| {
            let _ = model.forward(black_box(&pixels));
        })
    });
}

fn benchmark_decoder(c: &mut Criterion) {
    let model = small_model();
    let pixels = Tensor::randn(0f32, 1.0, (1, 3, IMAGE_SIZE, IMAGE_SIZE), &Device::Cpu).unwrap();
    let features = model.forward(&pixels).unwrap();
    let text = Tensor::randn(0f32, 1.0, (32, 2), &Device::Cpu).unwrap();

    c.bench_function("segmentation_maps_4_depths", |b| {
        b.iter(|| {
            let _ = segmentation_maps(
                &model,
                black_box(&features.seg),
                &text,
                IMAGE_SIZE,
                IMAGE_SIZE,
                true,
            );
        })
    });
}

criterion_group!(benches, benchmark_router_forward, benchmark_decoder);
criterion_main!(benches);
