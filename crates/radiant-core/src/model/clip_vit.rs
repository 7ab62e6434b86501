//! CLIP ViT image encoder as a frozen, block-addressable backbone.
//!
//! Loads the Hugging Face CLIP vision layout (`vision_model.*`) from a
//! safetensors file. Weights are memory-mapped as plain tensors, so nothing
//! here is ever seen by an optimizer.
//!
//! Weight names:
//! - embeddings.class_embedding, embeddings.patch_embedding.weight
//! - embeddings.position_embedding.weight (pretraining grid + 1 class slot)
//! - pre_layrnorm.{weight,bias}
//! - encoder.layers.{i}.self_attn.{q,k,v,out}_proj.{weight,bias}
//! - encoder.layers.{i}.layer_norm{1,2}.{weight,bias}
//! - encoder.layers.{i}.mlp.fc{1,2}.{weight,bias}

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{conv2d_no_bias, linear, Conv2d, Conv2dConfig, Init, Linear, Module, VarBuilder};

use crate::error::ModelError;

use super::backbone::{TransformerBlock, VisionBackbone};
use super::norm::{layer_norm, LayerNorm};
use super::resize::{resize_bilinear, Alignment};

/// The backbone weights filename inside `{model_dir}/{variant}/`.
pub const VISION_WEIGHTS_FILENAME: &str = "vision.safetensors";

/// Only used when weights are created rather than loaded.
const EMBEDDING_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.02,
};

/// Architecture hyperparameters of a CLIP vision tower.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipVitConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub patch_size: usize,
    /// Resolution the positional embeddings were trained at.
    pub pretrained_image_size: usize,
    /// Joint embedding dimension of the matching text tower.
    pub text_dim: usize,
    pub layer_norm_eps: f64,
}

impl ClipVitConfig {
    /// ViT-L/14 at 336px (OpenAI weights).
    pub fn vit_l_14_336() -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 4096,
            num_heads: 16,
            num_layers: 24,
            patch_size: 14,
            pretrained_image_size: 336,
            text_dim: 768,
            layer_norm_eps: 1e-5,
        }
    }

    /// ViT-B/16 at 224px (OpenAI weights).
    pub fn vit_b_16() -> Self {
        Self {
            hidden_size: 768,
            intermediate_size: 3072,
            num_heads: 12,
            num_layers: 12,
            patch_size: 16,
            pretrained_image_size: 224,
            text_dim: 512,
            layer_norm_eps: 1e-5,
        }
    }

    /// Resolve a variant name from the config file.
    pub fn for_variant(name: &str) -> std::result::Result<Self, ModelError> {
        match name {
            "ViT-L-14-336" => Ok(Self::vit_l_14_336()),
            "ViT-B-16" => Ok(Self::vit_b_16()),
            other => Err(ModelError::UnknownBackbone(other.to_string())),
        }
    }
}

/// `x * sigmoid(1.702 x)`, built from primitive ops so it stays differentiable.
fn quick_gelu(xs: &Tensor) -> Result<Tensor> {
    let gate = (xs.affine(-1.702, 0.0)?.exp()? + 1.0)?.recip()?;
    xs * gate
}

struct ClipAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl ClipAttention {
    fn new(cfg: &ClipVitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.hidden_size;
        let head_dim = dim / cfg.num_heads;
        Ok(Self {
            q_proj: linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: linear(dim, dim, vb.pp("out_proj"))?,
            num_heads: cfg.num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        xs.reshape((batch, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq, dim) = xs.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(xs)?.affine(self.scale, 0.0)?, batch, seq)?;
        let k = self.split_heads(&self.k_proj.forward(xs)?, batch, seq)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?, batch, seq)?;

        let attn = q.matmul(&k.t()?.contiguous()?)?;
        let attn = candle_nn::ops::softmax(&attn, D::Minus1)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, dim))?;
        self.out_proj.forward(&out)
    }
}

/// Pre-LN transformer block of the CLIP vision tower.
pub struct ClipEncoderLayer {
    self_attn: ClipAttention,
    layer_norm1: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    layer_norm2: LayerNorm,
}

impl ClipEncoderLayer {
    fn new(cfg: &ClipVitConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: ClipAttention::new(cfg, vb.pp("self_attn"))?,
            layer_norm1: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm1"))?,
            fc1: linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("mlp").pp("fc1"))?,
            fc2: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("mlp").pp("fc2"))?,
            layer_norm2: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm2"))?,
        })
    }
}

impl TransformerBlock for ClipEncoderLayer {
    fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let residual = tokens;
        let xs = self.self_attn.forward(&self.layer_norm1.forward(tokens)?)?;
        let xs = (residual + xs)?;
        let residual = &xs;
        let hidden = quick_gelu(&self.fc1.forward(&self.layer_norm2.forward(&xs)?)?)?;
        residual + self.fc2.forward(&hidden)?
    }
}

/// CLIP vision tower resized to a target input resolution.
pub struct ClipVisionTransformer {
    config: ClipVitConfig,
    patch_embedding: Conv2d,
    class_embedding: Tensor,
    /// `(1 + grid², hidden)`, already resized to the target grid.
    position_embedding: Tensor,
    pre_layernorm: LayerNorm,
    blocks: Vec<Box<dyn TransformerBlock>>,
    grid_size: usize,
}

impl ClipVisionTransformer {
    /// Build from a `VarBuilder` rooted at the vision model (`vision_model`).
    pub fn new(config: ClipVitConfig, image_size: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let embeddings = vb.pp("embeddings");
        let patch_embedding = conv2d_no_bias(
            3,
            hidden,
            config.patch_size,
            Conv2dConfig {
                stride: config.patch_size,
                ..Default::default()
            },
            embeddings.pp("patch_embedding"),
        )?;
        let class_embedding = embeddings.get_with_hints(hidden, "class_embedding", EMBEDDING_INIT)?;

        let pretrained_grid = config.pretrained_image_size / config.patch_size;
        let position_embedding = embeddings
            .pp("position_embedding")
            .get_with_hints((pretrained_grid * pretrained_grid + 1, hidden), "weight", EMBEDDING_INIT)?;
        let grid_size = image_size / config.patch_size;
        let position_embedding =
            resize_position_embedding(&position_embedding, pretrained_grid, grid_size)?;

        let pre_layernorm = layer_norm(hidden, config.layer_norm_eps, vb.pp("pre_layrnorm"))?;

        let layers = vb.pp("encoder").pp("layers");
        let blocks = (0..config.num_layers)
            .map(|i| {
                ClipEncoderLayer::new(&config, layers.pp(i.to_string()))
                    .map(|layer| Box::new(layer) as Box<dyn TransformerBlock>)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            patch_embedding,
            class_embedding,
            position_embedding,
            pre_layernorm,
            blocks,
            grid_size,
        })
    }

    /// Load frozen weights from `{backbone_dir}/vision.safetensors`.
    pub fn load(
        config: ClipVitConfig,
        image_size: usize,
        backbone_dir: &Path,
        device: &Device,
    ) -> std::result::Result<Self, ModelError> {
        let path = Self::weights_path(backbone_dir);
        if !path.exists() {
            return Err(ModelError::Load {
                path,
                message: "Backbone weights not found".to_string(),
            });
        }

        tracing::info!("Loading CLIP vision backbone from {:?}", path);
        // SAFETY: the weights file is treated as read-only for the lifetime of
        // the mapping.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&path], DType::F32, device) }
            .map_err(|e| ModelError::Load {
                path: path.clone(),
                message: e.to_string(),
            })?;
        let model = Self::new(config, image_size, vb.pp("vision_model")).map_err(|e| {
            ModelError::Load {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;
        tracing::info!(
            "Backbone ready: {} blocks, hidden {}, {}x{} patch grid",
            model.blocks.len(),
            model.config.hidden_size,
            model.grid_size,
            model.grid_size
        );
        Ok(model)
    }

    pub fn weights_path(backbone_dir: &Path) -> PathBuf {
        backbone_dir.join(VISION_WEIGHTS_FILENAME)
    }

    pub fn config(&self) -> &ClipVitConfig {
        &self.config
    }
}

/// Resize the positional grid (class slot untouched) from `from`² to `to`².
fn resize_position_embedding(pos: &Tensor, from: usize, to: usize) -> Result<Tensor> {
    if from == to {
        return Ok(pos.clone());
    }
    let hidden = pos.dim(1)?;
    let class_pos = pos.narrow(0, 0, 1)?;
    let grid = pos
        .narrow(0, 1, from * from)?
        .t()?
        .reshape((hidden, from, from))?;
    let grid = resize_bilinear(&grid, to, to, Alignment::Centers)?
        .reshape((hidden, to * to))?
        .t()?;
    Tensor::cat(&[&class_pos, &grid], 0)
}

impl VisionBackbone for ClipVisionTransformer {
    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn grid_size(&self) -> usize {
        self.grid_size
    }

    fn text_dim(&self) -> usize {
        self.config.text_dim
    }

    fn embed(&self, pixels: &Tensor) -> Result<Tensor> {
        let patches = self.patch_embedding.forward(pixels)?;
        let (batch, hidden, _, _) = patches.dims4()?;
        let patches = patches.flatten_from(2)?.transpose(1, 2)?;
        let class_token = self
            .class_embedding
            .reshape((1, 1, hidden))?
            .broadcast_as((batch, 1, hidden))?;
        let tokens = Tensor::cat(&[&class_token, &patches], 1)?;
        let tokens = tokens.broadcast_add(&self.position_embedding)?;
        self.pre_layernorm.forward(&tokens)
    }

    fn blocks(&self) -> &[Box<dyn TransformerBlock>] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_backbone, tiny_vit_config};

    #[test]
    fn test_variant_lookup() {
        assert_eq!(
            ClipVitConfig::for_variant("ViT-L-14-336").unwrap().num_layers,
            24
        );
        assert_eq!(ClipVitConfig::for_variant("ViT-B-16").unwrap().text_dim, 512);
        assert!(matches!(
            ClipVitConfig::for_variant("ViT-H-14"),
            Err(ModelError::UnknownBackbone(_))
        ));
    }

    #[test]
    fn test_embed_shape_with_resized_positions() {
        // Pretrained at 16px (4x4 grid), run at 24px (6x6 grid).
        let backbone = tiny_backbone(24);
        let pixels = Tensor::randn(0f32, 1.0, (2, 3, 24, 24), &Device::Cpu).unwrap();
        let tokens = backbone.embed(&pixels).unwrap();
        assert_eq!(tokens.dims(), &[2, 37, tiny_vit_config().hidden_size]);
        assert_eq!(backbone.grid_size(), 6);
    }

    #[test]
    fn test_blocks_preserve_token_shape() {
        let backbone = tiny_backbone(16);
        let pixels = Tensor::randn(0f32, 1.0, (1, 3, 16, 16), &Device::Cpu).unwrap();
        let mut tokens = backbone.embed(&pixels).unwrap();
        for block in backbone.blocks() {
            tokens = block.forward(&tokens).unwrap();
        }
        assert_eq!(tokens.dims(), &[1, 17, tiny_vit_config().hidden_size]);
        assert_eq!(backbone.block_count(), tiny_vit_config().num_layers);
    }

    #[test]
    fn test_quick_gelu_matches_closed_form() {
        let xs = Tensor::new(&[-1f32, 0.0, 2.0], &Device::Cpu).unwrap();
        let ys = quick_gelu(&xs).unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in [-1f32, 0.0, 2.0].iter().zip(ys) {
            let expected = x / (1.0 + (-1.702 * x).exp());
            assert!((y - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_missing_weights_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result = ClipVisionTransformer::load(tiny_vit_config(), 16, dir.path(), &Device::Cpu);
        assert!(matches!(result, Err(ModelError::Load { .. })));
    }
}
