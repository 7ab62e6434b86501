//! Cross-modal decoder: contextualizes the segmentation stream of one depth and
//! scores every patch against the projected normal/abnormal text embeddings.

use candle_core::{bail, Result, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::math::l2_normalize_last;

use super::norm::{layer_norm, LayerNorm};

/// Temperature applied to patch/text cosine similarities.
pub const LOGIT_SCALE: f64 = 100.0;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Multi-head self-attention with biased input and output projections.
struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(width: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || width % num_heads != 0 {
            bail!("decoder width {width} is not divisible into {num_heads} heads");
        }
        Ok(Self {
            q_proj: linear(width, width, vb.pp("q_proj"))?,
            k_proj: linear(width, width, vb.pp("k_proj"))?,
            v_proj: linear(width, width, vb.pp("v_proj"))?,
            out_proj: linear(width, width, vb.pp("out_proj"))?,
            num_heads,
            head_dim: width / num_heads,
        })
    }

    fn heads(&self, xs: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        xs.reshape((batch, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq, width) = xs.dims3()?;
        let q = self.heads(&self.q_proj.forward(xs)?, batch, seq)?;
        let k = self.heads(&self.k_proj.forward(xs)?, batch, seq)?;
        let v = self.heads(&self.v_proj.forward(xs)?, batch, seq)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, width))?;
        self.out_proj.forward(&out)
    }
}

/// Post-norm transformer encoder layer with a ReLU feed-forward.
///
/// Runs in inference form: there is no dropout anywhere in the decoder.
pub struct FusionBlock {
    self_attn: SelfAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl FusionBlock {
    pub fn new(width: usize, num_heads: usize, ff_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: SelfAttention::new(width, num_heads, vb.pp("self_attn"))?,
            linear1: linear(width, ff_dim, vb.pp("linear1"))?,
            linear2: linear(ff_dim, width, vb.pp("linear2"))?,
            norm1: layer_norm(width, LAYER_NORM_EPS, vb.pp("norm1"))?,
            norm2: layer_norm(width, LAYER_NORM_EPS, vb.pp("norm2"))?,
        })
    }

    /// `(batch, tokens, width)` → same shape.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.norm1.forward(&(xs + self.self_attn.forward(xs)?)?)?;
        let ff = self.linear2.forward(&self.linear1.forward(&xs)?.relu()?)?;
        self.norm2.forward(&(xs + ff)?)
    }
}

/// Per-depth fusion blocks plus a text projection shared by every depth.
pub struct CrossModalDecoder {
    text_proj: Linear,
    blocks: Vec<FusionBlock>,
    text_dim: usize,
    width: usize,
}

impl CrossModalDecoder {
    /// `decoder_vb` holds the fusion blocks (`{i}.…`); `text_proj_vb` holds
    /// the `(width, text_dim)` projection.
    pub fn new(
        text_dim: usize,
        width: usize,
        num_heads: usize,
        ff_dim: usize,
        depth_count: usize,
        decoder_vb: VarBuilder,
        text_proj_vb: VarBuilder,
    ) -> Result<Self> {
        let text_proj = linear(text_dim, width, text_proj_vb)?;
        let blocks = (0..depth_count)
            .map(|i| FusionBlock::new(width, num_heads, ff_dim, decoder_vb.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            text_proj,
            blocks,
            text_dim,
            width,
        })
    }

    pub fn depth_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Project a `(text_dim, 2)` class table into the decoder width: `(width, 2)`.
    pub fn project_text(&self, text: &Tensor) -> Result<Tensor> {
        let (rows, cols) = text.dims2()?;
        if rows != self.text_dim || cols != 2 {
            bail!(
                "text table must be ({}, 2), got ({rows}, {cols})",
                self.text_dim
            );
        }
        self.text_proj.forward(&text.t()?.contiguous()?)?.t()
    }

    /// Decode the fused tokens of tap `ith`.
    ///
    /// `tokens` is `(batch, N, width)` with the class token first. Returns the
    /// contextualized tokens `(batch, N, width)` and the unnormalized
    /// similarity map `(batch, N − 1, 2)`.
    pub fn decode(&self, tokens: &Tensor, text: &Tensor, ith: usize) -> Result<(Tensor, Tensor)> {
        let Some(block) = self.blocks.get(ith) else {
            bail!("decoder has {} blocks, asked for block {ith}", self.blocks.len());
        };
        let width = tokens.dim(D::Minus1)?;
        if width != self.width {
            bail!("decoder expects width {}, got {width}", self.width);
        }

        let text = self.project_text(text)?;
        let xs = block.forward(tokens)?;

        let seq = xs.dim(1)?;
        let patches = l2_normalize_last(&xs.narrow(1, 1, seq - 1)?)?;
        let map = (patches.broadcast_matmul(&text)? * LOGIT_SCALE)?;
        Ok((xs, map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    const TEXT_DIM: usize = 16;
    const WIDTH: usize = 8;

    fn decoder(depths: usize) -> (VarMap, VarMap, CrossModalDecoder) {
        let blocks = VarMap::new();
        let proj = VarMap::new();
        let decoder = CrossModalDecoder::new(
            TEXT_DIM,
            WIDTH,
            2,
            32,
            depths,
            VarBuilder::from_varmap(&blocks, DType::F32, &Device::Cpu),
            VarBuilder::from_varmap(&proj, DType::F32, &Device::Cpu),
        )
        .unwrap();
        (blocks, proj, decoder)
    }

    fn text_table() -> Tensor {
        Tensor::randn(0f32, 1.0, (TEXT_DIM, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_map_has_one_row_per_patch() {
        let (_b, _p, decoder) = decoder(2);
        let tokens = Tensor::randn(0f32, 1.0, (1, 10, WIDTH), &Device::Cpu).unwrap();
        let (xs, map) = decoder.decode(&tokens, &text_table(), 1).unwrap();
        assert_eq!(xs.dims(), &[1, 10, WIDTH]);
        assert_eq!(map.dims(), &[1, 9, 2]);
    }

    #[test]
    fn test_channel_probabilities_sum_to_one() {
        let (_b, _p, decoder) = decoder(1);
        let tokens = Tensor::randn(0f32, 1.0, (2, 5, WIDTH), &Device::Cpu).unwrap();
        let (_xs, map) = decoder.decode(&tokens, &text_table(), 0).unwrap();
        let probs = candle_nn::ops::softmax(&map, D::Minus1).unwrap();
        let sums = probs.sum(D::Minus1).unwrap().flatten_all().unwrap();
        for s in sums.to_vec1::<f32>().unwrap() {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_scores_are_bounded_by_projected_text_norm() {
        let (_b, _p, decoder) = decoder(1);
        let text = text_table();
        let tokens = Tensor::randn(0f32, 1.0, (1, 7, WIDTH), &Device::Cpu).unwrap();
        let (_xs, map) = decoder.decode(&tokens, &text, 0).unwrap();
        let norms = decoder
            .project_text(&text)
            .unwrap()
            .sqr()
            .unwrap()
            .sum(0)
            .unwrap()
            .sqrt()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for row in map.squeeze(0).unwrap().to_vec2::<f32>().unwrap() {
            for (value, norm) in row.iter().zip(&norms) {
                assert!(value.abs() <= 100.0 * norm + 1e-3);
            }
        }
    }

    #[test]
    fn test_invalid_inputs_are_errors() {
        let (_b, _p, decoder) = decoder(2);
        let tokens = Tensor::randn(0f32, 1.0, (1, 5, WIDTH), &Device::Cpu).unwrap();
        assert!(decoder.decode(&tokens, &text_table(), 2).is_err());

        let wrong_text = Tensor::zeros((TEXT_DIM + 1, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(decoder.decode(&tokens, &wrong_text, 0).is_err());

        let wrong_width = Tensor::zeros((1, 5, WIDTH + 1), DType::F32, &Device::Cpu).unwrap();
        assert!(decoder.decode(&wrong_width, &text_table(), 0).is_err());
    }

    #[test]
    fn test_every_decoder_parameter_receives_gradient() {
        let (blocks, proj, decoder) = decoder(1);
        let tokens = Tensor::randn(0f32, 1.0, (2, 5, WIDTH), &Device::Cpu).unwrap();
        let (_xs, map) = decoder.decode(&tokens, &text_table(), 0).unwrap();
        let grads = map.sum_all().unwrap().backward().unwrap();

        let data = blocks.data().lock().unwrap();
        for (name, var) in data.iter() {
            assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
        }
        for var in proj.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_parameter_layout() {
        let (blocks, proj, _decoder) = decoder(2);
        let proj = proj.data().lock().unwrap();
        assert_eq!(proj["weight"].as_tensor().dims(), &[WIDTH, TEXT_DIM]);
        assert_eq!(proj["bias"].as_tensor().dims(), &[WIDTH]);
        let blocks = blocks.data().lock().unwrap();
        assert!(blocks.contains_key("0.self_attn.q_proj.weight"));
        assert!(blocks.contains_key("1.norm2.bias"));
        assert_eq!(blocks["1.linear1.weight"].as_tensor().dims(), &[32, WIDTH]);
    }
}
