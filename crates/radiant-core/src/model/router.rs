//! Backbone tap router.
//!
//! Walks the frozen backbone one block at a time. After every tapped block the
//! token sequence goes through a segmentation adapter and a detection adapter;
//! their reconstructions are blended back into the patch tokens before the
//! next block runs, and their bottlenecks become that depth's features.

use std::sync::Arc;

use candle_core::{Result as TensorResult, Tensor};
use candle_nn::VarBuilder;

use crate::error::ModelError;

use super::adapter::Adapter;
use super::backbone::VisionBackbone;

/// Weight of the untouched patch tokens in the blend.
const RESIDUAL_WEIGHT: f64 = 0.8;
/// Weight of each adapter reconstruction in the blend.
const ADAPTER_WEIGHT: f64 = 0.1;

/// Ascending set of 1-indexed backbone depths to tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapSet {
    depths: Vec<usize>,
}

impl TapSet {
    /// Validate `depths` against a backbone with `block_count` blocks.
    pub fn new(depths: Vec<usize>, block_count: usize) -> Result<Self, ModelError> {
        if depths.is_empty() {
            return Err(ModelError::InvalidTapSet {
                depths,
                reason: "at least one depth is required".to_string(),
            });
        }
        if depths.contains(&0) {
            return Err(ModelError::InvalidTapSet {
                depths,
                reason: "depths are 1-indexed".to_string(),
            });
        }
        if depths.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ModelError::InvalidTapSet {
                depths,
                reason: "depths must be strictly ascending".to_string(),
            });
        }
        if let Some(&depth) = depths.iter().find(|&&d| d > block_count) {
            return Err(ModelError::TapOutOfRange { depth, block_count });
        }
        Ok(Self { depths })
    }

    pub fn depths(&self) -> &[usize] {
        &self.depths
    }

    pub fn len(&self) -> usize {
        self.depths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }

    /// Tap index of a 1-indexed depth, if it is tapped.
    pub fn position(&self, depth: usize) -> Option<usize> {
        self.depths.binary_search(&depth).ok()
    }

    /// Deepest tapped block; blocks past it never need to run.
    pub fn deepest(&self) -> usize {
        self.depths.last().copied().unwrap_or(0)
    }
}

/// Bottleneck outputs of one tapped depth, `(batch, tokens, bottleneck)`.
#[derive(Debug, Clone)]
pub struct TapOutput {
    pub seg: Tensor,
    pub det: Tensor,
}

/// Per-depth features in tap order, class token at position 0.
#[derive(Debug, Clone, Default)]
pub struct TapFeatures {
    pub seg: Vec<Tensor>,
    pub det: Vec<Tensor>,
}

impl TapFeatures {
    pub fn len(&self) -> usize {
        self.seg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seg.is_empty()
    }

    fn push(&mut self, tap: TapOutput) {
        self.seg.push(tap.seg);
        self.det.push(tap.det);
    }
}

/// Runs the frozen backbone with adapter pairs at the tapped depths.
pub struct TapRouter {
    backbone: Arc<dyn VisionBackbone>,
    taps: TapSet,
    seg_adapters: Vec<Adapter>,
    det_adapters: Vec<Adapter>,
}

impl TapRouter {
    /// Build one adapter pair per tap.
    ///
    /// Segmentation adapter `i` lives under `seg_vb.pp(i)`, detection adapter
    /// `i` under `det_vb.pp(i)`.
    pub fn new(
        backbone: Arc<dyn VisionBackbone>,
        taps: TapSet,
        seg_bottleneck: usize,
        det_bottleneck: usize,
        seg_vb: VarBuilder,
        det_vb: VarBuilder,
    ) -> Result<Self, ModelError> {
        let block_count = backbone.block_count();
        if taps.deepest() > block_count {
            return Err(ModelError::TapOutOfRange {
                depth: taps.deepest(),
                block_count,
            });
        }

        let hidden = backbone.hidden_size();
        let mut seg_adapters = Vec::with_capacity(taps.len());
        let mut det_adapters = Vec::with_capacity(taps.len());
        for i in 0..taps.len() {
            seg_adapters.push(Adapter::new(hidden, seg_bottleneck, seg_vb.pp(i.to_string()))?);
            det_adapters.push(Adapter::new(hidden, det_bottleneck, det_vb.pp(i.to_string()))?);
        }

        tracing::debug!(
            "Tap router: depths {:?} of {} blocks, bottlenecks seg={} det={}",
            taps.depths(),
            block_count,
            seg_bottleneck,
            det_bottleneck
        );

        Ok(Self {
            backbone,
            taps,
            seg_adapters,
            det_adapters,
        })
    }

    pub fn taps(&self) -> &TapSet {
        &self.taps
    }

    pub fn backbone(&self) -> &Arc<dyn VisionBackbone> {
        &self.backbone
    }

    /// Apply the adapters of `depth` to the tokens a block just produced.
    ///
    /// Untapped depths return the tokens unchanged and no features. At a tapped
    /// depth the patch tokens become
    /// `0.8·x + 0.1·seg_recon + 0.1·det_recon`; the class token is kept as is.
    pub fn apply_taps(&self, tokens: &Tensor, depth: usize) -> TensorResult<(Tensor, Option<TapOutput>)> {
        let Some(index) = self.taps.position(depth) else {
            return Ok((tokens.clone(), None));
        };

        let (seg_mid, seg_recon) = self.seg_adapters[index].forward(tokens)?;
        let (det_mid, det_recon) = self.det_adapters[index].forward(tokens)?;

        let seq_len = tokens.dim(1)?;
        let patches = |xs: &Tensor| xs.narrow(1, 1, seq_len - 1);
        let blended = ((patches(tokens)?.affine(RESIDUAL_WEIGHT, 0.0)?
            + patches(&seg_recon)?.affine(ADAPTER_WEIGHT, 0.0)?)?
            + patches(&det_recon)?.affine(ADAPTER_WEIGHT, 0.0)?)?;
        let class_token = tokens.narrow(1, 0, 1)?;
        let tokens = Tensor::cat(&[&class_token, &blended], 1)?;

        Ok((
            tokens,
            Some(TapOutput {
                seg: seg_mid,
                det: det_mid,
            }),
        ))
    }

    /// `(batch, 3, H, W)` pixels → one segmentation and one detection feature
    /// tensor per tap.
    pub fn forward(&self, pixels: &Tensor) -> TensorResult<TapFeatures> {
        let mut tokens = self.backbone.embed(pixels)?;
        let mut features = TapFeatures::default();
        let blocks = &self.backbone.blocks()[..self.taps.deepest()];
        for (i, block) in blocks.iter().enumerate() {
            tokens = block.forward(&tokens)?;
            let (next, tap) = self.apply_taps(&tokens, i + 1)?;
            tokens = next;
            if let Some(tap) = tap {
                features.push(tap);
            }
        }
        Ok(features)
    }
}
