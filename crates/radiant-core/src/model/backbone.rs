//! Interface to the frozen vision backbone.
//!
//! The router never inherits from or reaches into a concrete model. It sees an
//! embedding stage and an ordered collection of blocks it can run one at a
//! time, which is all that tapping requires.

use candle_core::{Result, Tensor};

/// One transformer block of the frozen backbone.
///
/// Tokens are batch-first: `(batch, tokens, hidden)`.
pub trait TransformerBlock: Send + Sync {
    fn forward(&self, tokens: &Tensor) -> Result<Tensor>;
}

/// A frozen ViT-style image encoder.
pub trait VisionBackbone: Send + Sync {
    /// Width of the residual stream.
    fn hidden_size(&self) -> usize;

    /// Side length of the square patch grid for the configured image size.
    fn grid_size(&self) -> usize;

    /// Dimension of the joint image-text embedding space.
    fn text_dim(&self) -> usize;

    /// Patch embedding, class-token prepend, positional embedding and
    /// pre-normalization. `(batch, 3, H, W)` → `(batch, 1 + grid², hidden)`.
    fn embed(&self, pixels: &Tensor) -> Result<Tensor>;

    /// Transformer blocks in depth order.
    fn blocks(&self) -> &[Box<dyn TransformerBlock>];

    fn block_count(&self) -> usize {
        self.blocks().len()
    }
}
