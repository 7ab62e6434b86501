//! Adapter-fused anomaly model.
//!
//! A frozen [`VisionBackbone`] is wrapped by a [`TapRouter`] (segmentation and
//! detection adapters per tapped depth) and a [`CrossModalDecoder`]. Trainable
//! parameters are split into four independent groups, one per [`Component`],
//! so that each gets its own optimizer state and checkpoint namespace.

pub mod adapter;
pub mod backbone;
pub mod clip_vit;
pub mod decoder;
pub mod norm;
pub mod resize;
pub mod router;

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;

use crate::config::ModelConfig;
use crate::error::{ModelError, ModelResult};

pub use adapter::Adapter;
pub use backbone::{TransformerBlock, VisionBackbone};
pub use clip_vit::{ClipVisionTransformer, ClipVitConfig};
pub use decoder::{CrossModalDecoder, FusionBlock, LOGIT_SCALE};
pub use router::{TapFeatures, TapOutput, TapRouter, TapSet};

/// A trainable parameter group. The backbone is never one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    SegAdapters,
    DetAdapters,
    Decoder,
    TextProj,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::SegAdapters,
        Component::DetAdapters,
        Component::Decoder,
        Component::TextProj,
    ];

    /// Parameter-name prefix inside checkpoints.
    pub fn name(self) -> &'static str {
        match self {
            Component::SegAdapters => "seg_adapters",
            Component::DetAdapters => "det_adapters",
            Component::Decoder => "decoder",
            Component::TextProj => "text_proj",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The four trainable parameter stores.
pub struct ComponentParams {
    seg_adapters: VarMap,
    det_adapters: VarMap,
    decoder: VarMap,
    text_proj: VarMap,
}

impl ComponentParams {
    pub fn new() -> Self {
        Self {
            seg_adapters: VarMap::new(),
            det_adapters: VarMap::new(),
            decoder: VarMap::new(),
            text_proj: VarMap::new(),
        }
    }

    pub fn varmap(&self, component: Component) -> &VarMap {
        match component {
            Component::SegAdapters => &self.seg_adapters,
            Component::DetAdapters => &self.det_adapters,
            Component::Decoder => &self.decoder,
            Component::TextProj => &self.text_proj,
        }
    }

    /// Variable builder whose names are prefixed with the component name.
    pub fn var_builder(&self, component: Component, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(self.varmap(component), DType::F32, device).pp(component.name())
    }

    pub fn vars(&self, component: Component) -> Vec<Var> {
        self.varmap(component).all_vars()
    }

    /// Number of scalar parameters in one component.
    pub fn parameter_count(&self, component: Component) -> usize {
        self.vars(component)
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Every variable of one component as `(name, var)`, sorted by name.
    pub fn named_vars(&self, component: Component) -> Vec<(String, Var)> {
        // Poisoning only happens if another thread panicked mid-update.
        let data = match self.varmap(component).data().lock() {
            Ok(data) => data,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<(String, Var)> =
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Snapshot of every parameter as `(name, tensor)`, names prefixed by component.
    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out: Vec<(String, Tensor)> = Component::ALL
            .into_iter()
            .flat_map(|component| self.named_vars(component))
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Redraw every randomly initialized parameter from `rng`.
    ///
    /// Linear weights are Kaiming-uniform over their fan-in and biases uniform
    /// in `±1/√fan_in`, the same distributions `candle_nn::linear` draws from.
    /// Layer-norm parameters keep their constant initialization. Variables are
    /// visited in name order so a seed always yields the same weights.
    pub fn initialize(&self, rng: &mut StdRng) -> candle_core::Result<()> {
        for component in Component::ALL {
            let vars = self.named_vars(component);
            let fan_in_of = |weight: &str| {
                vars.iter()
                    .find(|(name, _)| name == weight)
                    .and_then(|(_, var)| var.as_tensor().dims().get(1).copied())
            };
            for (name, var) in &vars {
                if is_norm_parameter(name) {
                    continue;
                }
                let dims = var.as_tensor().dims().to_vec();
                let bound = match dims.as_slice() {
                    [_, fan_in] => (3.0 / *fan_in as f32).sqrt(),
                    [_] => {
                        let weight = format!("{}.weight", name.trim_end_matches(".bias"));
                        match fan_in_of(&weight) {
                            Some(fan_in) => 1.0 / (fan_in as f32).sqrt(),
                            None => continue,
                        }
                    }
                    _ => continue,
                };
                let uniform = Uniform::new_inclusive(-bound, bound);
                let values: Vec<f32> = (0..var.as_tensor().elem_count())
                    .map(|_| uniform.sample(rng))
                    .collect();
                let tensor = Tensor::from_vec(values, dims, var.device())?
                    .to_dtype(var.dtype())?;
                var.set(&tensor)?;
            }
        }
        Ok(())
    }
}

impl Default for ComponentParams {
    fn default() -> Self {
        Self::new()
    }
}

fn is_norm_parameter(name: &str) -> bool {
    name.split('.').any(|part| part.starts_with("norm"))
}

/// Frozen backbone with trainable adapters, decoder and text projection.
pub struct AnomalyModel {
    router: TapRouter,
    decoder: CrossModalDecoder,
    params: ComponentParams,
    device: Device,
}

impl AnomalyModel {
    /// Build fresh trainable components around `backbone`, initialized from
    /// `rng`.
    ///
    /// The detection bottleneck is scored directly against text embeddings, so
    /// it must equal the backbone's text dimension.
    pub fn new(
        backbone: Arc<dyn VisionBackbone>,
        config: &ModelConfig,
        device: &Device,
        rng: &mut StdRng,
    ) -> ModelResult<Self> {
        let text_dim = backbone.text_dim();
        if config.det_bottleneck != text_dim {
            return Err(ModelError::DimensionMismatch {
                component: "det_adapters bottleneck vs text embedding".to_string(),
                expected: text_dim,
                actual: config.det_bottleneck,
            });
        }

        let taps = TapSet::new(config.taps.clone(), backbone.block_count())?;
        let params = ComponentParams::new();

        let router = TapRouter::new(
            backbone,
            taps,
            config.seg_bottleneck,
            config.det_bottleneck,
            params.var_builder(Component::SegAdapters, device),
            params.var_builder(Component::DetAdapters, device),
        )?;
        let decoder = CrossModalDecoder::new(
            text_dim,
            config.seg_bottleneck,
            config.decoder_heads,
            config.decoder_ff_dim,
            router.taps().len(),
            params.var_builder(Component::Decoder, device),
            params.var_builder(Component::TextProj, device),
        )?;
        params.initialize(rng)?;

        let model = Self {
            router,
            decoder,
            params,
            device: device.clone(),
        };
        for component in Component::ALL {
            tracing::info!(
                "{}: {} trainable parameters",
                component,
                model.params.parameter_count(component)
            );
        }
        Ok(model)
    }

    /// Run the backbone with adapters: one feature tensor per tap and task.
    pub fn forward(&self, pixels: &Tensor) -> ModelResult<TapFeatures> {
        Ok(self.router.forward(pixels)?)
    }

    /// Decode the fused segmentation tokens of tap `ith` against a class table.
    pub fn decode(&self, tokens: &Tensor, text: &Tensor, ith: usize) -> ModelResult<(Tensor, Tensor)> {
        Ok(self.decoder.decode(tokens, text, ith)?)
    }

    pub fn router(&self) -> &TapRouter {
        &self.router
    }

    pub fn decoder(&self) -> &CrossModalDecoder {
        &self.decoder
    }

    pub fn params(&self) -> &ComponentParams {
        &self.params
    }

    pub fn taps(&self) -> &TapSet {
        self.router.taps()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Side of the square patch grid.
    pub fn grid_size(&self) -> usize {
        self.router.backbone().grid_size()
    }
}
