//! One Adam optimizer per trainable component.
//!
//! The selected components are stepped against the same gradient snapshot
//! after a single backward pass. A component that received no gradient in that
//! pass is not stepped, so its moment estimates and bias correction stay
//! untouched.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::config::TrainingConfig;
use crate::model::{Component, ComponentParams};

/// Adam hyperparameters shared by all components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamSettings {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
}

impl AdamSettings {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
        }
    }

    /// Plain Adam: decoupled weight decay is disabled.
    fn params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

struct ComponentOptimizer {
    vars: Vec<Var>,
    optimizer: AdamW,
    steps: usize,
}

/// Optimizer state keyed by component.
pub struct ComponentOptimizers {
    optimizers: BTreeMap<Component, ComponentOptimizer>,
}

impl ComponentOptimizers {
    pub fn new(params: &ComponentParams, settings: AdamSettings) -> Result<Self> {
        let mut optimizers = BTreeMap::new();
        for component in Component::ALL {
            let vars = params.vars(component);
            let optimizer = AdamW::new(vars.clone(), settings.params())?;
            optimizers.insert(
                component,
                ComponentOptimizer {
                    vars,
                    optimizer,
                    steps: 0,
                },
            );
        }
        Ok(Self { optimizers })
    }

    /// Step each of `components` that has a gradient in `grads`.
    ///
    /// Returns the components that were stepped.
    pub fn step(&mut self, grads: &GradStore, components: &[Component]) -> Result<Vec<Component>> {
        let mut stepped = Vec::new();
        for (component, state) in self.optimizers.iter_mut() {
            if !components.contains(component) {
                continue;
            }
            let has_gradient = state.vars.iter().any(|v| grads.get(v.as_tensor()).is_some());
            if !has_gradient {
                continue;
            }
            state.optimizer.step(grads)?;
            state.steps += 1;
            stepped.push(*component);
        }
        Ok(stepped)
    }

    /// Number of updates applied to a component so far.
    pub fn steps(&self, component: Component) -> usize {
        self.optimizers.get(&component).map(|s| s.steps).unwrap_or(0)
    }

    pub fn learning_rate(&self, component: Component) -> Option<f64> {
        self.optimizers
            .get(&component)
            .map(|s| s.optimizer.learning_rate())
    }
}
