//! Device selection and seeding from an explicit [`RuntimeConfig`].
//!
//! Nothing here touches process-wide state: the chosen device and the seeded
//! RNG are handed to whoever constructs the model and the datasets.

use candle_core::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::RuntimeConfig;
use crate::error::ModelError;

/// Resolved execution context for one training or evaluation run.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub device: Device,
    pub seed: u64,
}

impl Runtime {
    /// Resolve the configured device and seed its RNG where the backend allows.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ModelError> {
        let device = match config.device.as_str() {
            "cpu" => Device::Cpu,
            "cuda" => Device::new_cuda(0)?,
            "metal" => Device::new_metal(0)?,
            _ => auto_device(),
        };

        // The CPU backend refuses explicit seeding. Trainable weights are drawn
        // from `rng()` on every backend, so this only matters for device-side
        // sampling.
        if let Err(e) = device.set_seed(config.seed) {
            tracing::debug!("Device RNG not seeded ({e})");
        }

        tracing::info!("Using device {:?} with seed {}", device, config.seed);
        Ok(Self {
            device,
            seed: config.seed,
        })
    }

    /// CPU runtime, used by tests and benches.
    pub fn cpu(seed: u64) -> Self {
        Self {
            device: Device::Cpu,
            seed,
        }
    }

    /// A fresh RNG derived from the run seed, for weight initialization and
    /// dataset shuffling.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }
}

fn auto_device() -> Device {
    if candle_core::utils::cuda_is_available() {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    if candle_core::utils::metal_is_available() {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    Device::Cpu
}
