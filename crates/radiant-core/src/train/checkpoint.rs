//! Checkpoints of the four trainable components.
//!
//! One safetensors file per held-out class group. Tensor names carry their
//! component prefix (`seg_adapters.0.fc1.weight`, `text_proj.bias`, …). The
//! file is written next to its destination and renamed over it, so a reader
//! never observes a partial checkpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::error::ModelError;
use crate::model::{Component, ComponentParams};

fn checkpoint_error(path: &Path, message: impl ToString) -> ModelError {
    ModelError::Checkpoint {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Write every trainable parameter to `path`, replacing any previous file.
pub fn save(params: &ComponentParams, path: &Path) -> Result<(), ModelError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| checkpoint_error(path, e))?;
    }

    let tensors: HashMap<String, _> = params.named_tensors().into_iter().collect();
    let tmp = temp_path(path);
    candle_core::safetensors::save(&tensors, &tmp).map_err(|e| checkpoint_error(path, e))?;
    std::fs::rename(&tmp, path).map_err(|e| checkpoint_error(path, e))?;

    tracing::info!("Saved checkpoint ({} tensors) to {:?}", tensors.len(), path);
    Ok(())
}

/// Overwrite the trainable parameters with the contents of `path`.
///
/// Every parameter must be present with a matching shape. The whole file is
/// checked before the first parameter is written, so a rejected checkpoint
/// leaves the model untouched.
pub fn restore(params: &ComponentParams, path: &Path, device: &Device) -> Result<(), ModelError> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|e| checkpoint_error(path, e))?;

    let mut updates = Vec::new();
    for component in Component::ALL {
        for (name, var) in params.named_vars(component) {
            let tensor = tensors
                .get(&name)
                .ok_or_else(|| checkpoint_error(path, format!("missing tensor {name}")))?;
            if tensor.shape() != var.shape() {
                return Err(checkpoint_error(
                    path,
                    format!(
                        "tensor {name} has shape {:?}, model expects {:?}",
                        tensor.shape(),
                        var.shape()
                    ),
                ));
            }
            let dtype = var.dtype();
            updates.push((var, tensor.to_dtype(dtype)?));
        }
    }

    for (var, tensor) in &updates {
        var.set(tensor)?;
    }

    tracing::info!("Restored checkpoint ({} tensors) from {:?}", updates.len(), path);
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
