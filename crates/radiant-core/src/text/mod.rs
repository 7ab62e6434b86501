//! Text side of the model: prompt ensembles encoded into per-class
//! normal/abnormal embedding tables.
//!
//! ```text
//! ClassGroup → prompt_name → states × templates → TextEncoder → mean → TextTable
//! ```

pub mod bank;
pub mod encoder;
pub mod prompt;

use candle_core::{Device, Tensor};

use crate::error::TextError;

pub use bank::TextBank;
pub use encoder::{ClipTextEncoder, TextEncoder};
pub use prompt::{build_table, expand_prompts};

/// Normal and abnormal class embeddings of one class group.
///
/// Both columns are unit-norm vectors in the joint image-text space.
#[derive(Debug, Clone, PartialEq)]
pub struct TextTable {
    normal: Vec<f32>,
    abnormal: Vec<f32>,
}

impl TextTable {
    pub fn new(normal: Vec<f32>, abnormal: Vec<f32>) -> Result<Self, TextError> {
        if normal.len() != abnormal.len() {
            return Err(TextError::MissingEmbeddings {
                expected: normal.len(),
                actual: abnormal.len(),
            });
        }
        Ok(Self { normal, abnormal })
    }

    pub fn dim(&self) -> usize {
        self.normal.len()
    }

    pub fn normal(&self) -> &[f32] {
        &self.normal
    }

    pub fn abnormal(&self) -> &[f32] {
        &self.abnormal
    }

    /// `(dim, 2)` tensor; column 0 normal, column 1 abnormal.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let dim = self.dim();
        let columns = Tensor::from_slice(
            &[self.normal.as_slice(), self.abnormal.as_slice()].concat(),
            (2, dim),
            device,
        )?;
        columns.t()?.contiguous()
    }
}
