//! CLIP text encoder for prompt embeddings.
//!
//! Loads the CLIP text tower exported to ONNX together with its tokenizer and
//! encodes prompts into the joint image-text space of the vision backbone.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Value;

use crate::error::TextError;

/// CLIP context length.
pub const CONTEXT_LENGTH: usize = 77;

pub const TEXT_MODEL_FILENAME: &str = "text_model.onnx";
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// Anything that maps prompts to unit-norm embeddings.
pub trait TextEncoder: Send + Sync {
    /// One embedding per input text, in input order.
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TextError>;

    /// Embedding dimension.
    fn dim(&self) -> usize;

    /// Identifies the weights behind the embeddings. Cached embeddings are
    /// only reused while this stays the same.
    fn fingerprint(&self) -> &str {
        ""
    }
}

/// ONNX Runtime CLIP text tower.
///
/// `Session::run` requires `&mut self`, hence the mutex.
pub struct ClipTextEncoder {
    session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    uses_attention_mask: bool,
    embedding_dim: usize,
    fingerprint: String,
}

impl ClipTextEncoder {
    /// Load from `{model_dir}/text_model.onnx` and `{model_dir}/tokenizer.json`.
    pub fn new(model_dir: &Path, embedding_dim: usize) -> Result<Self, TextError> {
        let text_model_path = model_dir.join(TEXT_MODEL_FILENAME);
        let tokenizer_path = model_dir.join(TOKENIZER_FILENAME);

        if !text_model_path.exists() {
            return Err(TextError::Encoder {
                message: format!("Text encoder not found at {:?}", text_model_path),
            });
        }
        if !tokenizer_path.exists() {
            return Err(TextError::Encoder {
                message: format!("Tokenizer not found at {:?}", tokenizer_path),
            });
        }

        let session = Session::builder()
            .map_err(|e| TextError::Encoder {
                message: format!("Failed to create ONNX session builder: {e}"),
            })?
            .commit_from_file(&text_model_path)
            .map_err(|e| TextError::Encoder {
                message: format!("Failed to load text encoder model: {e}"),
            })?;

        let tokenizer =
            tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| TextError::Encoder {
                message: format!("Failed to load tokenizer: {e}"),
            })?;

        let uses_attention_mask = session
            .inputs()
            .iter()
            .any(|i| i.name() == "attention_mask");

        tracing::debug!(
            "Loaded CLIP text encoder (inputs: {:?}, outputs: {:?})",
            session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>()
        );

        let fingerprint = file_fingerprint(&[&text_model_path, &tokenizer_path])?;

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            uses_attention_mask,
            embedding_dim,
            fingerprint,
        })
    }

    /// Check whether the text encoder model files exist.
    pub fn model_exists(model_dir: &Path) -> bool {
        model_dir.join(TEXT_MODEL_FILENAME).exists() && model_dir.join(TOKENIZER_FILENAME).exists()
    }
}

/// blake3 over the name, size and modification time of each file.
fn file_fingerprint(paths: &[&Path]) -> Result<String, TextError> {
    let mut hasher = blake3::Hasher::new();
    for path in paths {
        let metadata = std::fs::metadata(path).map_err(|e| TextError::Encoder {
            message: format!("Failed to stat {:?}: {e}", path),
        })?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        hasher.update(path.file_name().map(|n| n.as_encoded_bytes()).unwrap_or_default());
        hasher.update(&metadata.len().to_le_bytes());
        hasher.update(&modified.to_le_bytes());
    }
    Ok(hasher.finalize().to_hex().to_string())
}

impl TextEncoder for ClipTextEncoder {
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TextError> {
        let batch_size = texts.len();
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| TextError::Encoder {
                message: format!("Tokenization failed: {e}"),
            })?;

        let mut input_ids = vec![0i64; batch_size * CONTEXT_LENGTH];
        let mut attention_mask = vec![0i64; batch_size * CONTEXT_LENGTH];
        for (i, encoding) in encodings.iter().enumerate() {
            for (j, &id) in encoding.get_ids().iter().take(CONTEXT_LENGTH).enumerate() {
                input_ids[i * CONTEXT_LENGTH + j] = id as i64;
                attention_mask[i * CONTEXT_LENGTH + j] = 1;
            }
        }

        let shape = vec![batch_size as i64, CONTEXT_LENGTH as i64];
        let to_value = |data: Vec<i64>| {
            Value::from_array((shape.clone(), data)).map_err(|e| TextError::Encoder {
                message: format!("Failed to create input tensor: {e}"),
            })
        };
        let input_ids_value = to_value(input_ids)?;

        let mut session = self.session.lock().map_err(|e| TextError::Encoder {
            message: format!("Text encoder lock poisoned: {e}"),
        })?;

        let outputs = if self.uses_attention_mask {
            let mask_value = to_value(attention_mask)?;
            session.run(ort::inputs![
                "input_ids" => input_ids_value,
                "attention_mask" => mask_value
            ])
        } else {
            session.run(ort::inputs!["input_ids" => input_ids_value])
        }
        .map_err(|e| TextError::Encoder {
            message: format!("Text encoder inference failed: {e}"),
        })?;

        // Projected embeddings; exports without a named projection output put
        // it first.
        let output = outputs
            .iter()
            .find(|(name, _)| *name == "text_embeds")
            .or_else(|| outputs.iter().next())
            .ok_or_else(|| TextError::Encoder {
                message: "Text encoder produced no outputs".to_string(),
            })?;

        let (_shape, data) = output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| TextError::Encoder {
                message: format!("Failed to extract text embeddings: {e}"),
            })?;

        let embeddings: Vec<Vec<f32>> = data
            .chunks(self.embedding_dim)
            .map(crate::math::l2_normalize)
            .collect();

        if embeddings.len() != batch_size {
            return Err(TextError::MissingEmbeddings {
                expected: batch_size,
                actual: embeddings.len(),
            });
        }
        Ok(embeddings)
    }

    fn dim(&self) -> usize {
        self.embedding_dim
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}
