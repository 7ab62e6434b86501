//! Error types for Radiant.
//!
//! Errors are organized by concern (config, model, text, data, metrics) so that
//! messages carry the context an operator needs: file paths, tap depths,
//! expected vs. actual dimensions.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for Radiant operations.
#[derive(Error, Debug)]
pub enum RadiantError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Model construction or forward-pass errors
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Text encoder / prompt embedding errors
    #[error("Text error: {0}")]
    Text(#[from] TextError),

    /// Dataset errors
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    /// Evaluation metric errors
    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tensor backend errors surface as model errors; most of them are shape
/// violations detected by candle.
impl From<candle_core::Error> for RadiantError {
    fn from(e: candle_core::Error) -> Self {
        Self::Model(ModelError::Tensor(e))
    }
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Model construction and forward-pass errors.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Tensor backend failure (shape mismatch, device error, ...)
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Two components disagree on a feature dimension
    #[error("Dimension mismatch in {component}: expected {expected}, got {actual}")]
    DimensionMismatch {
        component: String,
        expected: usize,
        actual: usize,
    },

    /// A tap depth exceeds the backbone's block count
    #[error("Tap depth {depth} is beyond the backbone's {block_count} blocks")]
    TapOutOfRange { depth: usize, block_count: usize },

    /// Tap set is empty, unordered, or contains depth 0
    #[error("Invalid tap set {depths:?}: {reason}")]
    InvalidTapSet { depths: Vec<usize>, reason: String },

    /// Patch tokens cannot be laid out on a square grid
    #[error("Cannot reshape {patches} patch tokens into a square grid")]
    NonSquareGrid { patches: usize },

    /// Unknown backbone variant name
    #[error("Unknown backbone variant: {0}")]
    UnknownBackbone(String),

    /// Backbone weights could not be loaded
    #[error("Failed to load weights from {path}: {message}")]
    Load { path: PathBuf, message: String },

    /// Checkpoint could not be written or restored
    #[error("Checkpoint error for {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
}

/// Text encoder and prompt-ensemble errors.
#[derive(Error, Debug)]
pub enum TextError {
    /// Encoder model or tokenizer failed to load or run
    #[error("Text encoder error: {message}")]
    Encoder { message: String },

    /// Encoder returned fewer embeddings than prompts
    #[error("Text encoder returned {actual} embeddings for {expected} prompts")]
    MissingEmbeddings { expected: usize, actual: usize },

    /// Prompt vocabulary produced no prompts for a state
    #[error("Prompt ensemble for '{class_name}' is empty")]
    EmptyEnsemble { class_name: String },

    /// No text table was built for a class group
    #[error("No text table for class group {0}")]
    MissingTable(String),

    /// Cached text table is unreadable or stale
    #[error("Text cache error at {path}: {message}")]
    Cache { path: PathBuf, message: String },
}

/// Dataset loading errors.
#[derive(Error, Debug)]
pub enum DataError {
    /// Image or mask decoding failed
    #[error("Decode error for {path}: {message}")]
    Decode { path: PathBuf, message: String },

    /// Expected dataset split directory does not exist
    #[error("Dataset split not found: {0}")]
    MissingSplit(PathBuf),

    /// Dataset contains no samples
    #[error("Dataset '{name}' contains no images")]
    Empty { name: String },

    /// A pixel-supervised sample has no mask on disk
    #[error("Anomaly mask missing for {0}")]
    MissingMask(PathBuf),

    /// Unknown class group name
    #[error("Unknown class group: {0}")]
    UnknownClassGroup(String),

    /// Batch or sample index out of range
    #[error("Index {index} out of range for {len} entries")]
    OutOfRange { index: usize, len: usize },
}

/// Evaluation metric errors.
#[derive(Error, Debug)]
pub enum MetricError {
    /// No scores were provided
    #[error("Cannot compute {metric} on an empty score set")]
    Empty { metric: String },

    /// Scores and labels have different lengths
    #[error("Score/label length mismatch: {scores} scores vs {labels} labels")]
    LengthMismatch { scores: usize, labels: usize },

    /// ROC-AUC is undefined when only one class is present
    #[error("ROC-AUC undefined: ground truth contains only {present} samples")]
    SingleClass { present: String },
}

/// Convenience type alias for Radiant results.
pub type Result<T> = std::result::Result<T, RadiantError>;

/// Convenience type alias for model-specific results.
pub type ModelResult<T> = std::result::Result<T, ModelError>;
