//! Error types for the model runtime

use thiserror::Error;
use ts_core::CoreError;

/// Model runtime error types
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Model file not found
    #[error("Model not found: {path}")]
    ModelNotFound { path: String },

    /// Parsing or optimizing the graph failed
    #[error("Failed to load model: {reason}")]
    ModelLoadFailed { reason: String },

    /// Inference requested on an unloaded session
    #[error("Model not loaded: {path}")]
    ModelNotLoaded { path: String },

    /// A graph input had no tensor supplied
    #[error("Missing input tensor: {0}")]
    MissingInput(String),

    /// Tensor element type the runtime cannot exchange
    #[error("Unsupported data type for {name}: {data_type}")]
    UnsupportedDataType { name: String, data_type: String },

    /// Tract error
    #[error("Tract error: {0}")]
    Tract(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

pub(crate) fn tract_error(error: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Tract(error.to_string())
}
