//! Error types for decoding

use thiserror::Error;
use ts_core::CoreError;

/// Decoding error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerateError {
    /// Cache read or updated before `initialize`
    #[error("KV cache used before initialize()")]
    CacheNotInitialized,

    /// Model output disagrees with the configured layout
    #[error("Configuration mismatch for {what}: expected {expected}, got {got}")]
    ConfigurationMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Invalid generate option: {0}")]
    InvalidOptions(String),

    /// Every candidate token was masked out
    #[error("No candidate tokens left after processing logits")]
    NoCandidates,

    /// Decoder collaborator failure
    #[error("Model error: {0}")]
    Model(String),

    /// Tokenizer collaborator failure
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(CoreError),
}

impl GenerateError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            GenerateError::Cancelled => true,
            GenerateError::Core(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

impl From<CoreError> for GenerateError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Cancelled => GenerateError::Cancelled,
            other => GenerateError::Core(other),
        }
    }
}

/// Result type for decoding operations
pub type GenerateResult<T> = Result<T, GenerateError>;
