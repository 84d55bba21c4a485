//! Error types shared by every TensorStack crate

use thiserror::Error;

/// Tensor and run-control errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Buffer length disagrees with the product of the dimensions
    #[error("Buffer length {got} does not match dimensions {dimensions:?} (expected {expected})")]
    BufferLength {
        dimensions: Vec<usize>,
        expected: usize,
        got: usize,
    },

    /// Two operands of an elementwise operation differ in shape
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Element index outside the tensor
    #[error("Index {index:?} out of bounds for dimensions {dimensions:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        dimensions: Vec<usize>,
    },

    /// Malformed dimensions for the requested operation
    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// Run was cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// True when the error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
