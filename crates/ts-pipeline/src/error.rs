//! Error types for pipelines

use thiserror::Error;
use ts_core::CoreError;
use ts_generate::GenerateError;
use ts_runtime::RuntimeError;
use ts_scheduler::SchedulerError;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Requested mode needs a capability the models do not have
    #[error("Unsupported combination: {0}")]
    UnsupportedCombination(String),

    #[error("Invalid pipeline option: {0}")]
    InvalidOptions(String),

    /// Denoiser, encoder or autoencoder collaborator failure
    #[error("Model error: {0}")]
    Model(String),

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Generation error: {0}")]
    Generate(#[from] GenerateError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Core(CoreError),
}

impl PipelineError {
    /// True when the run stopped on a cancellation request
    pub fn is_cancelled(&self) -> bool {
        match self {
            PipelineError::Cancelled => true,
            PipelineError::Generate(e) => e.is_cancelled(),
            PipelineError::Scheduler(SchedulerError::Core(e)) => e.is_cancelled(),
            PipelineError::Core(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

impl From<CoreError> for PipelineError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Core(other),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
