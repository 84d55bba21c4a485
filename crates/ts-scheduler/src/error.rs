//! Error types for scheduler operations

use thiserror::Error;
use ts_core::CoreError;

/// Scheduler error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Stepped, scaled or sampled before `initialize`
    #[error("Scheduler used before initialize()")]
    NotInitialized,

    /// Strength outside (0, 1]
    #[error("Strength must be in (0, 1], got {0}")]
    InvalidStrength(f32),

    /// Option record rejected by validation
    #[error("Invalid scheduler option: {0}")]
    InvalidOptions(String),

    /// Timestep passed to a step does not match the schedule position
    #[error("Timestep {got} does not match step {step} of the schedule (expected {expected})")]
    TimestepMismatch { step: usize, expected: f32, got: f32 },

    /// Stepped past the end of the schedule
    #[error("Step {step} out of range (schedule has {total} steps)")]
    StepOutOfRange { step: usize, total: usize },

    /// Timestep is not part of the schedule
    #[error("Timestep {0} is not part of the schedule")]
    UnknownTimestep(f32),

    /// Name does not map to a scheduler
    #[error("Unknown scheduler: {0}")]
    UnknownScheduler(String),

    /// Option combination this scheduler cannot run
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Tensor error
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
