//! # TensorStack Core
//!
//! Shared substrate for the scheduler, decoding and pipeline crates:
//! - Dense row-major [`Tensor`] with in-place and copying arithmetic
//! - [`CoreError`] / [`CoreResult`]
//! - Progress records and sinks
//! - Cooperative [`CancellationToken`]

mod cancel;
mod error;
mod progress;
mod tensor;

pub use cancel::CancellationToken;
pub use error::{CoreError, CoreResult};
pub use progress::{ChannelProgress, NullProgress, ProgressRecord, ProgressSink, RunTimer};
pub use tensor::{Tensor, argmax, log_softmax, row_major_strides, softmax};
