//! # TensorStack Runtime
//!
//! Model runtime collaborator backed by `tract` (pure Rust ONNX):
//! - [`OnnxSession`] load / async load / unload / run
//! - [`NamedTensors`] exchanged with graphs in declaration order
//! - Execution provider selection via [`InferenceConfig`]

mod config;
mod error;
mod session;
mod tensors;

pub use config::{ExecutionProvider, InferenceConfig, MemoryMode, available_providers};
pub use error::{RuntimeError, RuntimeResult};
pub use session::{ModelSession, OnnxSession};
pub use tensors::{DataType, ModelMetadata, NamedTensors, TensorInfo, TensorValue};
