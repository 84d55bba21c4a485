//! # TensorStack Pipelines
//!
//! End-to-end loops over model collaborators:
//! - [`DiffusionPipeline`]: text-to-image, image-to-image, image edit and
//!   control-net runs with classifier-free guidance
//! - [`TextGenerationPipeline`]: greedy or beam decoding of a prompt
//! - [`TranscriptionPipeline`]: chunked encoder-decoder transcription
//!
//! Models plug in through [`DenoiseModel`], [`AutoEncoder`], [`AudioEncoder`]
//! and `ts_generate`'s decoder/tokenizer traits; [`OnnxDenoiser`] and
//! [`OnnxDecoder`] adapt runtime sessions to them.

mod diffusion;
mod error;
mod generation;
mod onnx;
mod options;
mod progress;
mod transcription;

pub use diffusion::{
    AutoEncoder, DenoiseInput, DenoiseModel, DiffusionInput, DiffusionPipeline, DiffusionResult,
    PipelineState, PromptEmbeddings, apply_guidance,
};
pub use error::{PipelineError, PipelineResult};
pub use generation::{GeneratedText, TextGenerationPipeline};
pub use onnx::{OnnxDecoder, OnnxDenoiser};
pub use options::{DiffusionOptions, ProcessType};
pub use progress::ChunkedProgress;
pub use transcription::{
    AudioEncoder, TranscribedChunk, TranscriptionPipeline, TranscriptionResult,
};

pub use ts_runtime::MemoryMode;
