//! # TensorStack Generate
//!
//! Autoregressive decoding core:
//! - [`KvCache`] variants for decoder-only and encoder-decoder models
//! - [`Sequence`] state machine owning one cache per candidate
//! - Logits and token processors
//! - Seeded [`Sampler`] (temperature, top-K, top-P)
//! - Greedy and beam [`Search`]
//!
//! The decoder and tokenizer are collaborators behind [`DecoderModel`] and
//! [`Tokenizer`].

mod comparer;
mod error;
mod kv_cache;
mod model;
mod options;
mod processors;
mod sampler;
mod search;
mod sequence;

pub use comparer::SequenceComparer;
pub use error::{GenerateError, GenerateResult};
pub use kv_cache::{DecoderKvCache, EncoderDecoderKvCache, KvCache};
pub use model::{
    DecoderConfig, DecoderInput, DecoderModel, DecoderOutput, EncodedText, Tokenizer,
};
pub use options::{EarlyStopping, GenerateOptions};
pub use processors::{
    EosTokenProcessor, LogitsProcessor, MaxLengthTokenProcessor, MinLengthProcessor,
    NoRepeatNGramProcessor, SuppressTokensProcessor, TokenProcessor,
};
pub use sampler::{Sampler, SamplingParams, candidate_distribution, top_k};
pub use search::{GeneratedSequence, Search, SearchContext};
pub use sequence::{Sequence, SequenceState};
