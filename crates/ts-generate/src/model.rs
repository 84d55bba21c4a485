//! Decoder and tokenizer collaborator boundaries
//!
//! Decoder outputs arrive positionally as
//! `[logits, present.0.key, present.0.value, ..., (last_hidden_state)]`.
//! [`DecoderOutput`] maps that order onto named accessors once, so nothing
//! downstream indexes raw positions.

use ts_core::Tensor;

use crate::error::{GenerateError, GenerateResult};
use crate::kv_cache::{DecoderKvCache, EncoderDecoderKvCache, KvCache};

/// Shape of a decoder model's attention state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    /// Cross-attention key/value pairs follow each layer's self-attention pair
    pub is_encoder_decoder: bool,
    /// Model returns its last hidden state after the cache outputs
    pub has_hidden_state: bool,
}

impl DecoderConfig {
    /// Key/value tensors per layer
    pub fn slots_per_layer(&self) -> usize {
        if self.is_encoder_decoder { 4 } else { 2 }
    }

    /// Empty cache matching this layout
    pub fn create_cache(&self) -> Box<dyn KvCache> {
        if self.is_encoder_decoder {
            Box::new(EncoderDecoderKvCache::new(*self))
        } else {
            Box::new(DecoderKvCache::new(*self))
        }
    }
}

/// One decoder call
#[derive(Debug, Clone)]
pub struct DecoderInput<'a> {
    /// Whole sequence on the first pass, newest token afterwards
    pub input_ids: Vec<i64>,
    pub past_key_values: &'a [Tensor<f32>],
    /// Reuse cached attention state instead of recomputing the prefix
    pub use_branch_cache: bool,
    pub encoder_hidden_states: Option<&'a Tensor<f32>>,
}

/// Named view over a decoder's positional outputs
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    logits: Tensor<f32>,
    presents: Vec<Tensor<f32>>,
    last_hidden_state: Option<Tensor<f32>>,
    slots_per_layer: usize,
}

impl DecoderOutput {
    /// Split positional outputs according to `config`
    pub fn from_outputs(outputs: Vec<Tensor<f32>>, config: &DecoderConfig) -> GenerateResult<Self> {
        let slots_per_layer = config.slots_per_layer();
        let cache_len = config.num_layers * slots_per_layer;
        let expected = 1 + cache_len + usize::from(config.has_hidden_state);
        if outputs.len() != expected {
            return Err(GenerateError::ConfigurationMismatch {
                what: "decoder output count",
                expected,
                got: outputs.len(),
            });
        }

        let mut outputs = outputs.into_iter();
        let logits = outputs.next().ok_or(GenerateError::ConfigurationMismatch {
            what: "decoder output count",
            expected,
            got: 0,
        })?;
        let presents: Vec<Tensor<f32>> = outputs.by_ref().take(cache_len).collect();
        let last_hidden_state = outputs.next();

        let vocab = logits.dimensions().last().copied().unwrap_or(0);
        if logits.rank() != 3 || vocab != config.vocab_size {
            return Err(GenerateError::ConfigurationMismatch {
                what: "logits vocabulary",
                expected: config.vocab_size,
                got: vocab,
            });
        }

        Ok(Self {
            logits,
            presents,
            last_hidden_state,
            slots_per_layer,
        })
    }

    /// `[batch, sequence, vocab]`
    pub fn logits(&self) -> &Tensor<f32> {
        &self.logits
    }

    /// Logits at the last sequence position of the first batch item
    pub fn last_token_logits(&self) -> GenerateResult<&[f32]> {
        let sequence = self.logits.dimensions()[1];
        if sequence == 0 {
            return Err(GenerateError::Model("decoder returned empty logits".into()));
        }
        Ok(self.logits.row(&[0, sequence - 1])?)
    }

    /// Every cache output in layer order
    pub fn presents(&self) -> &[Tensor<f32>] {
        &self.presents
    }

    pub fn present_key(&self, layer: usize) -> Option<&Tensor<f32>> {
        self.presents.get(layer * self.slots_per_layer)
    }

    pub fn present_value(&self, layer: usize) -> Option<&Tensor<f32>> {
        self.presents.get(layer * self.slots_per_layer + 1)
    }

    pub fn encoder_key(&self, layer: usize) -> Option<&Tensor<f32>> {
        (self.slots_per_layer == 4)
            .then(|| self.presents.get(layer * 4 + 2))
            .flatten()
    }

    pub fn encoder_value(&self, layer: usize) -> Option<&Tensor<f32>> {
        (self.slots_per_layer == 4)
            .then(|| self.presents.get(layer * 4 + 3))
            .flatten()
    }

    pub fn last_hidden_state(&self) -> Option<&Tensor<f32>> {
        self.last_hidden_state.as_ref()
    }
}

/// Decoder model collaborator
pub trait DecoderModel {
    fn config(&self) -> &DecoderConfig;

    fn run_decoder(&self, input: &DecoderInput<'_>) -> GenerateResult<DecoderOutput>;

    /// Run several beams; implementations may batch them into one call
    fn run_decoder_batch(&self, inputs: &[DecoderInput<'_>]) -> GenerateResult<Vec<DecoderOutput>> {
        inputs.iter().map(|input| self.run_decoder(input)).collect()
    }
}

/// Token ids and mask for encoded text
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedText {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

/// Tokenizer collaborator
pub trait Tokenizer {
    fn encode(&self, text: &str) -> GenerateResult<EncodedText>;

    fn decode(&self, ids: &[i64], skip_special_tokens: bool) -> GenerateResult<String>;

    fn bos_token_id(&self) -> i64;

    fn eos_token_id(&self) -> i64;

    /// Ids of every special token (BOS, EOS, task and language markers)
    fn special_token_ids(&self) -> Vec<i64>;
}
