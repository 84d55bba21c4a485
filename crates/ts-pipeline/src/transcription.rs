//! Chunked speech-to-text over an encoder-decoder model
//!
//! Audio longer than `chunk_size` seconds is split into sequential chunks.
//! Every chunk runs the full encode and decode loop; texts are concatenated
//! and scores summed.

use std::sync::Arc;
use std::time::Duration;

use ts_core::{CancellationToken, ProgressSink, Tensor};
use ts_generate::{
    DecoderModel, GenerateError, GenerateOptions, Search, SearchContext, Sequence, Tokenizer,
};

use crate::error::{PipelineError, PipelineResult};
use crate::generation::run_search;
use crate::progress::ChunkedProgress;

/// Audio encoder collaborator (feature extraction included)
pub trait AudioEncoder: Send + Sync {
    /// Hidden states `[1, frames, hidden]` for mono samples
    fn encode(&self, samples: &[f32]) -> PipelineResult<Tensor<f32>>;
}

/// Decoded text of one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribedChunk {
    pub index: usize,
    /// Offset of the chunk in the input audio
    pub start: Duration,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranscriptionResult {
    pub text: String,
    /// Sum of the best sequence score of every chunk
    pub score: f32,
    pub chunks: Vec<TranscribedChunk>,
}

pub struct TranscriptionPipeline {
    encoder: Arc<dyn AudioEncoder>,
    decoder: Arc<dyn DecoderModel + Send + Sync>,
    tokenizer: Arc<dyn Tokenizer + Send + Sync>,
    sample_rate: u32,
    /// Decoder prompt (start of transcript, language, task); BOS when empty
    prompt_tokens: Vec<i64>,
    suppress_tokens: Vec<i64>,
}

impl TranscriptionPipeline {
    pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

    pub fn new(
        encoder: Arc<dyn AudioEncoder>,
        decoder: Arc<dyn DecoderModel + Send + Sync>,
        tokenizer: Arc<dyn Tokenizer + Send + Sync>,
    ) -> PipelineResult<Self> {
        if !decoder.config().is_encoder_decoder {
            return Err(PipelineError::UnsupportedCombination(
                "transcription needs an encoder-decoder model".into(),
            ));
        }
        Ok(Self {
            encoder,
            decoder,
            tokenizer,
            sample_rate: Self::DEFAULT_SAMPLE_RATE,
            prompt_tokens: Vec::new(),
            suppress_tokens: Vec::new(),
        })
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_prompt_tokens(mut self, tokens: Vec<i64>) -> Self {
        self.prompt_tokens = tokens;
        self
    }

    pub fn with_suppress_tokens(mut self, tokens: Vec<i64>) -> Self {
        self.suppress_tokens = tokens;
        self
    }

    /// Samples per chunk for `options.chunk_size` seconds
    pub fn chunk_samples(&self, options: &GenerateOptions) -> PipelineResult<usize> {
        let samples = options.chunk_size as usize * self.sample_rate as usize;
        if samples == 0 {
            return Err(PipelineError::InvalidOptions(
                "chunk size and sample rate must be non-zero".into(),
            ));
        }
        Ok(samples)
    }

    pub fn transcribe(
        &self,
        audio: &[f32],
        options: &GenerateOptions,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<TranscriptionResult> {
        let chunk_samples = self.chunk_samples(options)?;
        let mut search = Search::new(options.clone(), self.tokenizer.eos_token_id())?
            .with_special_tokens(self.tokenizer.special_token_ids());
        if !self.suppress_tokens.is_empty() {
            search = search.with_suppressed_tokens(self.suppress_tokens.clone());
        }

        let chunks: Vec<&[f32]> = audio.chunks(chunk_samples).collect();
        let chunked = ChunkedProgress::new(progress, chunks.len());
        let mut result = TranscriptionResult::default();

        for (index, samples) in chunks.into_iter().enumerate() {
            cancel.check()?;

            let hidden_states = self.encoder.encode(samples)?;
            let cache_size = match hidden_states.dimensions() {
                [_, frames, _] => *frames,
                other => {
                    return Err(PipelineError::Model(format!(
                        "encoder hidden states must be [1, frames, hidden], got {other:?}"
                    )));
                }
            };

            let prompt = if self.prompt_tokens.is_empty() {
                vec![self.tokenizer.bos_token_id()]
            } else {
                self.prompt_tokens.clone()
            };
            let sequence = Sequence::new(prompt, self.decoder.config().create_cache());
            let context = SearchContext {
                cache_size,
                encoder_hidden_states: Some(&hidden_states),
                cancel,
                progress: &chunked,
            };

            let best = run_search(&search, self.decoder.as_ref(), sequence, &context)?
                .into_iter()
                .next()
                .ok_or(GenerateError::NoCandidates)?;
            let text = self.tokenizer.decode(&best.generated, true)?;

            result.text.push_str(&text);
            result.score += best.score;
            result.chunks.push(TranscribedChunk {
                index,
                start: Duration::from_secs_f64(
                    (index * chunk_samples) as f64 / self.sample_rate as f64,
                ),
                text,
                score: best.score,
            });
            chunked.next_chunk();
        }

        log::debug!(
            "Transcribed {} chunk(s), {} characters",
            result.chunks.len(),
            result.text.len()
        );
        Ok(result)
    }
}
