//! Decode configuration

use serde::{Deserialize, Serialize};

use crate::error::{GenerateError, GenerateResult};

/// When beam search may stop before every beam has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EarlyStopping {
    /// Stop once no live beam can outrank the best finished beam
    #[default]
    BestBeam,
    /// Run until every live beam has finished
    Exhaustive,
}

/// Options for one generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
    pub seed: u64,
    /// Beam width, 1 = greedy
    pub beams: usize,
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    /// Total sequence length limit, prompt included
    pub max_length: usize,
    /// EOS is masked until the sequence reaches this length
    pub min_length: usize,
    /// 0 disables n-gram blocking
    pub no_repeat_ngram_size: usize,
    pub length_penalty: f32,
    /// Leading generated tokens compared by the diversity penalty, 0 disables it
    pub diversity_length: usize,
    pub diversity_penalty: f32,
    pub early_stopping: EarlyStopping,
    /// Audio chunk length in seconds for chunked transcription
    pub chunk_size: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            beams: 1,
            top_k: 50,
            top_p: 0.9,
            temperature: 1.0,
            max_length: 20,
            min_length: 0,
            no_repeat_ngram_size: 0,
            length_penalty: 1.0,
            diversity_length: 20,
            diversity_penalty: 0.0,
            early_stopping: EarlyStopping::BestBeam,
            chunk_size: 30,
        }
    }
}

impl GenerateOptions {
    /// Deterministic arg-max decoding
    pub fn greedy() -> Self {
        Self {
            top_k: 1,
            top_p: 1.0,
            ..Default::default()
        }
    }

    /// Beam search with `beams` beams
    pub fn beam(beams: usize) -> Self {
        Self {
            beams,
            top_k: 50.max(beams),
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn validate(&self) -> GenerateResult<()> {
        if self.beams == 0 {
            return Err(GenerateError::InvalidOptions("beams must be at least 1".into()));
        }
        if self.top_k == 0 {
            return Err(GenerateError::InvalidOptions("top_k must be at least 1".into()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(GenerateError::InvalidOptions(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(GenerateError::InvalidOptions(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.max_length == 0 || self.min_length > self.max_length {
            return Err(GenerateError::InvalidOptions(format!(
                "length range {}..={} is empty",
                self.min_length, self.max_length
            )));
        }
        if self.chunk_size == 0 {
            return Err(GenerateError::InvalidOptions("chunk_size must be positive".into()));
        }
        if self.top_k < self.beams {
            log::warn!(
                "top_k ({}) is smaller than beams ({}), beams will be under-filled",
                self.top_k,
                self.beams
            );
        }
        Ok(())
    }
}
