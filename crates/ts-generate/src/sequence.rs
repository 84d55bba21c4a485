//! One decoding candidate: tokens, scores and its own KV cache

use ts_core::Tensor;

use crate::error::GenerateResult;
use crate::kv_cache::KvCache;
use crate::model::DecoderOutput;

/// Lifecycle of a [`Sequence`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Uninitialized,
    /// Cache allocated, prompt not yet forwarded
    Initialized,
    Decoding,
    /// Finished; cache released
    Complete,
}

#[derive(Debug)]
pub struct Sequence {
    tokens: Vec<i64>,
    prompt_length: usize,
    score: f32,
    penalty_score: f32,
    cache: Box<dyn KvCache>,
    last_hidden_state: Option<Tensor<f32>>,
    state: SequenceState,
}

impl Sequence {
    /// Start from prompt tokens (at least the BOS token)
    pub fn new(prompt: Vec<i64>, cache: Box<dyn KvCache>) -> Self {
        Self {
            prompt_length: prompt.len(),
            tokens: prompt,
            score: 0.0,
            penalty_score: 0.0,
            cache,
            last_hidden_state: None,
            state: SequenceState::Uninitialized,
        }
    }

    /// Prepare for the next decoder call
    ///
    /// Returns whether that call uses the cached branch: `false` for the
    /// first call, which forwards the whole prompt, `true` afterwards.
    /// `initial_size` sizes the cache's static portion on the first call.
    pub fn initialize(&mut self, initial_size: usize) -> bool {
        match self.state {
            SequenceState::Uninitialized => {
                self.cache.initialize(initial_size);
                self.state = SequenceState::Initialized;
                false
            }
            _ => true,
        }
    }

    /// Token ids to feed for the next call
    pub fn input_ids(&self, use_branch_cache: bool) -> Vec<i64> {
        if use_branch_cache {
            self.tokens.last().copied().into_iter().collect()
        } else {
            self.tokens.clone()
        }
    }

    pub fn cache_values(&self) -> GenerateResult<&[Tensor<f32>]> {
        self.cache.values()
    }

    /// Fold a decoder call's outputs into the cache
    pub fn update_cache(&mut self, output: &DecoderOutput, use_branch_cache: bool) -> GenerateResult<()> {
        self.cache.update(output.presents(), use_branch_cache)?;
        self.last_hidden_state = output.last_hidden_state().cloned();
        Ok(())
    }

    /// Append a token, adding its log-probability to the score
    pub fn push_token(&mut self, token: i64, log_prob: f32) {
        self.tokens.push(token);
        self.score += log_prob;
        self.state = SequenceState::Decoding;
    }

    /// Freeze the sequence and release its cache
    pub fn complete(&mut self) {
        self.cache.dispose();
        self.state = SequenceState::Complete;
    }

    /// Independent copy with a deep-cloned cache
    pub fn fork(&self) -> Self {
        Self {
            tokens: self.tokens.clone(),
            prompt_length: self.prompt_length,
            score: self.score,
            penalty_score: self.penalty_score,
            cache: self.cache.clone_box(),
            last_hidden_state: self.last_hidden_state.clone(),
            state: self.state,
        }
    }

    pub fn tokens(&self) -> &[i64] {
        &self.tokens
    }

    /// Tokens after the prompt
    pub fn generated(&self) -> &[i64] {
        &self.tokens[self.prompt_length.min(self.tokens.len())..]
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn prompt_length(&self) -> usize {
        self.prompt_length
    }

    /// Cumulative log-probability
    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn penalty_score(&self) -> f32 {
        self.penalty_score
    }

    pub fn add_penalty(&mut self, penalty: f32) {
        self.penalty_score += penalty;
    }

    /// `(score - penalty) / len^length_penalty`
    pub fn rank_score(&self, length_penalty: f32) -> f32 {
        let length = self.tokens.len().max(1) as f32;
        (self.score - self.penalty_score) / length.powf(length_penalty)
    }

    pub fn last_hidden_state(&self) -> Option<&Tensor<f32>> {
        self.last_hidden_state.as_ref()
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SequenceState::Complete
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        self.cache.dispose();
    }
}
