//! Logits masking and termination rules applied every decode step

/// Adjusts next-token logits given the tokens so far
pub trait LogitsProcessor: Send + Sync {
    fn process(&self, tokens: &[i64], logits: &mut [f32]);
}

/// Decides whether a sequence is finished
pub trait TokenProcessor: Send + Sync {
    fn is_complete(&self, tokens: &[i64]) -> bool;
}

fn mask(logits: &mut [f32], token: i64) {
    if let Some(logit) = usize::try_from(token).ok().and_then(|i| logits.get_mut(i)) {
        *logit = f32::NEG_INFINITY;
    }
}

/// Bans tokens that would repeat an n-gram already in the sequence
#[derive(Debug, Clone)]
pub struct NoRepeatNGramProcessor {
    size: usize,
}

impl NoRepeatNGramProcessor {
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    /// Tokens that would complete an already-seen n-gram
    pub fn banned_tokens(&self, tokens: &[i64]) -> Vec<i64> {
        let n = self.size;
        if n == 0 || tokens.len() + 1 < n {
            return Vec::new();
        }
        let prefix = &tokens[tokens.len() + 1 - n..];
        tokens
            .windows(n)
            .filter(|window| &window[..n - 1] == prefix)
            .map(|window| window[n - 1])
            .collect()
    }
}

impl LogitsProcessor for NoRepeatNGramProcessor {
    fn process(&self, tokens: &[i64], logits: &mut [f32]) {
        for token in self.banned_tokens(tokens) {
            mask(logits, token);
        }
    }
}

/// Masks EOS until the sequence reaches `min_length`
#[derive(Debug, Clone)]
pub struct MinLengthProcessor {
    min_length: usize,
    eos_token_id: i64,
}

impl MinLengthProcessor {
    pub fn new(min_length: usize, eos_token_id: i64) -> Self {
        Self {
            min_length,
            eos_token_id,
        }
    }
}

impl LogitsProcessor for MinLengthProcessor {
    fn process(&self, tokens: &[i64], logits: &mut [f32]) {
        if tokens.len() < self.min_length {
            mask(logits, self.eos_token_id);
        }
    }
}

/// Masks a fixed set of tokens on every step
#[derive(Debug, Clone)]
pub struct SuppressTokensProcessor {
    tokens: Vec<i64>,
}

impl SuppressTokensProcessor {
    pub fn new(tokens: Vec<i64>) -> Self {
        Self { tokens }
    }
}

impl LogitsProcessor for SuppressTokensProcessor {
    fn process(&self, _tokens: &[i64], logits: &mut [f32]) {
        for &token in &self.tokens {
            mask(logits, token);
        }
    }
}

/// Finished once EOS is produced at or past `min_length`
#[derive(Debug, Clone)]
pub struct EosTokenProcessor {
    min_length: usize,
    eos_token_id: i64,
}

impl EosTokenProcessor {
    pub fn new(min_length: usize, eos_token_id: i64) -> Self {
        Self {
            min_length,
            eos_token_id,
        }
    }
}

impl TokenProcessor for EosTokenProcessor {
    fn is_complete(&self, tokens: &[i64]) -> bool {
        tokens.len() >= self.min_length && tokens.last() == Some(&self.eos_token_id)
    }
}

/// Finished at `max_length` tokens
#[derive(Debug, Clone)]
pub struct MaxLengthTokenProcessor {
    max_length: usize,
}

impl MaxLengthTokenProcessor {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl TokenProcessor for MaxLengthTokenProcessor {
    fn is_complete(&self, tokens: &[i64]) -> bool {
        tokens.len() >= self.max_length
    }
}
