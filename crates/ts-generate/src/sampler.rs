//! Logits to token: temperature, top-K, top-P and an inverse-CDF draw

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{GenerateError, GenerateResult};
use crate::options::GenerateOptions;

/// Truncation and scaling applied before a draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
}

impl From<&GenerateOptions> for SamplingParams {
    fn from(options: &GenerateOptions) -> Self {
        Self {
            top_k: options.top_k,
            top_p: options.top_p,
            temperature: options.temperature,
        }
    }
}

/// Heap entry; on equal scores the lower index ranks higher
#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    score: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// `k` highest entries, best first, via a bounded min-heap
pub fn top_k(logits: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(k + 1);
    for (index, &score) in logits.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        heap.push(Reverse(Candidate { index, score }));
        if heap.len() > k {
            heap.pop();
        }
    }
    // Ascending order of Reverse is descending order of Candidate
    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(c)| (c.index, c.score))
        .collect()
}

/// Token ids with normalized probabilities, best first
pub fn candidate_distribution(
    logits: &mut [f32],
    params: &SamplingParams,
) -> GenerateResult<Vec<(usize, f32)>> {
    if params.temperature != 1.0 {
        for logit in logits.iter_mut() {
            *logit /= params.temperature;
        }
    }

    let survivors = top_k(logits, params.top_k.max(1));
    let max = survivors
        .first()
        .map(|&(_, score)| score)
        .filter(|score| score.is_finite())
        .ok_or(GenerateError::NoCandidates)?;

    let exps: Vec<f32> = survivors.iter().map(|&(_, s)| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let mut distribution: Vec<(usize, f32)> = survivors
        .iter()
        .zip(&exps)
        .map(|(&(index, _), &e)| (index, e / sum))
        .collect();

    if params.top_p < 1.0 {
        let mut cumulative = 0.0;
        let mut keep = distribution.len();
        for (i, &(_, p)) in distribution.iter().enumerate() {
            cumulative += p;
            if cumulative >= params.top_p {
                keep = i + 1;
                break;
            }
        }
        distribution.truncate(keep);
        let total: f32 = distribution.iter().map(|&(_, p)| p).sum();
        for entry in &mut distribution {
            entry.1 /= total;
        }
    }

    Ok(distribution)
}

/// Index whose cumulative probability first exceeds `draw * total`
fn inverse_cdf(distribution: &[(usize, f32)], draw: f32) -> usize {
    let total: f32 = distribution.iter().map(|&(_, p)| p).sum();
    let target = draw * total;
    let mut cumulative = 0.0;
    for (position, &(_, p)) in distribution.iter().enumerate() {
        cumulative += p;
        if target < cumulative {
            return position;
        }
    }
    distribution.len().saturating_sub(1)
}

/// Seeded token sampler
#[derive(Debug, Clone)]
pub struct Sampler {
    rng: ChaCha8Rng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Draw one token; `logits` are scaled by temperature in place
    pub fn sample(&mut self, logits: &mut [f32], params: &SamplingParams) -> GenerateResult<usize> {
        let distribution = candidate_distribution(logits, params)?;
        let position = inverse_cdf(&distribution, self.rng.random::<f32>());
        Ok(distribution[position].0)
    }

    /// Draw up to `count` distinct tokens without replacement
    ///
    /// The first draw consumes the generator exactly like [`Sampler::sample`].
    pub fn sample_many(
        &mut self,
        logits: &mut [f32],
        params: &SamplingParams,
        count: usize,
    ) -> GenerateResult<Vec<usize>> {
        let mut distribution = candidate_distribution(logits, params)?;
        let mut tokens = Vec::with_capacity(count.min(distribution.len()));
        while tokens.len() < count && !distribution.is_empty() {
            let position = inverse_cdf(&distribution, self.rng.random::<f32>());
            tokens.push(distribution.remove(position).0);
        }
        Ok(tokens)
    }
}
