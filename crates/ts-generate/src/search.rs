//! Greedy and beam search over a decoder collaborator

use ts_core::{CancellationToken, ProgressSink, RunTimer, Tensor, log_softmax};

use crate::comparer::SequenceComparer;
use crate::error::GenerateResult;
use crate::model::{DecoderInput, DecoderModel, DecoderOutput};
use crate::options::{EarlyStopping, GenerateOptions};
use crate::processors::{
    EosTokenProcessor, LogitsProcessor, MaxLengthTokenProcessor, MinLengthProcessor,
    NoRepeatNGramProcessor, SuppressTokensProcessor, TokenProcessor,
};
use crate::sampler::{Sampler, SamplingParams};
use crate::sequence::Sequence;

/// A finished sequence
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSequence {
    pub tokens: Vec<i64>,
    /// Tokens after the prompt
    pub generated: Vec<i64>,
    pub score: f32,
    pub penalty_score: f32,
    /// Length-penalized score used for ranking
    pub rank_score: f32,
}

impl GeneratedSequence {
    fn from_sequence(sequence: &Sequence, length_penalty: f32) -> Self {
        Self {
            tokens: sequence.tokens().to_vec(),
            generated: sequence.generated().to_vec(),
            score: sequence.score(),
            penalty_score: sequence.penalty_score(),
            rank_score: sequence.rank_score(length_penalty),
        }
    }
}

/// Per-run inputs shared by every decoder call
pub struct SearchContext<'a> {
    /// Static cache length: prompt length for decoder-only models, encoder length otherwise
    pub cache_size: usize,
    pub encoder_hidden_states: Option<&'a Tensor<f32>>,
    pub cancel: &'a CancellationToken,
    pub progress: &'a dyn ProgressSink,
}

/// Search driver holding options and the processor chains
pub struct Search {
    options: GenerateOptions,
    params: SamplingParams,
    logits_processors: Vec<Box<dyn LogitsProcessor>>,
    token_processors: Vec<Box<dyn TokenProcessor>>,
    comparer: SequenceComparer,
}

impl Search {
    /// Standard processors for `options` and the tokenizer's EOS id
    pub fn new(options: GenerateOptions, eos_token_id: i64) -> GenerateResult<Self> {
        options.validate()?;

        let mut logits_processors: Vec<Box<dyn LogitsProcessor>> = Vec::new();
        if options.no_repeat_ngram_size > 0 {
            logits_processors.push(Box::new(NoRepeatNGramProcessor::new(
                options.no_repeat_ngram_size,
            )));
        }
        if options.min_length > 0 {
            logits_processors.push(Box::new(MinLengthProcessor::new(
                options.min_length,
                eos_token_id,
            )));
        }

        let token_processors: Vec<Box<dyn TokenProcessor>> = vec![
            Box::new(EosTokenProcessor::new(options.min_length, eos_token_id)),
            Box::new(MaxLengthTokenProcessor::new(options.max_length)),
        ];

        Ok(Self {
            params: SamplingParams::from(&options),
            comparer: SequenceComparer::new([eos_token_id], options.diversity_length),
            options,
            logits_processors,
            token_processors,
        })
    }

    /// Special tokens skipped when comparing beams for the diversity penalty
    pub fn with_special_tokens(mut self, special_tokens: impl IntoIterator<Item = i64>) -> Self {
        self.comparer = SequenceComparer::new(special_tokens, self.options.diversity_length);
        self
    }

    pub fn with_suppressed_tokens(self, tokens: Vec<i64>) -> Self {
        self.with_logits_processor(Box::new(SuppressTokensProcessor::new(tokens)))
    }

    pub fn with_logits_processor(mut self, processor: Box<dyn LogitsProcessor>) -> Self {
        self.logits_processors.push(processor);
        self
    }

    pub fn options(&self) -> &GenerateOptions {
        &self.options
    }

    fn process_logits(&self, tokens: &[i64], logits: &mut [f32]) {
        for processor in &self.logits_processors {
            processor.process(tokens, logits);
        }
    }

    fn is_complete(&self, tokens: &[i64]) -> bool {
        self.token_processors
            .iter()
            .any(|processor| processor.is_complete(tokens))
    }

    fn run_one(
        model: &dyn DecoderModel,
        sequence: &mut Sequence,
        context: &SearchContext<'_>,
    ) -> GenerateResult<DecoderOutput> {
        let use_branch_cache = sequence.initialize(context.cache_size);
        let output = {
            let input = DecoderInput {
                input_ids: sequence.input_ids(use_branch_cache),
                past_key_values: sequence.cache_values()?,
                use_branch_cache,
                encoder_hidden_states: context.encoder_hidden_states,
            };
            model.run_decoder(&input)?
        };
        sequence.update_cache(&output, use_branch_cache)?;
        Ok(output)
    }

    /// Processed logits and their log-probabilities for the next token
    fn next_token_scores(&self, sequence: &Sequence, output: &DecoderOutput) -> GenerateResult<(Vec<f32>, Vec<f32>)> {
        let mut logits = output.last_token_logits()?.to_vec();
        self.process_logits(sequence.tokens(), &mut logits);
        let log_probs = log_softmax(&logits);
        Ok((logits, log_probs))
    }

    /// Extend one sequence a token at a time until a token processor stops it
    pub fn greedy(
        &self,
        model: &dyn DecoderModel,
        mut sequence: Sequence,
        context: &SearchContext<'_>,
    ) -> GenerateResult<GeneratedSequence> {
        let mut sampler = Sampler::new(self.options.seed);
        let timer = RunTimer::start();
        let budget = self.options.max_length.saturating_sub(sequence.len()).max(1);

        while !self.is_complete(sequence.tokens()) {
            context.cancel.check()?;

            let output = Self::run_one(model, &mut sequence, context)?;
            let (mut logits, log_probs) = self.next_token_scores(&sequence, &output)?;
            let token = sampler.sample(&mut logits, &self.params)?;
            sequence.push_token(token as i64, log_probs[token]);

            let produced = sequence.generated().len();
            context.progress.report(timer.record(produced, budget));
        }

        sequence.complete();
        log::debug!(
            "Greedy search finished: {} tokens, score {:.4}",
            sequence.len(),
            sequence.score()
        );
        Ok(GeneratedSequence::from_sequence(
            &sequence,
            self.options.length_penalty,
        ))
    }

    /// Keep `beams` candidates alive, returning finished beams best first
    pub fn beam(
        &self,
        model: &dyn DecoderModel,
        sequence: Sequence,
        context: &SearchContext<'_>,
    ) -> GenerateResult<Vec<GeneratedSequence>> {
        let beams = self.options.beams;
        let length_penalty = self.options.length_penalty;
        let mut sampler = Sampler::new(self.options.seed);
        let timer = RunTimer::start();

        let mut finished: Vec<Sequence> = Vec::new();
        let mut live: Vec<Sequence> = Vec::new();
        if self.is_complete(sequence.tokens()) {
            finished.push(sequence);
        } else {
            live.push(sequence);
        }

        while !live.is_empty() {
            context.cancel.check()?;

            let outputs = self.run_beams(model, &mut live, context)?;

            // (parent, token, log-probability, cumulative score)
            let mut candidates: Vec<(usize, usize, f32, f32)> = Vec::new();
            for (parent, (sequence, output)) in live.iter().zip(&outputs).enumerate() {
                let (mut logits, log_probs) = self.next_token_scores(sequence, output)?;
                for token in sampler.sample_many(&mut logits, &self.params, beams)? {
                    let log_prob = log_probs[token];
                    candidates.push((parent, token, log_prob, sequence.score() + log_prob));
                }
            }
            candidates.sort_by(|a, b| b.3.total_cmp(&a.3));

            let mut next = Vec::with_capacity(beams);
            for (parent, token, log_prob, _) in candidates {
                if next.len() == beams {
                    break;
                }
                let mut child = live[parent].fork();
                child.push_token(token as i64, log_prob);
                if self.is_complete(child.tokens()) {
                    self.finish(&mut child, &finished);
                    finished.push(child);
                    context
                        .progress
                        .report(timer.record(finished.len().min(beams), beams));
                } else {
                    next.push(child);
                }
            }
            live = next;

            if self.should_stop(&live, &finished) {
                break;
            }
        }

        finished.sort_by(|a, b| {
            b.rank_score(length_penalty)
                .total_cmp(&a.rank_score(length_penalty))
        });
        finished.truncate(beams);
        log::debug!(
            "Beam search finished: {} beams, best score {:.4}",
            finished.len(),
            finished
                .first()
                .map(|s| s.rank_score(length_penalty))
                .unwrap_or(f32::NEG_INFINITY)
        );
        Ok(finished
            .iter()
            .map(|s| GeneratedSequence::from_sequence(s, length_penalty))
            .collect())
    }

    fn run_beams(
        &self,
        model: &dyn DecoderModel,
        live: &mut [Sequence],
        context: &SearchContext<'_>,
    ) -> GenerateResult<Vec<DecoderOutput>> {
        let branches: Vec<bool> = live
            .iter_mut()
            .map(|sequence| sequence.initialize(context.cache_size))
            .collect();

        let outputs = {
            let inputs = live
                .iter()
                .zip(&branches)
                .map(|(sequence, &use_branch_cache)| {
                    Ok(DecoderInput {
                        input_ids: sequence.input_ids(use_branch_cache),
                        past_key_values: sequence.cache_values()?,
                        use_branch_cache,
                        encoder_hidden_states: context.encoder_hidden_states,
                    })
                })
                .collect::<GenerateResult<Vec<_>>>()?;
            model.run_decoder_batch(&inputs)?
        };

        for ((sequence, output), &use_branch_cache) in live.iter_mut().zip(&outputs).zip(&branches) {
            sequence.update_cache(output, use_branch_cache)?;
        }
        Ok(outputs)
    }

    /// Diversity penalty against already-finished beams, then freeze
    fn finish(&self, sequence: &mut Sequence, finished: &[Sequence]) {
        if self.options.diversity_penalty != 0.0 {
            let repeats = finished
                .iter()
                .filter(|done| self.comparer.equals(done.generated(), sequence.generated()))
                .count();
            if repeats > 0 {
                sequence.add_penalty(self.options.diversity_penalty);
            }
        }
        sequence.complete();
    }

    /// Highest rank score any continuation of `sequence` can reach
    fn rank_bound(&self, sequence: &Sequence) -> f32 {
        let length_penalty = self.options.length_penalty;
        // Further tokens only lower the score; a negative diversity penalty is the one possible gain
        let numerator = sequence.score()
            - sequence.penalty_score()
            - self.options.diversity_penalty.min(0.0);
        let shortest = sequence.len().max(1) as f32;
        let longest = self.options.max_length.max(sequence.len()).max(1) as f32;
        // Rank is monotone in length, so the two extremes bound every length between
        (numerator / shortest.powf(length_penalty))
            .max(numerator / longest.powf(length_penalty))
    }

    fn should_stop(&self, live: &[Sequence], finished: &[Sequence]) -> bool {
        let length_penalty = self.options.length_penalty;
        match self.options.early_stopping {
            EarlyStopping::Exhaustive => false,
            EarlyStopping::BestBeam => {
                if finished.len() < self.options.beams {
                    return false;
                }
                let best_finished = finished
                    .iter()
                    .map(|s| s.rank_score(length_penalty))
                    .fold(f32::NEG_INFINITY, f32::max);
                live.iter().all(|s| self.rank_bound(s) <= best_finished)
            }
        }
    }
}
