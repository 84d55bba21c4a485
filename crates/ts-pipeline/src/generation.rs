//! Text generation over a decoder-only model

use std::sync::Arc;

use ts_core::{CancellationToken, ProgressSink};
use ts_generate::{
    DecoderModel, GenerateOptions, GeneratedSequence, Search, SearchContext, Sequence, Tokenizer,
};

use crate::error::{PipelineError, PipelineResult};

/// One decoded result
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedText {
    pub text: String,
    pub tokens: Vec<i64>,
    pub score: f32,
    pub rank_score: f32,
}

/// Greedy when `beams == 1`, ranked beams otherwise
pub(crate) fn run_search(
    search: &Search,
    decoder: &dyn DecoderModel,
    sequence: Sequence,
    context: &SearchContext<'_>,
) -> PipelineResult<Vec<GeneratedSequence>> {
    if search.options().beams == 1 {
        Ok(vec![search.greedy(decoder, sequence, context)?])
    } else {
        Ok(search.beam(decoder, sequence, context)?)
    }
}

/// Prompt in, generated continuations out
pub struct TextGenerationPipeline {
    decoder: Arc<dyn DecoderModel + Send + Sync>,
    tokenizer: Arc<dyn Tokenizer + Send + Sync>,
}

impl TextGenerationPipeline {
    pub fn new(
        decoder: Arc<dyn DecoderModel + Send + Sync>,
        tokenizer: Arc<dyn Tokenizer + Send + Sync>,
    ) -> PipelineResult<Self> {
        if decoder.config().is_encoder_decoder {
            return Err(PipelineError::UnsupportedCombination(
                "text generation needs a decoder-only model".into(),
            ));
        }
        Ok(Self { decoder, tokenizer })
    }

    /// Generate from `prompt`, best result first
    pub fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<Vec<GeneratedText>> {
        let mut prompt_ids = self.tokenizer.encode(prompt)?.input_ids;
        if prompt_ids.is_empty() {
            prompt_ids.push(self.tokenizer.bos_token_id());
        }
        let cache_size = prompt_ids.len();

        let search = Search::new(options.clone(), self.tokenizer.eos_token_id())?
            .with_special_tokens(self.tokenizer.special_token_ids());
        let sequence = Sequence::new(prompt_ids, self.decoder.config().create_cache());
        let context = SearchContext {
            cache_size,
            encoder_hidden_states: None,
            cancel,
            progress,
        };

        let results = run_search(&search, self.decoder.as_ref(), sequence, &context)?;
        log::debug!("Generated {} sequence(s) for a {}-token prompt", results.len(), cache_size);

        results
            .into_iter()
            .map(|result| {
                Ok(GeneratedText {
                    text: self.tokenizer.decode(&result.generated, true)?,
                    tokens: result.tokens,
                    score: result.score,
                    rank_score: result.rank_score,
                })
            })
            .collect()
    }
}
