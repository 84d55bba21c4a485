//! Deterministic fake decoder shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use ts_core::Tensor;
use ts_generate::{
    DecoderConfig, DecoderInput, DecoderModel, DecoderOutput, GenerateResult, Sequence,
};

pub const VOCAB: usize = 8;
pub const EOS: i64 = 7;
pub const BOS: i64 = 0;

/// Logits depend only on the last input id and the decode position
pub struct FakeDecoder {
    config: DecoderConfig,
    pub calls: AtomicUsize,
    pub branch_calls: AtomicUsize,
}

impl FakeDecoder {
    pub fn new(is_encoder_decoder: bool) -> Self {
        Self {
            config: DecoderConfig {
                num_layers: 2,
                num_kv_heads: 1,
                head_dim: 2,
                vocab_size: VOCAB,
                is_encoder_decoder,
                has_hidden_state: true,
            },
            calls: AtomicUsize::new(0),
            branch_calls: AtomicUsize::new(0),
        }
    }

    pub fn start(&self) -> Sequence {
        Sequence::new(vec![BOS], self.config.create_cache())
    }
}

impl DecoderModel for FakeDecoder {
    fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn run_decoder(&self, input: &DecoderInput<'_>) -> GenerateResult<DecoderOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if input.use_branch_cache {
            self.branch_calls.fetch_add(1, Ordering::SeqCst);
        }

        // The decode position travels through the first cache slot
        let position = if input.use_branch_cache {
            input.past_key_values[0].as_slice()[0] as usize + 1
        } else {
            input.input_ids.len()
        };
        let last = input.input_ids.last().copied().unwrap_or(BOS);

        let mut row = vec![0.0f32; VOCAB];
        for (token, logit) in row.iter_mut().enumerate().take(VOCAB - 1) {
            *logit = ((token as i64 * 5 + last * 3 + position as i64) % 7) as f32 * 0.4;
        }
        row[EOS as usize] = position as f32 * 0.35 - 0.5;

        let seq = input.input_ids.len();
        let mut outputs = vec![Tensor::new(&[1, seq, VOCAB], row.repeat(seq))?];
        for _ in 0..self.config.num_layers * self.config.slots_per_layer() {
            outputs.push(Tensor::filled(&[1, 1, 1, 2], position as f32));
        }
        outputs.push(Tensor::filled(&[1, seq, 4], position as f32));
        DecoderOutput::from_outputs(outputs, &self.config)
    }
}
