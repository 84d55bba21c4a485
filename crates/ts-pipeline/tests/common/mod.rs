//! Mock collaborators shared by the pipeline integration tests

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use ts_core::{CancellationToken, Tensor};
use ts_generate::{
    DecoderConfig, DecoderInput, DecoderModel, DecoderOutput, EncodedText, GenerateResult,
    Tokenizer,
};
use ts_pipeline::{AudioEncoder, AutoEncoder, DenoiseInput, DenoiseModel, PipelineResult};
use ts_runtime::{ModelMetadata, ModelSession, NamedTensors, RuntimeResult};

pub const VOCAB: usize = 8;
pub const BOS: i64 = 0;
pub const EOS: i64 = 7;

// ═══════════════════════════════════════════════════════════════════════════════
// DIFFUSION
// ═══════════════════════════════════════════════════════════════════════════════

/// Predicts `output` everywhere; optionally cancels a token after N calls
pub struct MockDenoiser {
    pub output: f32,
    pub control_net: bool,
    pub calls: AtomicUsize,
    pub unloads: AtomicUsize,
    pub timesteps: Mutex<Vec<f32>>,
    pub cancel_after: Option<(usize, CancellationToken)>,
}

impl MockDenoiser {
    pub fn zero() -> Self {
        Self {
            output: 0.0,
            control_net: false,
            calls: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            timesteps: Mutex::new(Vec::new()),
            cancel_after: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DenoiseModel for MockDenoiser {
    fn predict(&self, input: &DenoiseInput<'_>) -> PipelineResult<Tensor<f32>> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.timesteps.lock().unwrap().push(input.timestep);
        if let Some((limit, token)) = &self.cancel_after {
            if calls >= *limit {
                token.cancel();
            }
        }
        Ok(Tensor::filled(input.sample.dimensions(), self.output))
    }

    fn supports_control_net(&self) -> bool {
        self.control_net
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Latents are the image scaled by 0.5, decoding doubles them back
#[derive(Default)]
pub struct MockAutoEncoder {
    pub encodes: AtomicUsize,
    pub decodes: AtomicUsize,
    pub unloads: AtomicUsize,
}

impl AutoEncoder for MockAutoEncoder {
    fn encode(&self, image: &Tensor<f32>) -> PipelineResult<Tensor<f32>> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        Ok(image.to_multiply_scalar(0.5))
    }

    fn decode(&self, latents: &Tensor<f32>) -> PipelineResult<Tensor<f32>> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        Ok(latents.to_multiply_scalar(2.0))
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECODING
// ═══════════════════════════════════════════════════════════════════════════════

/// Logits depend only on the last input id and the decode position
pub struct FakeDecoder {
    config: DecoderConfig,
    pub calls: AtomicUsize,
}

impl FakeDecoder {
    pub fn new(is_encoder_decoder: bool) -> Self {
        Self {
            config: DecoderConfig {
                num_layers: 1,
                num_kv_heads: 1,
                head_dim: 2,
                vocab_size: VOCAB,
                is_encoder_decoder,
                has_hidden_state: false,
            },
            calls: AtomicUsize::new(0),
        }
    }
}

impl DecoderModel for FakeDecoder {
    fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn run_decoder(&self, input: &DecoderInput<'_>) -> GenerateResult<DecoderOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let position = if input.use_branch_cache {
            input.past_key_values[0].as_slice()[0] as usize + 1
        } else {
            input.input_ids.len()
        };
        let last = input.input_ids.last().copied().unwrap_or(BOS);
        // Encoder output shifts preferences so chunks decode differently
        let bias = input
            .encoder_hidden_states
            .map(|h| h.as_slice()[0] as i64)
            .unwrap_or(0);

        let mut row = vec![0.0f32; VOCAB];
        for (token, logit) in row.iter_mut().enumerate().take(VOCAB - 1) {
            *logit = ((token as i64 * 5 + last * 3 + position as i64 + bias) % 7) as f32 * 0.4;
        }
        row[EOS as usize] = position as f32 * 0.5 - 0.5;

        let seq = input.input_ids.len();
        let mut outputs = vec![Tensor::new(&[1, seq, VOCAB], row.repeat(seq))?];
        for _ in 0..self.config.num_layers * self.config.slots_per_layer() {
            outputs.push(Tensor::filled(&[1, 1, 1, 2], position as f32));
        }
        DecoderOutput::from_outputs(outputs, &self.config)
    }
}

/// Byte-ish tokenizer: letters map onto ids 1..=6, id `n` decodes to `'a' + n - 1`
pub struct FakeTokenizer;

impl Tokenizer for FakeTokenizer {
    fn encode(&self, text: &str) -> GenerateResult<EncodedText> {
        let input_ids: Vec<i64> = std::iter::once(BOS)
            .chain(text.bytes().map(|b| i64::from(b % 6) + 1))
            .collect();
        Ok(EncodedText {
            attention_mask: vec![1; input_ids.len()],
            input_ids,
        })
    }

    fn decode(&self, ids: &[i64], skip_special_tokens: bool) -> GenerateResult<String> {
        Ok(ids
            .iter()
            .filter(|id| !(skip_special_tokens && (**id == BOS || **id == EOS)))
            .map(|&id| match id {
                BOS => '<',
                EOS => '>',
                other => char::from(b'a' + (other - 1) as u8),
            })
            .collect())
    }

    fn bos_token_id(&self) -> i64 {
        BOS
    }

    fn eos_token_id(&self) -> i64 {
        EOS
    }

    fn special_token_ids(&self) -> Vec<i64> {
        vec![BOS, EOS]
    }
}

/// `[1, 3, 2]` hidden states filled with the chunk's first sample
#[derive(Default)]
pub struct FakeAudioEncoder {
    pub chunk_lengths: Mutex<Vec<usize>>,
}

impl AudioEncoder for FakeAudioEncoder {
    fn encode(&self, samples: &[f32]) -> PipelineResult<Tensor<f32>> {
        self.chunk_lengths.lock().unwrap().push(samples.len());
        let first = samples.first().copied().unwrap_or(0.0);
        Ok(Tensor::filled(&[1, 3, 2], first))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME
// ═══════════════════════════════════════════════════════════════════════════════

/// Session that records its inputs and answers with a fixed output list
pub struct MockSession {
    pub outputs: NamedTensors,
    pub loaded: Mutex<bool>,
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub last_inputs: Mutex<Option<NamedTensors>>,
}

impl MockSession {
    pub fn new(outputs: NamedTensors) -> Self {
        Self {
            outputs,
            loaded: Mutex::new(false),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            last_inputs: Mutex::new(None),
        }
    }

    pub fn input_names(&self) -> Vec<String> {
        self.last_inputs
            .lock()
            .unwrap()
            .as_ref()
            .map(|inputs| inputs.names().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

impl ModelSession for MockSession {
    fn load(&self) -> RuntimeResult<ModelMetadata> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        *self.loaded.lock().unwrap() = true;
        Ok(ModelMetadata::default())
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        *self.loaded.lock().unwrap() = false;
    }

    fn is_loaded(&self) -> bool {
        *self.loaded.lock().unwrap()
    }

    fn run(&self, inputs: &NamedTensors) -> RuntimeResult<NamedTensors> {
        *self.last_inputs.lock().unwrap() = Some(inputs.clone());
        Ok(self.outputs.clone())
    }
}
