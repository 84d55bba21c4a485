//! Model collaborators backed by runtime sessions
//!
//! Input and output names follow the common diffusers / optimum ONNX
//! exports. Decoder outputs are read positionally in graph order and
//! handed to [`DecoderOutput`] for named access.

use ts_core::Tensor;
use ts_generate::{
    DecoderConfig, DecoderInput, DecoderModel, DecoderOutput, GenerateError, GenerateResult,
};
use ts_runtime::{ModelSession, NamedTensors, RuntimeError};

use crate::diffusion::{DenoiseInput, DenoiseModel};
use crate::error::{PipelineError, PipelineResult};

/// UNet or transformer session
pub struct OnnxDenoiser<S: ModelSession> {
    session: S,
    control_net: bool,
}

impl<S: ModelSession> OnnxDenoiser<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            control_net: false,
        }
    }

    /// Session graph takes `controlnet_cond` and `conditioning_scale`
    pub fn with_control_net(mut self) -> Self {
        self.control_net = true;
        self
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    fn inputs(&self, input: &DenoiseInput<'_>) -> NamedTensors {
        let batch = input.sample.dimensions().first().copied().unwrap_or(1);
        let mut tensors = NamedTensors::new()
            .with("sample", input.sample.clone())
            .with("timestep", Tensor::filled(&[batch], input.timestep))
            .with("encoder_hidden_states", input.encoder_hidden_states.clone());
        if let Some(image_latents) = input.image_latents {
            tensors.insert("image_latents", image_latents.clone());
        }
        if let Some(control_image) = input.control_image {
            tensors.insert("controlnet_cond", control_image.clone());
            tensors.insert("conditioning_scale", Tensor::filled(&[1], input.control_scale));
        }
        tensors
    }
}

impl<S: ModelSession> DenoiseModel for OnnxDenoiser<S> {
    fn predict(&self, input: &DenoiseInput<'_>) -> PipelineResult<Tensor<f32>> {
        self.session.ensure_loaded()?;
        let outputs = self.session.run(&self.inputs(input))?;
        outputs
            .into_float_vec()?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Model("denoiser returned no outputs".into()))
    }

    fn supports_control_net(&self) -> bool {
        self.control_net
    }

    fn unload(&self) {
        self.session.unload();
    }
}

/// Autoregressive decoder session (with or without cross-attention)
pub struct OnnxDecoder<S: ModelSession> {
    session: S,
    config: DecoderConfig,
}

impl<S: ModelSession> OnnxDecoder<S> {
    pub fn new(session: S, config: DecoderConfig) -> Self {
        Self { session, config }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Cache input names in the order [`DecoderOutput`] stores the slots
    pub fn past_key_value_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.config.num_layers * self.config.slots_per_layer());
        for layer in 0..self.config.num_layers {
            if self.config.is_encoder_decoder {
                for part in ["decoder.key", "decoder.value", "encoder.key", "encoder.value"] {
                    names.push(format!("past_key_values.{layer}.{part}"));
                }
            } else {
                names.push(format!("past_key_values.{layer}.key"));
                names.push(format!("past_key_values.{layer}.value"));
            }
        }
        names
    }

    fn inputs(&self, input: &DecoderInput<'_>) -> GenerateResult<NamedTensors> {
        let ids = Tensor::new(&[1, input.input_ids.len()], input.input_ids.clone())?;
        let mut tensors = NamedTensors::new()
            .with("input_ids", ids)
            .with(
                "use_cache_branch",
                Tensor::filled(&[1], input.use_branch_cache),
            );

        let names = self.past_key_value_names();
        if input.past_key_values.len() != names.len() {
            return Err(GenerateError::ConfigurationMismatch {
                what: "past key/value count",
                expected: names.len(),
                got: input.past_key_values.len(),
            });
        }
        for (name, value) in names.into_iter().zip(input.past_key_values) {
            tensors.insert(name, value.clone());
        }

        if let Some(hidden_states) = input.encoder_hidden_states {
            tensors.insert("encoder_hidden_states", hidden_states.clone());
        }
        Ok(tensors)
    }
}

fn model_error(error: RuntimeError) -> GenerateError {
    GenerateError::Model(error.to_string())
}

impl<S: ModelSession> DecoderModel for OnnxDecoder<S> {
    fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn run_decoder(&self, input: &DecoderInput<'_>) -> GenerateResult<DecoderOutput> {
        self.session.ensure_loaded().map_err(model_error)?;
        let outputs = self
            .session
            .run(&self.inputs(input)?)
            .and_then(NamedTensors::into_float_vec)
            .map_err(model_error)?;
        DecoderOutput::from_outputs(outputs, &self.config)
    }
}
