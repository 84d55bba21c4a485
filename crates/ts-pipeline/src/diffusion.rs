//! Diffusion denoising loop
//!
//! Orchestrates one generation run:
//! 1. Validate options and model capabilities
//! 2. Encode the input image (image-to-image, image edit)
//! 3. Denoise: scale input, predict (with guidance), scheduler step
//! 4. Decode latents (optional autoencoder)
//!
//! Each run builds its own scheduler; nothing is shared between runs.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use ts_core::{CancellationToken, ProgressSink, RunTimer, Tensor};
use ts_runtime::MemoryMode;
use ts_scheduler::{Scheduler, create_scheduler};

use crate::error::{PipelineError, PipelineResult};
use crate::options::{DiffusionOptions, ProcessType};

// ═══════════════════════════════════════════════════════════════════════════════
// COLLABORATORS
// ═══════════════════════════════════════════════════════════════════════════════

/// One noise prediction request
#[derive(Debug, Clone, Copy)]
pub struct DenoiseInput<'a> {
    /// Scheduler-scaled latents
    pub sample: &'a Tensor<f32>,
    pub timestep: f32,
    pub encoder_hidden_states: &'a Tensor<f32>,
    /// Encoded input image (image edit)
    pub image_latents: Option<&'a Tensor<f32>>,
    /// Control image and its weight (control-net)
    pub control_image: Option<&'a Tensor<f32>>,
    pub control_scale: f32,
}

/// UNet / transformer collaborator
pub trait DenoiseModel: Send + Sync {
    /// Predicted noise, velocity or sample (per the scheduler's prediction type)
    fn predict(&self, input: &DenoiseInput<'_>) -> PipelineResult<Tensor<f32>>;

    fn supports_control_net(&self) -> bool {
        false
    }

    /// Release model memory; the next `predict` reloads
    fn unload(&self) {}
}

/// Image to latents and back (VAE)
pub trait AutoEncoder: Send + Sync {
    fn encode(&self, image: &Tensor<f32>) -> PipelineResult<Tensor<f32>>;

    fn decode(&self, latents: &Tensor<f32>) -> PipelineResult<Tensor<f32>>;

    fn unload(&self) {}
}

/// Prompt embeddings from the text encoder collaborator
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    pub conditional: Tensor<f32>,
    /// Negative prompt; required for classifier-free guidance
    pub unconditional: Option<Tensor<f32>>,
}

impl PromptEmbeddings {
    pub fn new(conditional: Tensor<f32>) -> Self {
        Self {
            conditional,
            unconditional: None,
        }
    }

    pub fn with_unconditional(mut self, unconditional: Tensor<f32>) -> Self {
        self.unconditional = Some(unconditional);
        self
    }
}

/// Inputs to one run
#[derive(Debug, Clone)]
pub struct DiffusionInput {
    pub prompt: PromptEmbeddings,
    /// Pixel image for image-to-image and image edit
    pub image: Option<Tensor<f32>>,
    /// Control image for control-net
    pub control_image: Option<Tensor<f32>>,
}

impl DiffusionInput {
    pub fn new(prompt: PromptEmbeddings) -> Self {
        Self {
            prompt,
            image: None,
            control_image: None,
        }
    }

    pub fn with_image(mut self, image: Tensor<f32>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_control_image(mut self, control_image: Tensor<f32>) -> Self {
        self.control_image = Some(control_image);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Pipeline execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PipelineState {
    #[default]
    Idle,
    Encoding,
    Denoising,
    Decoding,
    Complete,
    Failed,
    Cancelled,
}

/// Output of one run
#[derive(Debug, Clone)]
pub struct DiffusionResult {
    /// Final latents
    pub latents: Tensor<f32>,
    /// Decoded image, when an autoencoder is attached
    pub image: Option<Tensor<f32>>,
    /// Denoising steps completed (scheduler calls for multi-order solvers count once)
    pub steps: usize,
    pub elapsed: Duration,
}

/// Blend `uncond + scale * (cond - uncond)`
pub fn apply_guidance(
    conditional: &Tensor<f32>,
    unconditional: &Tensor<f32>,
    scale: f32,
) -> PipelineResult<Tensor<f32>> {
    Ok(unconditional.to_linear_combination(1.0 - scale, conditional, scale)?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIFFUSION PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Denoising loop over a model collaborator
pub struct DiffusionPipeline {
    denoiser: Arc<dyn DenoiseModel>,
    autoencoder: Option<Arc<dyn AutoEncoder>>,
    state: Arc<RwLock<PipelineState>>,
}

impl DiffusionPipeline {
    pub fn new(denoiser: Arc<dyn DenoiseModel>) -> Self {
        Self {
            denoiser,
            autoencoder: None,
            state: Arc::new(RwLock::new(PipelineState::Idle)),
        }
    }

    pub fn with_autoencoder(mut self, autoencoder: Arc<dyn AutoEncoder>) -> Self {
        self.autoencoder = Some(autoencoder);
        self
    }

    /// Get current state
    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.write() = state;
    }

    /// Reject option/model combinations before any model call
    pub fn check(&self, options: &DiffusionOptions, input: &DiffusionInput) -> PipelineResult<()> {
        options.validate()?;

        match options.process_type {
            ProcessType::ControlNetImage => {
                if !self.denoiser.supports_control_net() {
                    return Err(PipelineError::UnsupportedCombination(
                        "control-net requested but the model has no control-net support".into(),
                    ));
                }
                if input.control_image.is_none() {
                    return Err(PipelineError::InvalidOptions(
                        "control-net requires a control image".into(),
                    ));
                }
            }
            process_type if process_type.needs_image() => {
                if input.image.is_none() {
                    return Err(PipelineError::InvalidOptions(format!(
                        "{process_type:?} requires an input image"
                    )));
                }
                if self.autoencoder.is_none() {
                    return Err(PipelineError::UnsupportedCombination(format!(
                        "{process_type:?} requires an autoencoder"
                    )));
                }
            }
            _ => {}
        }

        if options.is_guidance_enabled() && input.prompt.unconditional.is_none() {
            log::warn!(
                "Guidance scale {} without unconditional embeddings, running unguided",
                options.guidance_scale
            );
        }
        Ok(())
    }

    /// Run the whole pipeline
    pub fn run(
        &self,
        options: &DiffusionOptions,
        input: &DiffusionInput,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<DiffusionResult> {
        let result = self.run_inner(options, input, cancel, progress);
        self.set_state(match &result {
            Ok(_) => PipelineState::Complete,
            Err(e) if e.is_cancelled() => PipelineState::Cancelled,
            Err(_) => PipelineState::Failed,
        });
        if result.is_err() && options.memory_mode == MemoryMode::Minimum {
            self.denoiser.unload();
        }
        result
    }

    fn run_inner(
        &self,
        options: &DiffusionOptions,
        input: &DiffusionInput,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<DiffusionResult> {
        self.check(options, input)?;
        let timer = RunTimer::start();

        let mut scheduler = create_scheduler(options.scheduler, options.scheduler_options())?;
        scheduler.initialize(options.effective_strength())?;

        let encoded = self.encode_image(options, input)?;
        cancel.check()?;

        let noise = scheduler.create_random_sample(&options.latent_dimensions());
        let latents = match (options.process_type, &encoded) {
            (ProcessType::ImageToImage, Some(image_latents)) => {
                let first = scheduler.timesteps().first().copied().ok_or_else(|| {
                    PipelineError::InvalidOptions("strength leaves no timesteps".into())
                })?;
                scheduler.scale_noise(first, image_latents, &noise)?
            }
            _ => noise.to_multiply_scalar(scheduler.state().start_sigma()),
        };

        self.set_state(PipelineState::Denoising);
        let image_latents = match options.process_type {
            ProcessType::ImageEdit => encoded.as_ref(),
            _ => None,
        };
        let (latents, steps) = self.denoise(
            scheduler.as_mut(),
            options,
            input,
            image_latents,
            latents,
            cancel,
            progress,
            &timer,
        )?;
        scheduler.dispose();

        if options.memory_mode == MemoryMode::Minimum {
            self.denoiser.unload();
        }

        let image = match &self.autoencoder {
            Some(autoencoder) => {
                cancel.check()?;
                self.set_state(PipelineState::Decoding);
                let image = autoencoder.decode(&latents)?;
                if options.memory_mode == MemoryMode::Minimum {
                    autoencoder.unload();
                }
                Some(image)
            }
            None => None,
        };

        log::debug!(
            "Diffusion finished: {} steps with {} in {:?}",
            steps,
            options.scheduler,
            timer.elapsed()
        );
        Ok(DiffusionResult {
            latents,
            image,
            steps,
            elapsed: timer.elapsed(),
        })
    }

    fn encode_image(
        &self,
        options: &DiffusionOptions,
        input: &DiffusionInput,
    ) -> PipelineResult<Option<Tensor<f32>>> {
        if !options.process_type.needs_image() {
            return Ok(None);
        }
        let (Some(autoencoder), Some(image)) = (&self.autoencoder, &input.image) else {
            return Ok(None);
        };

        self.set_state(PipelineState::Encoding);
        let latents = autoencoder.encode(image)?;
        if options.memory_mode == MemoryMode::Minimum {
            autoencoder.unload();
        }
        Ok(Some(latents))
    }

    #[allow(clippy::too_many_arguments)]
    fn denoise(
        &self,
        scheduler: &mut dyn Scheduler,
        options: &DiffusionOptions,
        input: &DiffusionInput,
        image_latents: Option<&Tensor<f32>>,
        mut latents: Tensor<f32>,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
        timer: &RunTimer,
    ) -> PipelineResult<(Tensor<f32>, usize)> {
        let timesteps = scheduler.timesteps().to_vec();
        let order = scheduler.order().max(1);
        let total = timesteps.len().div_ceil(order);
        let guidance = match &input.prompt.unconditional {
            Some(unconditional) if options.is_guidance_enabled() => Some(unconditional),
            _ => None,
        };
        let control_image = match options.process_type {
            ProcessType::ControlNetImage => input.control_image.as_ref(),
            _ => None,
        };

        let mut completed = 0;
        for timestep in timesteps {
            cancel.check()?;

            let model_input = scheduler.scale_input(timestep, &latents)?;
            let request = |embeddings| DenoiseInput {
                sample: &model_input,
                timestep,
                encoder_hidden_states: embeddings,
                image_latents,
                control_image,
                control_scale: options.control_net_scale,
            };

            let prediction = match guidance {
                Some(unconditional) => {
                    let (conditional, unconditional) = rayon::join(
                        || self.denoiser.predict(&request(&input.prompt.conditional)),
                        || self.denoiser.predict(&request(unconditional)),
                    );
                    apply_guidance(&conditional?, &unconditional?, options.guidance_scale)?
                }
                None => self.denoiser.predict(&request(&input.prompt.conditional))?,
            };

            latents = scheduler.step(timestep, &prediction, &latents)?.sample;

            if scheduler.is_final_order() {
                completed += 1;
                let mut record = timer.record(completed, total);
                if progress.wants_sample() {
                    record = record.with_sample(latents.clone());
                }
                progress.report(record);
            }
        }
        Ok((latents, completed))
    }
}
