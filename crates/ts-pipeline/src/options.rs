//! Diffusion run configuration

use serde::{Deserialize, Serialize};
use ts_runtime::MemoryMode;
use ts_scheduler::{SchedulerKind, SchedulerOptions};

use crate::error::{PipelineError, PipelineResult};

/// What a diffusion run starts from and conditions on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessType {
    /// Pure noise, prompt only
    #[default]
    TextToImage,
    /// Noised input image, partial denoise controlled by `strength`
    ImageToImage,
    /// Full denoise conditioned on the input image latents
    ImageEdit,
    /// Full denoise guided by a control image
    ControlNetImage,
}

impl ProcessType {
    /// Modes that read an input image
    pub fn needs_image(&self) -> bool {
        matches!(self, ProcessType::ImageToImage | ProcessType::ImageEdit)
    }
}

/// Options for one diffusion run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionOptions {
    pub process_type: ProcessType,
    pub scheduler: SchedulerKind,
    /// Scheduler tuning; `seed` and `steps` below take precedence
    pub scheduler_options: SchedulerOptions,
    pub seed: u64,
    pub steps: usize,
    /// Fraction of the schedule run for image-to-image (0, 1]
    pub strength: f32,
    /// Classifier-free guidance scale, guidance is off at 1.0 or below
    pub guidance_scale: f32,
    pub control_net_scale: f32,
    pub width: usize,
    pub height: usize,
    pub batch: usize,
    pub latent_channels: usize,
    /// Pixel-to-latent downscale of the autoencoder
    pub vae_scale_factor: usize,
    pub memory_mode: MemoryMode,
}

impl Default for DiffusionOptions {
    fn default() -> Self {
        Self {
            process_type: ProcessType::TextToImage,
            scheduler: SchedulerKind::Euler,
            scheduler_options: SchedulerOptions::stable_diffusion(),
            seed: 0,
            steps: 30,
            strength: 1.0,
            guidance_scale: 7.5,
            control_net_scale: 1.0,
            width: 512,
            height: 512,
            batch: 1,
            latent_channels: 4,
            vae_scale_factor: 8,
            memory_mode: MemoryMode::Maximum,
        }
    }
}

impl DiffusionOptions {
    /// Image-to-image at `strength`
    pub fn image_to_image(strength: f32) -> Self {
        Self {
            process_type: ProcessType::ImageToImage,
            strength,
            ..Default::default()
        }
    }

    /// Flow-matching transformer defaults (Flux style)
    pub fn flux() -> Self {
        Self {
            scheduler: SchedulerKind::FlowMatchEulerDynamic,
            scheduler_options: SchedulerOptions::flux(),
            steps: 28,
            guidance_scale: 3.5,
            width: 1024,
            height: 1024,
            latent_channels: 16,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Scheduler options with this run's seed and step count applied
    pub fn scheduler_options(&self) -> SchedulerOptions {
        self.scheduler_options
            .clone()
            .with_seed(self.seed)
            .with_steps(self.steps)
    }

    /// Strength handed to the scheduler; only image-to-image truncates
    pub fn effective_strength(&self) -> f32 {
        match self.process_type {
            ProcessType::ImageToImage => self.strength,
            _ => 1.0,
        }
    }

    /// `[batch, channels, height / scale, width / scale]`
    pub fn latent_dimensions(&self) -> [usize; 4] {
        [
            self.batch,
            self.latent_channels,
            self.height / self.vae_scale_factor,
            self.width / self.vae_scale_factor,
        ]
    }

    pub fn is_guidance_enabled(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.steps == 0 {
            return Err(PipelineError::InvalidOptions("steps must be at least 1".into()));
        }
        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(PipelineError::InvalidOptions(format!(
                "strength must be in (0, 1], got {}",
                self.strength
            )));
        }
        if self.batch == 0 || self.latent_channels == 0 || self.vae_scale_factor == 0 {
            return Err(PipelineError::InvalidOptions(
                "batch, latent channels and scale factor must be non-zero".into(),
            ));
        }
        if self.width % self.vae_scale_factor != 0 || self.height % self.vae_scale_factor != 0 {
            return Err(PipelineError::InvalidOptions(format!(
                "{}x{} is not a multiple of {}",
                self.width, self.height, self.vae_scale_factor
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::InvalidOptions("empty image size".into()));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(PipelineError::InvalidOptions(format!(
                "guidance scale must be non-negative, got {}",
                self.guidance_scale
            )));
        }
        self.scheduler_options().validate()?;
        Ok(())
    }
}
