//! Scheduler configuration

use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};

/// Beta schedule used to build the training noise curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BetaScheduleType {
    #[serde(rename = "linear")]
    Linear,
    /// Linear in sqrt(beta), squared
    #[default]
    #[serde(rename = "scaled_linear")]
    ScaledLinear,
    /// Derived from a cosine (or exponential) alpha-bar curve, capped
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
    #[serde(rename = "sigmoid")]
    Sigmoid,
}

/// Alpha-bar transform used by `SquaredCosCapV2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AlphaTransformType {
    #[default]
    #[serde(rename = "cosine")]
    Cosine,
    #[serde(rename = "exp")]
    Exponential,
}

/// What the network predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PredictionType {
    /// Added noise
    #[default]
    #[serde(rename = "epsilon")]
    Epsilon,
    /// Velocity (v-prediction)
    #[serde(rename = "v_prediction")]
    VariablePrediction,
    /// Clean sample
    #[serde(rename = "sample")]
    Sample,
}

/// How inference timesteps are spread across the training range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimestepSpacingType {
    #[default]
    #[serde(rename = "linspace")]
    Linspace,
    #[serde(rename = "leading")]
    Leading,
    #[serde(rename = "trailing")]
    Trailing,
}

/// DDPM posterior variance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VarianceType {
    #[default]
    #[serde(rename = "fixed_small")]
    FixedSmall,
    #[serde(rename = "fixed_small_log")]
    FixedSmallLog,
    #[serde(rename = "fixed_large")]
    FixedLarge,
    #[serde(rename = "fixed_large_log")]
    FixedLargeLog,
    #[serde(rename = "learned")]
    Learned,
    #[serde(rename = "learned_range")]
    LearnedRange,
}

/// Scheduler options, immutable once handed to a scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Seed for every stochastic draw the scheduler makes
    pub seed: u64,
    /// Number of inference steps
    pub inference_steps: usize,
    /// Length of the training noise schedule
    pub train_timesteps: usize,
    /// Offset added to `Leading` timesteps
    pub steps_offset: usize,

    pub beta_start: f32,
    pub beta_end: f32,
    pub beta_schedule: BetaScheduleType,
    /// Explicit betas, overriding `beta_schedule`
    pub trained_betas: Option<Vec<f32>>,
    pub alpha_transform: AlphaTransformType,
    /// Upper bound for alpha-bar derived betas
    pub maximum_beta: f32,

    pub prediction_type: PredictionType,
    pub variance_type: VarianceType,
    pub timestep_spacing: TimestepSpacingType,

    /// Clamp the predicted clean sample to +/- `clip_sample_range` (DDPM)
    pub clip_sample: bool,
    pub clip_sample_range: f32,
    /// Dynamic thresholding of the predicted clean sample (DDPM)
    pub thresholding: bool,
    pub dynamic_thresholding_ratio: f32,
    pub sample_max_value: f32,

    /// Karras sigma reparametrization
    pub use_karras_sigmas: bool,
    pub sigma_min: Option<f32>,
    pub sigma_max: Option<f32>,
    pub rho: f32,

    /// Euler churn
    pub s_churn: f32,
    pub s_tmin: f32,
    /// Upper churn bound, 0 = unbounded
    pub s_tmax: f32,
    pub s_noise: f32,

    /// Flow-match sigma shift
    pub shift: f32,
    /// Resolution-dependent exponential shift instead of `shift`
    pub use_dynamic_shifting: bool,
    pub base_shift: f32,
    pub max_shift: f32,
    pub base_image_seq_len: usize,
    pub max_image_seq_len: usize,
    /// Latent token count of the image being generated
    pub image_seq_len: Option<usize>,

    /// Wuerstchen timestep warp exponent
    pub scaler: f32,
    /// Wuerstchen cosine offset
    pub cosine_offset: f32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            inference_steps: 30,
            train_timesteps: 1000,
            steps_offset: 0,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaScheduleType::ScaledLinear,
            trained_betas: None,
            alpha_transform: AlphaTransformType::Cosine,
            maximum_beta: 0.999,
            prediction_type: PredictionType::Epsilon,
            variance_type: VarianceType::FixedSmall,
            timestep_spacing: TimestepSpacingType::Linspace,
            clip_sample: false,
            clip_sample_range: 1.0,
            thresholding: false,
            dynamic_thresholding_ratio: 0.995,
            sample_max_value: 1.0,
            use_karras_sigmas: false,
            sigma_min: None,
            sigma_max: None,
            rho: 7.0,
            s_churn: 0.0,
            s_tmin: 0.0,
            s_tmax: 0.0,
            s_noise: 1.0,
            shift: 1.0,
            use_dynamic_shifting: false,
            base_shift: 0.5,
            max_shift: 1.15,
            base_image_seq_len: 256,
            max_image_seq_len: 4096,
            image_seq_len: None,
            scaler: 1.0,
            cosine_offset: 0.008,
        }
    }
}

impl SchedulerOptions {
    /// Stable Diffusion 1.x/XL defaults
    pub fn stable_diffusion() -> Self {
        Self {
            inference_steps: 30,
            beta_schedule: BetaScheduleType::ScaledLinear,
            timestep_spacing: TimestepSpacingType::Leading,
            steps_offset: 1,
            ..Default::default()
        }
    }

    /// Flux / SD3 flow-matching defaults
    pub fn flux() -> Self {
        Self {
            inference_steps: 28,
            shift: 3.0,
            use_dynamic_shifting: true,
            image_seq_len: Some(4096),
            ..Default::default()
        }
    }

    /// Wuerstchen prior defaults
    pub fn wuerstchen() -> Self {
        Self {
            inference_steps: 20,
            scaler: 1.0,
            cosine_offset: 0.008,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.inference_steps = steps;
        self
    }

    /// Upper churn bound with the 0 = unbounded convention resolved
    pub fn churn_tmax(&self) -> f32 {
        if self.s_tmax > 0.0 {
            self.s_tmax
        } else {
            f32::INFINITY
        }
    }

    /// Reject values no scheduler can run with
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.train_timesteps < 2 {
            return Err(SchedulerError::InvalidOptions(format!(
                "train_timesteps must be at least 2, got {}",
                self.train_timesteps
            )));
        }
        if self.inference_steps == 0 || self.inference_steps > self.train_timesteps {
            return Err(SchedulerError::InvalidOptions(format!(
                "inference_steps must be in 1..={}, got {}",
                self.train_timesteps, self.inference_steps
            )));
        }
        if self.timestep_spacing == TimestepSpacingType::Leading {
            let last = (self.inference_steps - 1) * (self.train_timesteps / self.inference_steps)
                + self.steps_offset;
            if last >= self.train_timesteps {
                return Err(SchedulerError::InvalidOptions(format!(
                    "leading timestep {last} (steps_offset {}) exceeds train_timesteps {}",
                    self.steps_offset, self.train_timesteps
                )));
            }
        }
        if !(self.beta_start > 0.0 && self.beta_end >= self.beta_start) {
            return Err(SchedulerError::InvalidOptions(format!(
                "beta range ({}, {}) is not increasing and positive",
                self.beta_start, self.beta_end
            )));
        }
        if !(self.maximum_beta > 0.0 && self.maximum_beta < 1.0) {
            return Err(SchedulerError::InvalidOptions(format!(
                "maximum_beta must be in (0, 1), got {}",
                self.maximum_beta
            )));
        }
        if let Some(betas) = &self.trained_betas {
            if betas.len() != self.train_timesteps {
                return Err(SchedulerError::InvalidOptions(format!(
                    "trained_betas has {} entries, expected {}",
                    betas.len(),
                    self.train_timesteps
                )));
            }
        }
        if self.shift <= 0.0 || self.rho <= 0.0 {
            return Err(SchedulerError::InvalidOptions(
                "shift and rho must be positive".into(),
            ));
        }
        if self.use_dynamic_shifting && self.max_image_seq_len <= self.base_image_seq_len {
            return Err(SchedulerError::InvalidOptions(
                "max_image_seq_len must exceed base_image_seq_len".into(),
            ));
        }
        Ok(())
    }
}
