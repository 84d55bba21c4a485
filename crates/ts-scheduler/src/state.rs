//! Per-instance scheduler state and the bookkeeping every scheduler shares

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use ts_core::Tensor;

use crate::error::{SchedulerError, SchedulerResult};
use crate::options::{PredictionType, SchedulerOptions};

/// Arrays and counters produced by `initialize`
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub(crate) betas: Vec<f32>,
    pub(crate) alphas: Vec<f32>,
    pub(crate) alphas_cumprod: Vec<f32>,
    pub(crate) sigmas: Vec<f32>,
    pub(crate) timesteps: Vec<f32>,
    pub(crate) current_step: usize,
    pub(crate) start_step: usize,
    pub(crate) start_sigma: f32,
    pub(crate) initialized: bool,
}

impl SchedulerState {
    pub fn betas(&self) -> &[f32] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f32] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }

    /// One sigma per timestep plus a trailing 0
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    /// Descending timesteps, already truncated by strength
    pub fn timesteps(&self) -> &[f32] {
        &self.timesteps
    }

    /// Index of the next `step` call
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn total_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// Steps skipped because of strength < 1
    pub fn start_step(&self) -> usize {
        self.start_step
    }

    /// Standard deviation pure noise is scaled by before the first step
    pub fn start_sigma(&self) -> f32 {
        self.start_sigma
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True once every timestep has been stepped
    pub fn is_complete(&self) -> bool {
        self.initialized && self.current_step >= self.timesteps.len()
    }
}

/// Full-length arrays handed to [`SchedulerCore::install`]
pub(crate) struct ScheduleArrays {
    pub betas: Vec<f32>,
    pub alphas: Vec<f32>,
    pub alphas_cumprod: Vec<f32>,
    pub timesteps: Vec<f32>,
    pub sigmas: Vec<f32>,
    pub start_sigma: f32,
}

/// Options, state and the seeded generator owned by one scheduler
#[derive(Debug)]
pub(crate) struct SchedulerCore {
    options: SchedulerOptions,
    state: SchedulerState,
    rng: ChaCha8Rng,
}

impl SchedulerCore {
    pub fn new(options: SchedulerOptions) -> SchedulerResult<Self> {
        options.validate()?;
        let rng = ChaCha8Rng::seed_from_u64(options.seed);
        Ok(Self {
            options,
            state: SchedulerState::default(),
            rng,
        })
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Number of leading steps strength skips
    pub fn start_step(&self, strength: f32) -> SchedulerResult<usize> {
        if !(strength > 0.0 && strength <= 1.0) {
            return Err(SchedulerError::InvalidStrength(strength));
        }
        let steps = self.options.inference_steps;
        let init_steps = (steps as f32 * strength).floor() as usize;
        Ok(steps.saturating_sub(init_steps).min(steps - 1))
    }

    /// Store a fresh schedule, dropping the first `start` timesteps and sigmas
    pub fn install(&mut self, arrays: ScheduleArrays, start: usize) {
        let ScheduleArrays {
            betas,
            alphas,
            alphas_cumprod,
            mut timesteps,
            mut sigmas,
            start_sigma,
        } = arrays;
        let start = start.min(timesteps.len().saturating_sub(1));
        timesteps.drain(..start);
        sigmas.drain(..start.min(sigmas.len()));

        self.state = SchedulerState {
            betas,
            alphas,
            alphas_cumprod,
            sigmas,
            timesteps,
            current_step: 0,
            start_step: start,
            start_sigma,
            initialized: true,
        };
        log::debug!(
            "Scheduler initialized: {} steps (skipped {}), start sigma {:.4}",
            self.state.timesteps.len(),
            start,
            start_sigma
        );
    }

    /// Record skipped steps for schedules truncated before `install`
    pub fn set_start_step(&mut self, start: usize) {
        self.state.start_step = start;
    }

    pub fn ensure_initialized(&self) -> SchedulerResult<()> {
        if self.state.initialized {
            Ok(())
        } else {
            Err(SchedulerError::NotInitialized)
        }
    }

    /// Index of the pending step, checked against the timestep the caller passed
    pub fn pending_index(&self, timestep: f32) -> SchedulerResult<usize> {
        self.ensure_initialized()?;
        let step = self.state.current_step;
        let total = self.state.timesteps.len();
        let expected = *self
            .state
            .timesteps
            .get(step)
            .ok_or(SchedulerError::StepOutOfRange { step, total })?;
        if (expected - timestep).abs() > 1e-3 * expected.abs().max(1.0) {
            return Err(SchedulerError::TimestepMismatch {
                step,
                expected,
                got: timestep,
            });
        }
        Ok(step)
    }

    /// Position of `timestep` anywhere in the schedule
    pub fn index_of(&self, timestep: f32) -> SchedulerResult<usize> {
        self.ensure_initialized()?;
        self.state
            .timesteps
            .iter()
            .position(|&t| (t - timestep).abs() <= 1e-3 * t.abs().max(1.0))
            .ok_or(SchedulerError::UnknownTimestep(timestep))
    }

    pub fn advance(&mut self) {
        self.state.current_step += 1;
    }

    pub fn sigma(&self, index: usize) -> f32 {
        self.state.sigmas.get(index).copied().unwrap_or(0.0)
    }

    pub fn timestep(&self, index: usize) -> Option<f32> {
        self.state.timesteps.get(index).copied()
    }

    /// Standard normal tensor from the scheduler's generator
    pub fn random_sample(&mut self, dimensions: &[usize]) -> Tensor<f32> {
        let mut tensor = Tensor::zeros(dimensions);
        for value in tensor.as_mut_slice() {
            *value = self.rng.sample(StandardNormal);
        }
        tensor
    }

    pub fn dispose(&mut self) {
        self.state = SchedulerState::default();
    }
}

/// Clean-sample estimate for the sigma-parameterized samplers
///
/// `Sample` prediction is passed through untouched; these samplers were
/// never wired for it.
pub(crate) fn predicted_original(
    prediction: PredictionType,
    sigma: f32,
    model_output: &Tensor<f32>,
    sample: &Tensor<f32>,
) -> SchedulerResult<Tensor<f32>> {
    let predicted = match prediction {
        PredictionType::Epsilon => sample.to_linear_combination(1.0, model_output, -sigma)?,
        PredictionType::VariablePrediction => {
            let denominator = sigma * sigma + 1.0;
            sample.to_linear_combination(
                1.0 / denominator,
                model_output,
                -sigma / denominator.sqrt(),
            )?
        }
        PredictionType::Sample => model_output.clone(),
    };
    Ok(predicted)
}

/// `sample / sqrt(sigma^2 + 1)`
pub(crate) fn scale_by_sigma(sample: &Tensor<f32>, sigma: f32) -> Tensor<f32> {
    sample.to_divide_scalar((sigma * sigma + 1.0).sqrt())
}

/// Warn at initialization about prediction modes the sigma samplers ignore
pub(crate) fn warn_sample_prediction(name: &str, prediction: PredictionType) {
    if prediction == PredictionType::Sample {
        log::warn!("{name}: sample prediction is not implemented, model output is used as-is");
    }
}
