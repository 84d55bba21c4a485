//! Euler discrete sampler (Karras et al. 2022, Algorithm 2) with optional churn

use std::f32::consts::SQRT_2;

use ts_core::Tensor;

use crate::error::SchedulerResult;
use crate::options::SchedulerOptions;
use crate::schedule::{DiscreteSchedule, initial_noise_sigma};
use crate::state::{
    ScheduleArrays, SchedulerCore, predicted_original, scale_by_sigma, warn_sample_prediction,
};
use crate::{Scheduler, SchedulerKind, SchedulerOutput, SchedulerState};

#[derive(Debug)]
pub struct EulerScheduler {
    core: SchedulerCore,
}

impl EulerScheduler {
    pub fn new(options: SchedulerOptions) -> SchedulerResult<Self> {
        warn_sample_prediction("Euler", options.prediction_type);
        Ok(Self {
            core: SchedulerCore::new(options)?,
        })
    }

    /// Churn factor for a step at `sigma`
    fn gamma(&self, sigma: f32) -> f32 {
        let options = self.core.options();
        if options.s_churn <= 0.0 || sigma < options.s_tmin || sigma > options.churn_tmax() {
            return 0.0;
        }
        // Full schedule length, independent of strength truncation
        let steps = options.inference_steps.max(1);
        (options.s_churn / steps as f32).min(SQRT_2 - 1.0)
    }
}

impl Scheduler for EulerScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Euler
    }

    fn options(&self) -> &SchedulerOptions {
        self.core.options()
    }

    fn initialize(&mut self, strength: f32) -> SchedulerResult<()> {
        let start = self.core.start_step(strength)?;
        let options = self.core.options();
        let schedule = DiscreteSchedule::build(options)?;
        let start_sigma = initial_noise_sigma(&schedule.sigmas, options.timestep_spacing);
        self.core.install(
            ScheduleArrays {
                betas: schedule.betas,
                alphas: schedule.alphas,
                alphas_cumprod: schedule.alphas_cumprod,
                timesteps: schedule.timesteps,
                sigmas: schedule.sigmas,
                start_sigma,
            },
            start,
        );
        Ok(())
    }

    fn scale_input(&self, timestep: f32, sample: &Tensor<f32>) -> SchedulerResult<Tensor<f32>> {
        let index = self.core.pending_index(timestep)?;
        Ok(scale_by_sigma(sample, self.core.sigma(index)))
    }

    fn step(
        &mut self,
        timestep: f32,
        model_output: &Tensor<f32>,
        sample: &Tensor<f32>,
    ) -> SchedulerResult<SchedulerOutput> {
        let index = self.core.pending_index(timestep)?;
        let sigma = self.core.sigma(index);
        let sigma_next = self.core.sigma(index + 1);

        let gamma = self.gamma(sigma);
        let sigma_hat = sigma * (gamma + 1.0);

        let mut sample = sample.clone();
        if gamma > 0.0 {
            let noise = self.core.random_sample(sample.dimensions());
            let scale = (sigma_hat * sigma_hat - sigma * sigma).sqrt() * self.options().s_noise;
            sample.add_scaled(&noise, scale)?;
        }

        let prediction = self.options().prediction_type;
        let pred_original = predicted_original(prediction, sigma_hat, model_output, &sample)?;

        let mut derivative = sample.to_subtract(&pred_original)?;
        derivative.divide_scalar(sigma_hat);

        let mut prev_sample = sample;
        prev_sample.add_scaled(&derivative, sigma_next - sigma_hat)?;

        self.core.advance();
        Ok(SchedulerOutput::new(prev_sample).with_pred_original(pred_original))
    }

    fn scale_noise(
        &self,
        timestep: f32,
        sample: &Tensor<f32>,
        noise: &Tensor<f32>,
    ) -> SchedulerResult<Tensor<f32>> {
        let index = self.core.index_of(timestep)?;
        Ok(sample.to_linear_combination(1.0, noise, self.core.sigma(index))?)
    }

    fn create_random_sample(&mut self, dimensions: &[usize]) -> Tensor<f32> {
        self.core.random_sample(dimensions)
    }

    fn state(&self) -> &SchedulerState {
        self.core.state()
    }

    fn dispose(&mut self) {
        self.core.dispose();
    }
}
