//! Euler ancestral sampler

use ts_core::Tensor;

use crate::error::SchedulerResult;
use crate::options::SchedulerOptions;
use crate::schedule::{DiscreteSchedule, initial_noise_sigma, zero_if_nan};
use crate::state::{
    ScheduleArrays, SchedulerCore, predicted_original, scale_by_sigma, warn_sample_prediction,
};
use crate::{Scheduler, SchedulerKind, SchedulerOutput, SchedulerState};

#[derive(Debug)]
pub struct EulerAncestralScheduler {
    core: SchedulerCore,
}

impl EulerAncestralScheduler {
    pub fn new(options: SchedulerOptions) -> SchedulerResult<Self> {
        warn_sample_prediction("EulerAncestral", options.prediction_type);
        Ok(Self {
            core: SchedulerCore::new(options)?,
        })
    }
}

/// Split the move from `from` to `to` into a deterministic and a noise part
pub(crate) fn ancestral_sigmas(from: f32, to: f32) -> (f32, f32) {
    let up = zero_if_nan((to * to * (from * from - to * to) / (from * from)).sqrt());
    let down = zero_if_nan((to * to - up * up).sqrt());
    (up, down)
}

impl Scheduler for EulerAncestralScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::EulerAncestral
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

        let prediction = self.options().prediction_type;
        let pred_original = predicted_original(prediction, sigma, model_output, sample)?;

        let (sigma_up, sigma_down) = ancestral_sigmas(sigma, sigma_next);

        let mut derivative = sample.to_subtract(&pred_original)?;
        derivative.divide_scalar(sigma);

        let mut prev_sample = sample.to_linear_combination(1.0, &derivative, sigma_down - sigma)?;
        let noise = self.core.random_sample(sample.dimensions());
        prev_sample.add_scaled(&noise, sigma_up)?;

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
