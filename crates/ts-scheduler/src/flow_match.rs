//! Flow-matching Euler samplers
//!
//! The model predicts velocity along the straight path from data to
//! noise. The discrete variant integrates it directly; the dynamic variant
//! re-noises the clean estimate with a fresh draw at every step.

use ts_core::Tensor;

use crate::error::SchedulerResult;
use crate::options::SchedulerOptions;
use crate::schedule::{dynamic_shift_mu, linspace, time_shift};
use crate::state::{ScheduleArrays, SchedulerCore};
use crate::{Scheduler, SchedulerKind, SchedulerOutput, SchedulerState};

#[derive(Debug)]
pub struct FlowMatchEulerScheduler {
    core: SchedulerCore,
    stochastic: bool,
}

impl FlowMatchEulerScheduler {
    /// Deterministic Euler integration of the velocity field
    pub fn discrete(options: SchedulerOptions) -> SchedulerResult<Self> {
        Ok(Self {
            core: SchedulerCore::new(options)?,
            stochastic: false,
        })
    }

    /// Stochastic variant drawing fresh noise every step
    pub fn dynamic(options: SchedulerOptions) -> SchedulerResult<Self> {
        Ok(Self {
            core: SchedulerCore::new(options)?,
            stochastic: true,
        })
    }

    fn shifted_sigma(options: &SchedulerOptions, t: f32) -> f32 {
        if options.use_dynamic_shifting {
            let seq_len = options
                .image_seq_len
                .unwrap_or(options.base_image_seq_len);
            time_shift(dynamic_shift_mu(options, seq_len), t)
        } else {
            options.shift * t / (1.0 + (options.shift - 1.0) * t)
        }
    }
}

impl Scheduler for FlowMatchEulerScheduler {
    fn kind(&self) -> SchedulerKind {
        if self.stochastic {
            SchedulerKind::FlowMatchEulerDynamic
        } else {
            SchedulerKind::FlowMatchEulerDiscrete
        }
    }

    fn options(&self) -> &SchedulerOptions {
        self.core.options()
    }

    fn initialize(&mut self, strength: f32) -> SchedulerResult<()> {
        let start = self.core.start_step(strength)?;
        let options = self.core.options();
        let train = options.train_timesteps as f32;

        let mut sigmas: Vec<f32> = linspace(1.0, 1.0 / train as f64, options.inference_steps)
            .into_iter()
            .map(|t| Self::shifted_sigma(options, t as f32))
            .collect();
        let timesteps: Vec<f32> = sigmas.iter().map(|s| s * train).collect();
        sigmas.push(0.0);

        self.core.install(
            ScheduleArrays {
                betas: Vec::new(),
                alphas: Vec::new(),
                alphas_cumprod: Vec::new(),
                timesteps,
                sigmas,
                start_sigma: 1.0,
            },
            start,
        );
        Ok(())
    }

    fn scale_input(&self, _timestep: f32, sample: &Tensor<f32>) -> SchedulerResult<Tensor<f32>> {
        self.core.ensure_initialized()?;
        Ok(sample.clone())
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

        let pred_original = sample.to_linear_combination(1.0, model_output, -sigma)?;
        let prev_sample = if self.stochastic {
            let noise = self.core.random_sample(sample.dimensions());
            pred_original.to_linear_combination(1.0 - sigma_next, &noise, sigma_next)?
        } else {
            sample.to_linear_combination(1.0, model_output, sigma_next - sigma)?
        };

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
        let sigma = self.core.sigma(index);
        Ok(noise.to_linear_combination(sigma, sample, 1.0 - sigma)?)
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_unshifted_sigmas_are_linear() {
        let mut scheduler =
            FlowMatchEulerScheduler::discrete(SchedulerOptions::default().with_steps(3)).unwrap();
        scheduler.initialize(1.0).unwrap();
        let sigmas = scheduler.sigmas();
        assert_relative_eq!(sigmas[0], 1.0);
        assert_relative_eq!(sigmas[2], 0.001, epsilon = 1e-6);
        assert_eq!(sigmas[3], 0.0);
        assert_relative_eq!(scheduler.timesteps()[0], 1000.0);
    }

    #[test]
    fn test_shift_pushes_sigmas_up() {
        let options = SchedulerOptions {
            shift: 3.0,
            ..SchedulerOptions::default().with_steps(5)
        };
        let mut shifted = FlowMatchEulerScheduler::discrete(options).unwrap();
        shifted.initialize(1.0).unwrap();
        let mut plain =
            FlowMatchEulerScheduler::discrete(SchedulerOptions::default().with_steps(5)).unwrap();
        plain.initialize(1.0).unwrap();
        assert!(shifted.sigmas()[2] > plain.sigmas()[2]);
    }

    #[test]
    fn test_discrete_integrates_constant_velocity() {
        let mut scheduler =
            FlowMatchEulerScheduler::discrete(SchedulerOptions::default().with_steps(4)).unwrap();
        scheduler.initialize(1.0).unwrap();
        let velocity = Tensor::filled(&[2], 1.0f32);
        let mut sample = Tensor::filled(&[2], 1.0f32);
        for t in scheduler.timesteps().to_vec() {
            sample = scheduler.step(t, &velocity, &sample).unwrap().sample;
        }
        // Travels the whole sigma range from 1 to 0
        assert_relative_eq!(sample.as_slice()[0], 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_dynamic_kind() {
        let scheduler = FlowMatchEulerScheduler::dynamic(SchedulerOptions::flux()).unwrap();
        assert_eq!(scheduler.kind(), SchedulerKind::FlowMatchEulerDynamic);
    }
}
