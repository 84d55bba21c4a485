//! KDPM2 ancestral sampler
//!
//! Second order: every base step except the last is split into a
//! first-order call at the base sigma and a second-order call at the
//! log-midpoint sigma. The reported timestep and sigma lists carry one
//! entry per call, so `n` base steps yield `2n - 1` calls.

use ts_core::Tensor;

use crate::error::SchedulerResult;
use crate::euler_ancestral::ancestral_sigmas;
use crate::options::SchedulerOptions;
use crate::schedule::{DiscreteSchedule, initial_noise_sigma, sigma_to_timestep, zero_if_nan};
use crate::state::{
    ScheduleArrays, SchedulerCore, predicted_original, scale_by_sigma, warn_sample_prediction,
};
use crate::{Scheduler, SchedulerKind, SchedulerOutput, SchedulerState};

#[derive(Debug, Default)]
struct BaseSigmas {
    sigmas: Vec<f32>,
    interpolated: Vec<f32>,
    up: Vec<f32>,
    down: Vec<f32>,
}

#[derive(Debug)]
pub struct KDpm2AncestralScheduler {
    core: SchedulerCore,
    base: BaseSigmas,
    /// Sample held between the two halves of a base step
    held_sample: Option<Tensor<f32>>,
}

impl KDpm2AncestralScheduler {
    pub fn new(options: SchedulerOptions) -> SchedulerResult<Self> {
        warn_sample_prediction("KDPM2Ancestral", options.prediction_type);
        Ok(Self {
            core: SchedulerCore::new(options)?,
            base: BaseSigmas::default(),
            held_sample: None,
        })
    }

    /// Base step and order of call `index`
    fn locate(index: usize) -> (usize, bool) {
        (index / 2, index % 2 == 0)
    }

    fn base_value(values: &[f32], index: usize) -> f32 {
        values.get(index).copied().unwrap_or(0.0)
    }
}

impl Scheduler for KDpm2AncestralScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::KDpm2Ancestral
    }

    fn options(&self) -> &SchedulerOptions {
        self.core.options()
    }

    fn order(&self) -> usize {
        2
    }

    fn is_final_order(&self) -> bool {
        let state = self.core.state();
        let step = state.current_step();
        // Odd count: the last call opened a base step that has a second half pending
        step == 0 || step % 2 == 0 || step >= state.total_steps()
    }

    fn initialize(&mut self, strength: f32) -> SchedulerResult<()> {
        let start = self.core.start_step(strength)?;
        let options = self.core.options();
        let schedule = DiscreteSchedule::build(options)?;
        let start_sigma = initial_noise_sigma(&schedule.sigmas, options.timestep_spacing);

        let n = schedule.timesteps.len();
        let sigmas = schedule.sigmas;
        let mut up = Vec::with_capacity(n + 1);
        let mut down = Vec::with_capacity(n + 1);
        for i in 0..n {
            let (u, d) = ancestral_sigmas(sigmas[i], sigmas[i + 1]);
            up.push(u);
            down.push(d);
        }
        up.push(0.0);
        down.push(0.0);

        let mut interpolated: Vec<f32> = sigmas
            .iter()
            .zip(&down)
            .map(|(&s, &d)| zero_if_nan(((s.ln() + d.ln()) * 0.5).exp()))
            .collect();
        let len = interpolated.len();
        for value in interpolated.iter_mut().skip(len.saturating_sub(2)) {
            *value = 0.0;
        }

        // Truncate per base step, then interleave
        let skip = start.min(n - 1);
        let base = BaseSigmas {
            sigmas: sigmas[skip..].to_vec(),
            interpolated: interpolated[skip..].to_vec(),
            up: up[skip..].to_vec(),
            down: down[skip..].to_vec(),
        };
        let base_timesteps = &schedule.timesteps[skip..];

        let mut call_timesteps = Vec::with_capacity(base_timesteps.len() * 2);
        let mut call_sigmas = Vec::with_capacity(base_timesteps.len() * 2);
        for (j, &t) in base_timesteps.iter().enumerate() {
            call_timesteps.push(t);
            call_sigmas.push(base.sigmas[j]);
            if j + 1 < base_timesteps.len() {
                let midpoint = base.interpolated[j];
                call_timesteps.push(sigma_to_timestep(midpoint, &schedule.log_sigmas).round());
                call_sigmas.push(midpoint);
            }
        }
        call_sigmas.push(0.0);

        self.base = base;
        self.held_sample = None;
        self.core.install(
            ScheduleArrays {
                betas: schedule.betas,
                alphas: schedule.alphas,
                alphas_cumprod: schedule.alphas_cumprod,
                timesteps: call_timesteps,
                sigmas: call_sigmas,
                start_sigma,
            },
            0,
        );
        self.core.set_start_step(skip);
        Ok(())
    }

    fn scale_input(&self, timestep: f32, sample: &Tensor<f32>) -> SchedulerResult<Tensor<f32>> {
        let index = self.core.pending_index(timestep)?;
        let (j, first_order) = Self::locate(index);
        let sigma = if first_order {
            Self::base_value(&self.base.sigmas, j)
        } else {
            Self::base_value(&self.base.interpolated, j)
        };
        Ok(scale_by_sigma(sample, sigma))
    }

    fn step(
        &mut self,
        timestep: f32,
        model_output: &Tensor<f32>,
        sample: &Tensor<f32>,
    ) -> SchedulerResult<SchedulerOutput> {
        let index = self.core.pending_index(timestep)?;
        let (j, first_order) = Self::locate(index);
        let prediction = self.options().prediction_type;

        let sigma = Self::base_value(&self.base.sigmas, j);
        let sigma_interpolated = Self::base_value(&self.base.interpolated, j);
        let sigma_up = Self::base_value(&self.base.up, j);
        let sigma_down = Self::base_value(&self.base.down, j);

        let noise = self.core.random_sample(sample.dimensions());

        let (prev_sample, pred_original) = if first_order {
            let pred_original = predicted_original(prediction, sigma, model_output, sample)?;
            let mut derivative = sample.to_subtract(&pred_original)?;
            derivative.divide_scalar(sigma);
            let prev = sample.to_linear_combination(1.0, &derivative, sigma_interpolated - sigma)?;
            self.held_sample = Some(sample.clone());
            (prev, pred_original)
        } else {
            let pred_original =
                predicted_original(prediction, sigma_interpolated, model_output, sample)?;
            let mut derivative = sample.to_subtract(&pred_original)?;
            derivative.divide_scalar(sigma_interpolated);
            let base = self.held_sample.take().unwrap_or_else(|| sample.clone());
            let mut prev = base.to_linear_combination(1.0, &derivative, sigma_down - sigma)?;
            prev.add_scaled(&noise, sigma_up)?;
            (prev, pred_original)
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
        Ok(sample.to_linear_combination(1.0, noise, self.core.sigma(index))?)
    }

    fn create_random_sample(&mut self, dimensions: &[usize]) -> Tensor<f32> {
        self.core.random_sample(dimensions)
    }

    fn state(&self) -> &SchedulerState {
        self.core.state()
    }

    fn dispose(&mut self) {
        self.base = BaseSigmas::default();
        self.held_sample = None;
        self.core.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn initialized(steps: usize) -> KDpm2AncestralScheduler {
        let options = SchedulerOptions::default().with_steps(steps);
        let mut scheduler = KDpm2AncestralScheduler::new(options).unwrap();
        scheduler.initialize(1.0).unwrap();
        scheduler
    }

    #[test]
    fn test_interleaved_lengths() {
        let scheduler = initialized(10);
        assert_eq!(scheduler.timesteps().len(), 19);
        assert_eq!(scheduler.sigmas().len(), 20);
        assert_eq!(*scheduler.sigmas().last().unwrap(), 0.0);
        assert_eq!(scheduler.order(), 2);
    }

    #[test]
    fn test_final_order_alternates() {
        let mut scheduler = initialized(3);
        let x = Tensor::filled(&[4], 0.5f32);
        let zero = Tensor::zeros(&[4]);
        let mut finals = Vec::new();
        for t in scheduler.timesteps().to_vec() {
            scheduler.step(t, &zero, &x).unwrap();
            finals.push(scheduler.is_final_order());
        }
        assert_eq!(finals, vec![false, true, false, true, true]);
    }

    #[test]
    fn test_two_call_step_matches_hand_trace() {
        let options = SchedulerOptions::default().with_seed(21).with_steps(4);
        let mut scheduler = KDpm2AncestralScheduler::new(options.clone()).unwrap();
        scheduler.initialize(1.0).unwrap();
        let mut twin = KDpm2AncestralScheduler::new(options).unwrap();
        twin.initialize(1.0).unwrap();

        let sigmas = scheduler.sigmas().to_vec();
        let timesteps = scheduler.timesteps().to_vec();
        let (sigma, next) = (sigmas[0], sigmas[2]);
        let up = (next * next * (sigma * sigma - next * next) / (sigma * sigma)).sqrt();
        let down = (next * next - up * up).sqrt();
        let midpoint = ((sigma.ln() + down.ln()) * 0.5).exp();
        assert_relative_eq!(sigmas[1], midpoint, max_relative = 1e-5);

        let x = Tensor::filled(&[3], 1.5f32);
        let epsilon = Tensor::filled(&[3], 0.3f32);

        let first = scheduler.step(timesteps[0], &epsilon, &x).unwrap();
        assert!(!scheduler.is_final_order());
        for v in first.sample.as_slice() {
            assert_abs_diff_eq!(*v, 1.5 + 0.3 * (midpoint - sigma), epsilon = 1e-3);
        }

        let second = scheduler.step(timesteps[1], &epsilon, &first.sample).unwrap();
        assert!(scheduler.is_final_order());
        // Each call draws noise; the second call's draw is the one applied
        twin.create_random_sample(&[3]);
        let noise = twin.create_random_sample(&[3]);
        for (v, n) in second.sample.as_slice().iter().zip(noise.as_slice()) {
            let expected = 1.5 + 0.3 * (down - sigma) + n * up;
            assert_abs_diff_eq!(*v, expected, epsilon = 1e-3);
        }
        let pred = second.pred_original.unwrap();
        for (v, s) in pred.as_slice().iter().zip(first.sample.as_slice()) {
            assert_abs_diff_eq!(*v, s - midpoint * 0.3, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_midpoint_between_base_sigmas() {
        let scheduler = initialized(6);
        let sigmas = scheduler.sigmas();
        for k in (1..sigmas.len() - 2).step_by(2) {
            assert!(sigmas[k] < sigmas[k - 1]);
            assert!(sigmas[k] > 0.0);
        }
    }
}
