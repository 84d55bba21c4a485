//! DDPM variant for the Wuerstchen prior
//!
//! Works on continuous timesteps in [0, 1] with a closed-form cosine
//! alpha-bar instead of a discrete beta table.

use std::f64::consts::PI;

use ts_core::Tensor;

use crate::error::SchedulerResult;
use crate::options::SchedulerOptions;
use crate::schedule::linspace;
use crate::state::{ScheduleArrays, SchedulerCore};
use crate::{Scheduler, SchedulerKind, SchedulerOutput, SchedulerState};

#[derive(Debug)]
pub struct DdpmWuerstchenScheduler {
    core: SchedulerCore,
    init_alpha_cumprod: f64,
}

impl DdpmWuerstchenScheduler {
    pub fn new(options: SchedulerOptions) -> SchedulerResult<Self> {
        let s = options.cosine_offset as f64;
        let init_alpha_cumprod = (s / (1.0 + s) * PI * 0.5).cos().powi(2);
        Ok(Self {
            core: SchedulerCore::new(options)?,
            init_alpha_cumprod,
        })
    }

    /// Closed-form alpha-bar at continuous time `t`
    pub fn alpha_cumprod(&self, t: f32) -> f32 {
        let options = self.core.options();
        let mut t = t as f64;
        let scaler = options.scaler as f64;
        if scaler > 1.0 {
            t = 1.0 - (1.0 - t).powf(scaler);
        } else if scaler < 1.0 {
            t = t.powf(scaler);
        }
        let s = options.cosine_offset as f64;
        let value = ((t + s) / (1.0 + s) * PI * 0.5).cos().powi(2) / self.init_alpha_cumprod;
        value.clamp(0.0001, 0.9999) as f32
    }
}

impl Scheduler for DdpmWuerstchenScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::DdpmWuerstchen
    }

    fn options(&self) -> &SchedulerOptions {
        self.core.options()
    }

    fn initialize(&mut self, strength: f32) -> SchedulerResult<()> {
        let start = self.core.start_step(strength)?;
        let steps = self.core.options().inference_steps;

        let mut timesteps: Vec<f32> = linspace(1.0, 0.0, steps + 1)
            .into_iter()
            .map(|t| t as f32)
            .collect();
        timesteps.pop();

        let alphas_cumprod: Vec<f32> = timesteps.iter().map(|&t| self.alpha_cumprod(t)).collect();
        let mut sigmas: Vec<f32> = alphas_cumprod
            .iter()
            .map(|&a| ((1.0 - a) / a).sqrt())
            .collect();
        sigmas.push(0.0);

        self.core.install(
            ScheduleArrays {
                betas: Vec::new(),
                alphas: Vec::new(),
                alphas_cumprod,
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
        let prev_timestep = self.core.timestep(index + 1).unwrap_or(0.0);

        let alpha_cumprod = self.alpha_cumprod(timestep);
        let alpha_cumprod_prev = self.alpha_cumprod(prev_timestep);
        let alpha = alpha_cumprod / alpha_cumprod_prev;

        let mut pred_original =
            sample.to_linear_combination(1.0, model_output, -(1.0 - alpha_cumprod).sqrt())?;
        pred_original.divide_scalar(alpha_cumprod.sqrt());

        let mut mu = sample.to_linear_combination(
            1.0,
            model_output,
            -(1.0 - alpha) / (1.0 - alpha_cumprod).sqrt(),
        )?;
        mu.multiply_scalar(1.0 / alpha.sqrt());

        if prev_timestep != 0.0 {
            let std = ((1.0 - alpha) * (1.0 - alpha_cumprod_prev) / (1.0 - alpha_cumprod)).sqrt();
            let noise = self.core.random_sample(sample.dimensions());
            mu.add_scaled(&noise, std)?;
        }

        self.core.advance();
        Ok(SchedulerOutput::new(mu).with_pred_original(pred_original))
    }

    fn scale_noise(
        &self,
        timestep: f32,
        sample: &Tensor<f32>,
        noise: &Tensor<f32>,
    ) -> SchedulerResult<Tensor<f32>> {
        self.core.ensure_initialized()?;
        let alpha_cumprod = self.alpha_cumprod(timestep);
        Ok(sample.to_linear_combination(
            alpha_cumprod.sqrt(),
            noise,
            (1.0 - alpha_cumprod).sqrt(),
        )?)
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
