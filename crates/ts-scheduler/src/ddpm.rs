//! DDPM ancestral sampler (Ho et al. 2020)

use ts_core::Tensor;

use crate::error::{SchedulerError, SchedulerResult};
use crate::options::{PredictionType, SchedulerOptions, VarianceType};
use crate::schedule::{alphas, alphas_cumprod, betas, sigmas_from_alphas_cumprod, spaced_timesteps};
use crate::state::{ScheduleArrays, SchedulerCore};
use crate::{Scheduler, SchedulerKind, SchedulerOutput, SchedulerState};

#[derive(Debug)]
pub struct DdpmScheduler {
    core: SchedulerCore,
}

impl DdpmScheduler {
    pub fn new(options: SchedulerOptions) -> SchedulerResult<Self> {
        if matches!(
            options.variance_type,
            VarianceType::Learned | VarianceType::LearnedRange
        ) {
            return Err(SchedulerError::Unsupported(format!(
                "DDPM variance type {:?}",
                options.variance_type
            )));
        }
        Ok(Self {
            core: SchedulerCore::new(options)?,
        })
    }

    /// Cumulative alpha at a training timestep, 1 before the start
    fn alpha_cumprod_at(&self, timestep: f32) -> f32 {
        if timestep < 0.0 {
            return 1.0;
        }
        let cumprod = self.core.state().alphas_cumprod();
        let index = (timestep.round() as usize).min(cumprod.len().saturating_sub(1));
        cumprod.get(index).copied().unwrap_or(1.0)
    }

    fn variance(&self, alpha_prod: f32, alpha_prod_prev: f32, current_beta: f32) -> f32 {
        match self.options().variance_type {
            VarianceType::FixedSmall | VarianceType::FixedSmallLog => {
                ((1.0 - alpha_prod_prev) / (1.0 - alpha_prod) * current_beta).max(1e-20)
            }
            VarianceType::FixedLarge | VarianceType::FixedLargeLog => current_beta,
            VarianceType::Learned | VarianceType::LearnedRange => 0.0,
        }
    }

    /// Per-batch-item quantile clamp of the clean-sample estimate
    fn dynamic_threshold(&self, sample: &mut Tensor<f32>) -> SchedulerResult<()> {
        let options = self.options();
        let batch = sample.dimensions().first().copied().unwrap_or(1).max(1);
        let per_item = sample.len() / batch;
        if per_item == 0 {
            return Ok(());
        }
        for chunk in sample.as_mut_slice().chunks_mut(per_item) {
            let mut magnitudes: Vec<f32> = chunk.iter().map(|v| v.abs()).collect();
            magnitudes.sort_by(f32::total_cmp);
            let s = quantile(&magnitudes, options.dynamic_thresholding_ratio)
                .clamp(1.0, options.sample_max_value.max(1.0));
            for value in chunk.iter_mut() {
                *value = value.clamp(-s, s) / s;
            }
        }
        Ok(())
    }
}

/// Linear-interpolated quantile of sorted values
fn quantile(sorted: &[f32], q: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f32;
    let lower = position.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let fraction = position - lower as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

impl Scheduler for DdpmScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Ddpm
    }

    fn options(&self) -> &SchedulerOptions {
        self.core.options()
    }

    fn initialize(&mut self, strength: f32) -> SchedulerResult<()> {
        let start = self.core.start_step(strength)?;
        let options = self.core.options();
        let betas = betas(options)?;
        let alphas = alphas(&betas);
        let alphas_cumprod = alphas_cumprod(&alphas);
        let train_sigmas = sigmas_from_alphas_cumprod(&alphas_cumprod);

        let timesteps = spaced_timesteps(options);
        let mut sigmas = timesteps
            .iter()
            .map(|&t| {
                train_sigmas
                    .get(t as usize)
                    .copied()
                    .ok_or(SchedulerError::UnknownTimestep(t))
            })
            .collect::<SchedulerResult<Vec<f32>>>()?;
        sigmas.push(0.0);

        self.core.install(
            ScheduleArrays {
                betas,
                alphas,
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
        let prev_timestep = self.core.timestep(index + 1).unwrap_or(-1.0);

        let alpha_prod = self.alpha_cumprod_at(timestep);
        let alpha_prod_prev = self.alpha_cumprod_at(prev_timestep);
        let beta_prod = 1.0 - alpha_prod;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let options = self.options();
        let mut pred_original = match options.prediction_type {
            PredictionType::Epsilon => {
                let mut x0 = sample.to_linear_combination(1.0, model_output, -beta_prod.sqrt())?;
                x0.divide_scalar(alpha_prod.sqrt());
                x0
            }
            PredictionType::Sample => model_output.clone(),
            PredictionType::VariablePrediction => sample.to_linear_combination(
                alpha_prod.sqrt(),
                model_output,
                -beta_prod.sqrt(),
            )?,
        };

        if options.thresholding {
            self.dynamic_threshold(&mut pred_original)?;
        } else if options.clip_sample {
            let range = options.clip_sample_range;
            pred_original.clamp(-range, range);
        }

        // Posterior mean, eq. (7)
        let original_coefficient = alpha_prod_prev.sqrt() * current_beta / beta_prod;
        let current_coefficient = current_alpha.sqrt() * beta_prod_prev / beta_prod;
        let mut prev_sample =
            pred_original.to_linear_combination(original_coefficient, sample, current_coefficient)?;

        if timestep > 0.0 {
            let std = self
                .variance(alpha_prod, alpha_prod_prev, current_beta)
                .sqrt();
            let noise = self.core.random_sample(sample.dimensions());
            prev_sample.add_scaled(&noise, std)?;
        }

        self.core.advance();
        Ok(SchedulerOutput::new(prev_sample).with_pred_original(pred_original))
    }

    fn scale_noise(
        &self,
        timestep: f32,
        sample: &Tensor<f32>,
        noise: &Tensor<f32>,
    ) -> SchedulerResult<Tensor<f32>> {
        self.core.ensure_initialized()?;
        let alpha_prod = self.alpha_cumprod_at(timestep);
        Ok(sample.to_linear_combination(alpha_prod.sqrt(), noise, (1.0 - alpha_prod).sqrt())?)
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
