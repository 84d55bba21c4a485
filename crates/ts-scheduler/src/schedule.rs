//! Noise schedule math shared by every scheduler
//!
//! Everything here is deterministic and side-effect free. Curves are
//! accumulated in f64 and stored as f32.

use std::f64::consts::PI;

use crate::error::{SchedulerError, SchedulerResult};
use crate::options::{
    AlphaTransformType, BetaScheduleType, SchedulerOptions, TimestepSpacingType,
};

/// `count` evenly spaced values from `start` to `end`, both inclusive
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}

/// NaN becomes 0, everything else passes through
#[inline]
pub fn zero_if_nan(value: f32) -> f32 {
    if value.is_nan() { 0.0 } else { value }
}

/// Training betas for the configured schedule
pub fn betas(options: &SchedulerOptions) -> SchedulerResult<Vec<f32>> {
    if let Some(trained) = &options.trained_betas {
        return Ok(trained.clone());
    }

    let n = options.train_timesteps;
    let start = options.beta_start as f64;
    let end = options.beta_end as f64;
    let betas: Vec<f64> = match options.beta_schedule {
        BetaScheduleType::Linear => linspace(start, end, n),
        BetaScheduleType::ScaledLinear => linspace(start.sqrt(), end.sqrt(), n)
            .into_iter()
            .map(|b| b * b)
            .collect(),
        BetaScheduleType::SquaredCosCapV2 => {
            betas_for_alpha_bar(n, options.maximum_beta as f64, options.alpha_transform)
        }
        BetaScheduleType::Sigmoid => linspace(-6.0, 6.0, n)
            .into_iter()
            .map(|x| sigmoid(x) * (end - start) + start)
            .collect(),
    };

    if betas.iter().any(|b| !b.is_finite() || *b <= 0.0 || *b >= 1.0) {
        return Err(SchedulerError::InvalidOptions(
            "beta schedule produced values outside (0, 1)".into(),
        ));
    }
    Ok(betas.into_iter().map(|b| b as f32).collect())
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Betas discretizing an alpha-bar curve, each capped at `max_beta`
fn betas_for_alpha_bar(n: usize, max_beta: f64, transform: AlphaTransformType) -> Vec<f64> {
    let alpha_bar = |t: f64| match transform {
        AlphaTransformType::Cosine => ((t + 0.008) / 1.008 * PI / 2.0).cos().powi(2),
        AlphaTransformType::Exponential => (t * -12.0).exp(),
    };
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

pub fn alphas(betas: &[f32]) -> Vec<f32> {
    betas.iter().map(|b| 1.0 - b).collect()
}

/// Running product of alphas
pub fn alphas_cumprod(alphas: &[f32]) -> Vec<f32> {
    let mut product = 1.0f64;
    alphas
        .iter()
        .map(|&a| {
            product *= a as f64;
            product as f32
        })
        .collect()
}

/// `sqrt((1 - a) / a)` per cumulative alpha
pub fn sigmas_from_alphas_cumprod(alphas_cumprod: &[f32]) -> Vec<f32> {
    alphas_cumprod
        .iter()
        .map(|&a| ((1.0 - a as f64) / a as f64).sqrt() as f32)
        .collect()
}

/// Inference timesteps, descending
pub fn spaced_timesteps(options: &SchedulerOptions) -> Vec<f32> {
    let train = options.train_timesteps;
    let steps = options.inference_steps;
    match options.timestep_spacing {
        TimestepSpacingType::Linspace => linspace(0.0, (train - 1) as f64, steps)
            .into_iter()
            .rev()
            .map(|t| t.round() as f32)
            .collect(),
        TimestepSpacingType::Leading => {
            let ratio = train / steps;
            (0..steps)
                .rev()
                .map(|i| (i * ratio + options.steps_offset) as f32)
                .collect()
        }
        TimestepSpacingType::Trailing => {
            let ratio = train as f64 / steps as f64;
            (0..steps)
                .map(|i| (train as f64 - ratio * i as f64).round() - 1.0)
                .filter(|t| *t >= 0.0)
                .map(|t| t as f32)
                .collect()
        }
    }
}

/// Karras et al. (2022) sigmas, descending from `sigma_max` to `sigma_min`
pub fn karras_sigmas(sigma_min: f32, sigma_max: f32, steps: usize, rho: f32) -> Vec<f32> {
    let rho = rho as f64;
    let min_inv = (sigma_min as f64).powf(1.0 / rho);
    let max_inv = (sigma_max as f64).powf(1.0 / rho);
    linspace(0.0, 1.0, steps)
        .into_iter()
        .map(|ramp| (max_inv + ramp * (min_inv - max_inv)).powf(rho) as f32)
        .collect()
}

/// Piecewise-linear interpolation of `fp` over ascending `xp`, clamped at the ends
pub fn interpolate(x: f32, xp: &[f32], fp: &[f32]) -> f32 {
    let n = xp.len().min(fp.len());
    if n == 0 {
        return 0.0;
    }
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }
    let upper = xp[..n].partition_point(|&v| v <= x);
    let lower = upper - 1;
    let span = xp[upper] - xp[lower];
    if span == 0.0 {
        return fp[lower];
    }
    let w = (x - xp[lower]) / span;
    fp[lower] + w * (fp[upper] - fp[lower])
}

/// Fractional training timestep whose sigma is `sigma`
///
/// `log_sigmas` holds `ln(sigma)` per training timestep, ascending.
pub fn sigma_to_timestep(sigma: f32, log_sigmas: &[f32]) -> f32 {
    let n = log_sigmas.len();
    if n < 2 {
        return 0.0;
    }
    let log_sigma = sigma.max(1e-10).ln();
    let low = log_sigmas
        .partition_point(|&ls| ls <= log_sigma)
        .saturating_sub(1)
        .min(n - 2);
    let high = low + 1;
    let (low_value, high_value) = (log_sigmas[low], log_sigmas[high]);
    let w = ((low_value - log_sigma) / (low_value - high_value)).clamp(0.0, 1.0);
    (1.0 - w) * low as f32 + w * high as f32
}

/// Sigma that is first applied to pure noise
pub fn initial_noise_sigma(sigmas: &[f32], spacing: TimestepSpacingType) -> f32 {
    let max = sigmas.iter().copied().fold(0.0f32, f32::max);
    match spacing {
        TimestepSpacingType::Linspace | TimestepSpacingType::Trailing => max,
        TimestepSpacingType::Leading => (max * max + 1.0).sqrt(),
    }
}

/// Schedule arrays for the discrete sigma samplers (Euler family, KDPM2)
#[derive(Debug, Clone)]
pub struct DiscreteSchedule {
    pub betas: Vec<f32>,
    pub alphas: Vec<f32>,
    pub alphas_cumprod: Vec<f32>,
    /// Descending inference timesteps
    pub timesteps: Vec<f32>,
    /// One sigma per timestep plus a trailing 0
    pub sigmas: Vec<f32>,
    /// `ln(sigma)` per training timestep
    pub log_sigmas: Vec<f32>,
}

impl DiscreteSchedule {
    pub fn build(options: &SchedulerOptions) -> SchedulerResult<Self> {
        let betas = betas(options)?;
        let alphas = alphas(&betas);
        let alphas_cumprod = alphas_cumprod(&alphas);
        let train_sigmas = sigmas_from_alphas_cumprod(&alphas_cumprod);
        let log_sigmas: Vec<f32> = train_sigmas.iter().map(|s| s.ln()).collect();
        let axis: Vec<f32> = (0..train_sigmas.len()).map(|t| t as f32).collect();

        let mut timesteps = spaced_timesteps(options);
        let mut sigmas: Vec<f32> = timesteps
            .iter()
            .map(|&t| interpolate(t, &axis, &train_sigmas))
            .collect();

        if options.use_karras_sigmas {
            let sigma_min = options
                .sigma_min
                .unwrap_or_else(|| sigmas.last().copied().unwrap_or(0.0));
            let sigma_max = options
                .sigma_max
                .unwrap_or_else(|| sigmas.first().copied().unwrap_or(0.0));
            sigmas = karras_sigmas(sigma_min, sigma_max, timesteps.len(), options.rho);
            timesteps = sigmas
                .iter()
                .map(|&s| sigma_to_timestep(s, &log_sigmas).round())
                .collect();
        }

        sigmas.push(0.0);
        Ok(Self {
            betas,
            alphas,
            alphas_cumprod,
            timesteps,
            sigmas,
            log_sigmas,
        })
    }
}

/// Exponential time shift used by resolution-aware flow matching
pub fn time_shift(mu: f32, t: f32) -> f32 {
    let e = (mu as f64).exp();
    (e / (e + (1.0 / t as f64 - 1.0))) as f32
}

/// Shift exponent interpolated from the image token count
pub fn dynamic_shift_mu(options: &SchedulerOptions, image_seq_len: usize) -> f32 {
    let base_len = options.base_image_seq_len as f32;
    let max_len = options.max_image_seq_len as f32;
    let m = (options.max_shift - options.base_shift) / (max_len - base_len);
    let b = options.base_shift - m * base_len;
    image_seq_len as f32 * m + b
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linspace_endpoints() {
        let values = linspace(0.0, 999.0, 4);
        assert_eq!(values, vec![0.0, 333.0, 666.0, 999.0]);
        assert_eq!(linspace(5.0, 9.0, 1), vec![5.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_zero_if_nan() {
        assert_eq!(zero_if_nan(f32::NAN), 0.0);
        assert_eq!(zero_if_nan(0.5), 0.5);
    }

    #[test]
    fn test_betas_are_in_range() {
        for schedule in [
            BetaScheduleType::Linear,
            BetaScheduleType::ScaledLinear,
            BetaScheduleType::SquaredCosCapV2,
            BetaScheduleType::Sigmoid,
        ] {
            let options = SchedulerOptions {
                beta_schedule: schedule,
                ..Default::default()
            };
            let betas = betas(&options).unwrap();
            assert_eq!(betas.len(), 1000);
            assert!(
                betas
                    .iter()
                    .all(|&b| b > 0.0 && b <= options.maximum_beta),
                "{schedule:?}"
            );
        }
    }

    #[test]
    fn test_scaled_linear_endpoints() {
        let options = SchedulerOptions::default();
        let betas = betas(&options).unwrap();
        assert_relative_eq!(betas[0], 0.00085, epsilon = 1e-7);
        assert_relative_eq!(betas[999], 0.012, epsilon = 1e-7);
    }

    #[test]
    fn test_alphas_cumprod_decreasing() {
        let betas = betas(&SchedulerOptions::default()).unwrap();
        let cumprod = alphas_cumprod(&alphas(&betas));
        assert!(cumprod.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_spacing_variants() {
        let mut options = SchedulerOptions::default().with_steps(4);
        options.train_timesteps = 1000;

        options.timestep_spacing = TimestepSpacingType::Linspace;
        assert_eq!(spaced_timesteps(&options), vec![999.0, 666.0, 333.0, 0.0]);

        options.timestep_spacing = TimestepSpacingType::Leading;
        options.steps_offset = 1;
        assert_eq!(spaced_timesteps(&options), vec![751.0, 501.0, 251.0, 1.0]);

        options.timestep_spacing = TimestepSpacingType::Trailing;
        assert_eq!(spaced_timesteps(&options), vec![999.0, 749.0, 499.0, 249.0]);
    }

    #[test]
    fn test_karras_endpoints() {
        let sigmas = karras_sigmas(0.03, 14.6, 10, 7.0);
        assert_relative_eq!(sigmas[0], 14.6, epsilon = 1e-4);
        assert_relative_eq!(sigmas[9], 0.03, epsilon = 1e-5);
        assert!(sigmas.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_interpolate_clamps() {
        let xp = [0.0, 1.0, 2.0];
        let fp = [10.0, 20.0, 40.0];
        assert_eq!(interpolate(-1.0, &xp, &fp), 10.0);
        assert_eq!(interpolate(1.5, &xp, &fp), 30.0);
        assert_eq!(interpolate(5.0, &xp, &fp), 40.0);
    }

    #[test]
    fn test_sigma_to_timestep_inverts_training_sigmas() {
        let options = SchedulerOptions::default();
        let cumprod = alphas_cumprod(&alphas(&betas(&options).unwrap()));
        let sigmas = sigmas_from_alphas_cumprod(&cumprod);
        let log_sigmas: Vec<f32> = sigmas.iter().map(|s| s.ln()).collect();
        for t in [0usize, 17, 500, 998] {
            assert_relative_eq!(
                sigma_to_timestep(sigmas[t], &log_sigmas),
                t as f32,
                epsilon = 1e-2
            );
        }
    }

    #[test]
    fn test_discrete_schedule_shape() {
        let schedule = DiscreteSchedule::build(&SchedulerOptions::default().with_steps(20)).unwrap();
        assert_eq!(schedule.timesteps.len(), 20);
        assert_eq!(schedule.sigmas.len(), 21);
        assert_eq!(*schedule.sigmas.last().unwrap(), 0.0);
    }

    #[test]
    fn test_dynamic_shift_mu_endpoints() {
        let options = SchedulerOptions::flux();
        assert_relative_eq!(dynamic_shift_mu(&options, 256), 0.5, epsilon = 1e-6);
        assert_relative_eq!(dynamic_shift_mu(&options, 4096), 1.15, epsilon = 1e-5);
        assert_relative_eq!(time_shift(0.0, 0.5), 0.5, epsilon = 1e-6);
    }
}
