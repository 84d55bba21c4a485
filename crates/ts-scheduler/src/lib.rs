//! # TensorStack Schedulers
//!
//! Diffusion noise schedulers behind one [`Scheduler`] trait:
//! - Euler, Euler ancestral and KDPM2 ancestral (discrete sigma samplers)
//! - DDPM and DDPM Wuerstchen (alpha-bar posterior samplers)
//! - Flow-match Euler, deterministic and stochastic
//!
//! Each instance owns its options, state arrays and a seeded ChaCha8
//! generator, so a fixed seed reproduces every stochastic draw.

mod ddpm;
mod ddpm_wuerstchen;
mod error;
mod euler;
mod euler_ancestral;
mod flow_match;
mod kdpm2_ancestral;
mod options;
pub mod schedule;
mod state;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_core::Tensor;

pub use ddpm::DdpmScheduler;
pub use ddpm_wuerstchen::DdpmWuerstchenScheduler;
pub use error::{SchedulerError, SchedulerResult};
pub use euler::EulerScheduler;
pub use euler_ancestral::EulerAncestralScheduler;
pub use flow_match::FlowMatchEulerScheduler;
pub use kdpm2_ancestral::KDpm2AncestralScheduler;
pub use options::{
    AlphaTransformType, BetaScheduleType, PredictionType, SchedulerOptions, TimestepSpacingType,
    VarianceType,
};
pub use state::SchedulerState;

/// Result of one denoising step
#[derive(Debug, Clone)]
pub struct SchedulerOutput {
    /// Latent for the next timestep
    pub sample: Tensor<f32>,
    /// Clean-sample estimate at this step, where the sampler computes one
    pub pred_original: Option<Tensor<f32>>,
}

impl SchedulerOutput {
    pub fn new(sample: Tensor<f32>) -> Self {
        Self {
            sample,
            pred_original: None,
        }
    }

    pub fn with_pred_original(mut self, pred_original: Tensor<f32>) -> Self {
        self.pred_original = Some(pred_original);
        self
    }
}

/// A noise scheduler
///
/// Lifecycle: construct with options, `initialize(strength)`, then call
/// `scale_input` and `step` once per timestep in order. Steps are counted
/// internally; the timestep argument must match the pending entry.
pub trait Scheduler: Send {
    fn kind(&self) -> SchedulerKind;

    fn options(&self) -> &SchedulerOptions;

    /// Build timesteps and sigmas, skipping `steps - floor(steps * strength)` leading steps
    fn initialize(&mut self, strength: f32) -> SchedulerResult<()>;

    /// Scale the latent before it is fed to the model
    fn scale_input(&self, timestep: f32, sample: &Tensor<f32>) -> SchedulerResult<Tensor<f32>>;

    /// Advance one timestep
    fn step(
        &mut self,
        timestep: f32,
        model_output: &Tensor<f32>,
        sample: &Tensor<f32>,
    ) -> SchedulerResult<SchedulerOutput>;

    /// Noise a clean sample to the level of `timestep`
    fn scale_noise(
        &self,
        timestep: f32,
        sample: &Tensor<f32>,
        noise: &Tensor<f32>,
    ) -> SchedulerResult<Tensor<f32>>;

    /// Standard normal tensor from the scheduler's seeded generator
    fn create_random_sample(&mut self, dimensions: &[usize]) -> Tensor<f32>;

    fn state(&self) -> &SchedulerState;

    /// Model evaluations per logical step
    fn order(&self) -> usize {
        1
    }

    /// False between the sub-steps of a multi-order sampler
    fn is_final_order(&self) -> bool {
        true
    }

    /// Drop state arrays; the scheduler must be re-initialized before reuse
    fn dispose(&mut self);

    fn timesteps(&self) -> &[f32] {
        self.state().timesteps()
    }

    fn sigmas(&self) -> &[f32] {
        self.state().sigmas()
    }
}

/// Registry of scheduler variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerKind {
    Euler,
    EulerAncestral,
    KDpm2Ancestral,
    Ddpm,
    DdpmWuerstchen,
    FlowMatchEulerDiscrete,
    FlowMatchEulerDynamic,
}

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 7] = [
        SchedulerKind::Euler,
        SchedulerKind::EulerAncestral,
        SchedulerKind::KDpm2Ancestral,
        SchedulerKind::Ddpm,
        SchedulerKind::DdpmWuerstchen,
        SchedulerKind::FlowMatchEulerDiscrete,
        SchedulerKind::FlowMatchEulerDynamic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::Euler => "euler",
            SchedulerKind::EulerAncestral => "eulerancestral",
            SchedulerKind::KDpm2Ancestral => "kdpm2ancestral",
            SchedulerKind::Ddpm => "ddpm",
            SchedulerKind::DdpmWuerstchen => "ddpmwuerstchen",
            SchedulerKind::FlowMatchEulerDiscrete => "flowmatcheulerdiscrete",
            SchedulerKind::FlowMatchEulerDynamic => "flowmatcheulerdynamic",
        }
    }

    /// Flow-matching samplers predict velocity and start from unit-variance noise
    pub fn is_flow_match(&self) -> bool {
        matches!(
            self,
            SchedulerKind::FlowMatchEulerDiscrete | SchedulerKind::FlowMatchEulerDynamic
        )
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SchedulerKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| SchedulerError::UnknownScheduler(s.to_string()))
    }
}

/// Construct a boxed scheduler
pub fn create_scheduler(
    kind: SchedulerKind,
    options: SchedulerOptions,
) -> SchedulerResult<Box<dyn Scheduler>> {
    let scheduler: Box<dyn Scheduler> = match kind {
        SchedulerKind::Euler => Box::new(EulerScheduler::new(options)?),
        SchedulerKind::EulerAncestral => Box::new(EulerAncestralScheduler::new(options)?),
        SchedulerKind::KDpm2Ancestral => Box::new(KDpm2AncestralScheduler::new(options)?),
        SchedulerKind::Ddpm => Box::new(DdpmScheduler::new(options)?),
        SchedulerKind::DdpmWuerstchen => Box::new(DdpmWuerstchenScheduler::new(options)?),
        SchedulerKind::FlowMatchEulerDiscrete => {
            Box::new(FlowMatchEulerScheduler::discrete(options)?)
        }
        SchedulerKind::FlowMatchEulerDynamic => {
            Box::new(FlowMatchEulerScheduler::dynamic(options)?)
        }
    };
    Ok(scheduler)
}
