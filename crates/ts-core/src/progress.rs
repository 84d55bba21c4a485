//! Progress records emitted by the generation loops
//!
//! Reporting is fire-and-forget: sinks must not block the loop that feeds
//! them, and the loop never waits on a sink.

use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::tensor::Tensor;

/// One completed step of a diffusion or decode loop
#[derive(Debug, Clone)]
pub struct ProgressRecord {
    /// 1-based index of the completed step
    pub step: usize,
    /// Steps in the whole run
    pub total_steps: usize,
    /// Time since the run started
    pub elapsed: Duration,
    /// Current latent (diffusion only)
    pub sample: Option<Tensor<f32>>,
    /// Free-form stage description
    pub message: Option<String>,
}

impl ProgressRecord {
    pub fn new(step: usize, total_steps: usize, elapsed: Duration) -> Self {
        Self {
            step,
            total_steps,
            elapsed,
            sample: None,
            message: None,
        }
    }

    pub fn with_sample(mut self, sample: Tensor<f32>) -> Self {
        self.sample = Some(sample);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Completed fraction (0.0 - 1.0)
    pub fn fraction(&self) -> f64 {
        if self.total_steps == 0 {
            0.0
        } else {
            (self.step as f64 / self.total_steps as f64).min(1.0)
        }
    }
}

/// Consumer of progress records
pub trait ProgressSink: Send + Sync {
    fn report(&self, record: ProgressRecord);

    /// Whether records should carry the current latent
    fn wants_sample(&self) -> bool {
        true
    }
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressRecord) + Send + Sync,
{
    fn report(&self, record: ProgressRecord) {
        self(record)
    }
}

/// Discards every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _record: ProgressRecord) {}

    fn wants_sample(&self) -> bool {
        false
    }
}

/// Forwards records into a channel, dropping them when the channel is full
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: Sender<ProgressRecord>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<ProgressRecord>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, record: ProgressRecord) {
        if self.sender.try_send(record).is_err() {
            log::debug!("Progress record dropped (receiver full or gone)");
        }
    }
}

/// Wall clock for a single run
#[derive(Debug, Clone, Copy)]
pub struct RunTimer {
    start: Instant,
}

impl RunTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn record(&self, step: usize, total_steps: usize) -> ProgressRecord {
        ProgressRecord::new(step, total_steps, self.elapsed())
    }
}

impl Default for RunTimer {
    fn default() -> Self {
        Self::start()
    }
}
