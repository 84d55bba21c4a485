//! Diffusion loop against mock denoiser and autoencoder

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use approx::assert_abs_diff_eq;
use common::{MockAutoEncoder, MockDenoiser};
use ts_core::{CancellationToken, ChannelProgress, NullProgress, Tensor};
use ts_pipeline::{
    DiffusionInput, DiffusionOptions, DiffusionPipeline, MemoryMode, PipelineError,
    PipelineState, ProcessType, PromptEmbeddings,
};
use ts_scheduler::{SchedulerKind, SchedulerOptions, create_scheduler};

fn tiny(scheduler: SchedulerKind, steps: usize) -> DiffusionOptions {
    DiffusionOptions {
        scheduler,
        scheduler_options: SchedulerOptions::default(),
        steps,
        guidance_scale: 1.0,
        width: 8,
        height: 8,
        latent_channels: 1,
        ..Default::default()
    }
}

fn prompt() -> DiffusionInput {
    DiffusionInput::new(PromptEmbeddings::new(Tensor::ones(&[1, 2, 4])))
}

#[test]
fn zero_prediction_leaves_initial_latents_unchanged() {
    let options = tiny(SchedulerKind::Euler, 4);
    let denoiser = Arc::new(MockDenoiser::zero());
    let pipeline = DiffusionPipeline::new(denoiser.clone());

    let result = pipeline
        .run(&options, &prompt(), &CancellationToken::new(), &NullProgress)
        .unwrap();

    let mut reference = create_scheduler(SchedulerKind::Euler, options.scheduler_options()).unwrap();
    reference.initialize(1.0).unwrap();
    let noise = reference.create_random_sample(&[1, 1, 1, 1]);
    let initial = noise.to_multiply_scalar(reference.state().start_sigma());

    assert_eq!(result.latents.dimensions(), &[1, 1, 1, 1]);
    assert_abs_diff_eq!(result.latents.as_slice()[0], initial.as_slice()[0], epsilon = 1e-6);
    assert_eq!(result.steps, 4);
    assert_eq!(denoiser.calls(), 4);
    assert_eq!(pipeline.state(), PipelineState::Complete);
    assert!(result.image.is_none());
}

#[test]
fn progress_carries_step_latents() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let options = tiny(SchedulerKind::EulerAncestral, 5);
    let pipeline = DiffusionPipeline::new(Arc::new(MockDenoiser::zero()));

    let result = pipeline
        .run(&options, &prompt(), &CancellationToken::new(), &ChannelProgress::new(tx))
        .unwrap();

    let records: Vec<_> = rx.try_iter().collect();
    assert_eq!(records.len(), 5);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.step, i + 1);
        assert_eq!(record.total_steps, 5);
        assert!(record.sample.is_some());
    }
    assert_eq!(records[4].sample.as_ref(), Some(&result.latents));
}

#[test]
fn second_order_solver_reports_once_per_step() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let options = tiny(SchedulerKind::KDpm2Ancestral, 4);
    let denoiser = Arc::new(MockDenoiser::zero());
    let pipeline = DiffusionPipeline::new(denoiser.clone());

    let result = pipeline
        .run(&options, &prompt(), &CancellationToken::new(), &ChannelProgress::new(tx))
        .unwrap();

    assert_eq!(denoiser.calls(), 7);
    assert_eq!(result.steps, 4);
    let steps: Vec<usize> = rx.try_iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![1, 2, 3, 4]);
}

#[test]
fn guidance_runs_both_passes_each_step() {
    let mut options = tiny(SchedulerKind::Euler, 3);
    options.guidance_scale = 5.0;
    let input = DiffusionInput::new(
        PromptEmbeddings::new(Tensor::ones(&[1, 2, 4])).with_unconditional(Tensor::zeros(&[1, 2, 4])),
    );
    let denoiser = Arc::new(MockDenoiser::zero());
    let pipeline = DiffusionPipeline::new(denoiser.clone());

    pipeline
        .run(&options, &input, &CancellationToken::new(), &NullProgress)
        .unwrap();
    assert_eq!(denoiser.calls(), 6);

    // Without unconditional embeddings guidance is skipped
    let unguided = Arc::new(MockDenoiser::zero());
    DiffusionPipeline::new(unguided.clone())
        .run(&options, &prompt(), &CancellationToken::new(), &NullProgress)
        .unwrap();
    assert_eq!(unguided.calls(), 3);
}

#[test]
fn control_net_rejected_before_any_model_call() {
    let mut options = tiny(SchedulerKind::Euler, 4);
    options.process_type = ProcessType::ControlNetImage;
    let input = prompt().with_control_image(Tensor::ones(&[1, 3, 8, 8]));
    let denoiser = Arc::new(MockDenoiser::zero());
    let pipeline = DiffusionPipeline::new(denoiser.clone());

    let error = pipeline
        .run(&options, &input, &CancellationToken::new(), &NullProgress)
        .unwrap_err();
    assert!(matches!(error, PipelineError::UnsupportedCombination(_)));
    assert_eq!(denoiser.calls(), 0);
    assert_eq!(pipeline.state(), PipelineState::Failed);

    let supported = Arc::new(MockDenoiser {
        control_net: true,
        ..MockDenoiser::zero()
    });
    DiffusionPipeline::new(supported.clone())
        .run(&options, &input, &CancellationToken::new(), &NullProgress)
        .unwrap();
    assert_eq!(supported.calls(), 4);
}

#[test]
fn cancelled_before_start_makes_no_calls() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let denoiser = Arc::new(MockDenoiser::zero());
    let pipeline = DiffusionPipeline::new(denoiser.clone());

    let error = pipeline
        .run(&tiny(SchedulerKind::Euler, 4), &prompt(), &cancel, &NullProgress)
        .unwrap_err();
    assert!(error.is_cancelled());
    assert_eq!(denoiser.calls(), 0);
    assert_eq!(pipeline.state(), PipelineState::Cancelled);
}

#[test]
fn cancellation_stops_before_the_next_step() {
    let cancel = CancellationToken::new();
    let denoiser = Arc::new(MockDenoiser {
        cancel_after: Some((2, cancel.clone())),
        ..MockDenoiser::zero()
    });
    let pipeline = DiffusionPipeline::new(denoiser.clone());

    let error = pipeline
        .run(&tiny(SchedulerKind::Euler, 10), &prompt(), &cancel, &NullProgress)
        .unwrap_err();
    assert!(error.is_cancelled());
    assert_eq!(denoiser.calls(), 2);
}

#[test]
fn image_to_image_runs_truncated_schedule() {
    let mut options = tiny(SchedulerKind::Euler, 10);
    options.process_type = ProcessType::ImageToImage;
    options.strength = 0.5;
    options.memory_mode = MemoryMode::Minimum;

    let denoiser = Arc::new(MockDenoiser::zero());
    let autoencoder = Arc::new(MockAutoEncoder::default());
    let pipeline = DiffusionPipeline::new(denoiser.clone()).with_autoencoder(autoencoder.clone());
    let input = prompt().with_image(Tensor::ones(&[1, 1, 1, 1]));

    let result = pipeline
        .run(&options, &input, &CancellationToken::new(), &NullProgress)
        .unwrap();

    assert_eq!(denoiser.calls(), 5);
    assert_eq!(result.steps, 5);
    assert_eq!(autoencoder.encodes.load(Ordering::SeqCst), 1);
    assert_eq!(autoencoder.decodes.load(Ordering::SeqCst), 1);
    // Minimum memory releases every model once its stage is done
    assert_eq!(denoiser.unloads.load(Ordering::SeqCst), 1);
    assert_eq!(autoencoder.unloads.load(Ordering::SeqCst), 2);

    let image = result.image.unwrap();
    assert_abs_diff_eq!(image.as_slice()[0], result.latents.as_slice()[0] * 2.0, epsilon = 1e-6);

    // First timestep is the middle of the full schedule
    let timesteps = denoiser.timesteps.lock().unwrap().clone();
    let mut full = create_scheduler(SchedulerKind::Euler, options.scheduler_options()).unwrap();
    full.initialize(1.0).unwrap();
    assert_eq!(timesteps.as_slice(), &full.timesteps()[5..]);
}

#[test]
fn image_modes_require_an_image() {
    let mut options = tiny(SchedulerKind::Euler, 4);
    options.process_type = ProcessType::ImageEdit;
    let pipeline = DiffusionPipeline::new(Arc::new(MockDenoiser::zero()))
        .with_autoencoder(Arc::new(MockAutoEncoder::default()));

    let error = pipeline
        .run(&options, &prompt(), &CancellationToken::new(), &NullProgress)
        .unwrap_err();
    assert!(matches!(error, PipelineError::InvalidOptions(_)));
}

#[test]
fn every_scheduler_completes_a_run() {
    for kind in SchedulerKind::ALL {
        let denoiser = Arc::new(MockDenoiser {
            output: 0.1,
            ..MockDenoiser::zero()
        });
        let result = DiffusionPipeline::new(denoiser)
            .run(&tiny(kind, 6), &prompt(), &CancellationToken::new(), &NullProgress)
            .unwrap();
        assert_eq!(result.steps, 6, "{kind}");
        assert!(result.latents.all_finite(), "{kind}");
    }
}
