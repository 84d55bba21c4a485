//! Session adapters: input naming, positional outputs and reload on demand

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::MockSession;
use ts_core::{CancellationToken, NullProgress, Tensor};
use ts_generate::{DecoderConfig, DecoderInput, DecoderModel, GenerateError};
use ts_pipeline::{
    DenoiseInput, DenoiseModel, DiffusionInput, DiffusionOptions, DiffusionPipeline, MemoryMode,
    OnnxDecoder, OnnxDenoiser, PromptEmbeddings,
};
use ts_runtime::{DataType, NamedTensors, TensorValue};
use ts_scheduler::SchedulerKind;

fn denoiser_session() -> MockSession {
    MockSession::new(NamedTensors::new().with("out_sample", Tensor::zeros(&[1, 1, 1, 1])))
}

#[test]
fn denoiser_loads_on_demand_and_names_inputs() {
    let denoiser = OnnxDenoiser::new(denoiser_session()).with_control_net();
    let sample = Tensor::ones(&[1, 1, 1, 1]);
    let hidden = Tensor::zeros(&[1, 2, 4]);
    let control = Tensor::ones(&[1, 3, 8, 8]);

    let prediction = denoiser
        .predict(&DenoiseInput {
            sample: &sample,
            timestep: 999.0,
            encoder_hidden_states: &hidden,
            image_latents: None,
            control_image: Some(&control),
            control_scale: 0.8,
        })
        .unwrap();

    assert_eq!(prediction.dimensions(), &[1, 1, 1, 1]);
    assert!(denoiser.supports_control_net());
    let session = denoiser.session();
    assert_eq!(session.loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        session.input_names(),
        vec![
            "sample",
            "timestep",
            "encoder_hidden_states",
            "controlnet_cond",
            "conditioning_scale"
        ]
    );
}

#[test]
fn minimum_memory_reloads_between_runs() {
    let denoiser = Arc::new(OnnxDenoiser::new(denoiser_session()));
    let pipeline = DiffusionPipeline::new(denoiser.clone());
    let options = DiffusionOptions {
        scheduler: SchedulerKind::Euler,
        steps: 3,
        guidance_scale: 1.0,
        width: 8,
        height: 8,
        latent_channels: 1,
        memory_mode: MemoryMode::Minimum,
        ..Default::default()
    };
    let input = DiffusionInput::new(PromptEmbeddings::new(Tensor::zeros(&[1, 2, 4])));

    for _ in 0..2 {
        pipeline
            .run(&options, &input, &CancellationToken::new(), &NullProgress)
            .unwrap();
    }

    let session = denoiser.session();
    assert_eq!(session.loads.load(Ordering::SeqCst), 2);
    assert_eq!(session.unloads.load(Ordering::SeqCst), 2);
}

fn decoder_config() -> DecoderConfig {
    DecoderConfig {
        num_layers: 1,
        num_kv_heads: 1,
        head_dim: 2,
        vocab_size: 4,
        is_encoder_decoder: true,
        has_hidden_state: false,
    }
}

#[test]
fn decoder_outputs_are_read_in_graph_order() {
    let outputs = NamedTensors::new()
        .with("logits", Tensor::new(&[1, 1, 4], vec![0.0, 3.0, 1.0, 2.0]).unwrap())
        .with("present.0.decoder.key", Tensor::filled(&[1, 1, 1, 2], 1.0))
        .with("present.0.decoder.value", Tensor::filled(&[1, 1, 1, 2], 2.0))
        .with("present.0.encoder.key", Tensor::filled(&[1, 1, 5, 2], 3.0))
        .with("present.0.encoder.value", Tensor::filled(&[1, 1, 5, 2], 4.0));
    let decoder = OnnxDecoder::new(MockSession::new(outputs), decoder_config());

    let past = vec![Tensor::zeros(&[1, 1, 1, 2]); 4];
    let hidden = Tensor::zeros(&[1, 5, 8]);
    let output = decoder
        .run_decoder(&DecoderInput {
            input_ids: vec![0],
            past_key_values: &past,
            use_branch_cache: false,
            encoder_hidden_states: Some(&hidden),
        })
        .unwrap();

    assert_eq!(output.last_token_logits().unwrap(), &[0.0, 3.0, 1.0, 2.0]);
    assert_eq!(output.present_value(0).unwrap().as_slice()[0], 2.0);
    assert_eq!(output.encoder_key(0).unwrap().dimensions(), &[1, 1, 5, 2]);

    let names = decoder.past_key_value_names();
    assert_eq!(names[2], "past_key_values.0.encoder.key");
    let sent = decoder.session().input_names();
    assert_eq!(sent[0], "input_ids");
    assert_eq!(sent[1], "use_cache_branch");
    assert_eq!(sent.last().map(String::as_str), Some("encoder_hidden_states"));

    let inputs = decoder.session().last_inputs.lock().unwrap().clone().unwrap();
    assert_eq!(inputs.get("input_ids").unwrap().data_type(), DataType::Long);
    assert_eq!(
        inputs.get("use_cache_branch"),
        Some(&TensorValue::Bool(Tensor::filled(&[1], false)))
    );
}

#[test]
fn decoder_sends_branch_flag_as_bool() {
    let outputs = NamedTensors::new()
        .with("logits", Tensor::zeros(&[1, 1, 4]))
        .with("present.0.decoder.key", Tensor::zeros(&[1, 1, 2, 2]))
        .with("present.0.decoder.value", Tensor::zeros(&[1, 1, 2, 2]))
        .with("present.0.encoder.key", Tensor::zeros(&[1, 1, 5, 2]))
        .with("present.0.encoder.value", Tensor::zeros(&[1, 1, 5, 2]));
    let decoder = OnnxDecoder::new(MockSession::new(outputs), decoder_config());

    let past = vec![Tensor::zeros(&[1, 1, 1, 2]); 4];
    let hidden = Tensor::zeros(&[1, 5, 8]);
    decoder
        .run_decoder(&DecoderInput {
            input_ids: vec![3],
            past_key_values: &past,
            use_branch_cache: true,
            encoder_hidden_states: Some(&hidden),
        })
        .unwrap();

    let inputs = decoder.session().last_inputs.lock().unwrap().clone().unwrap();
    let flag = inputs.get("use_cache_branch").unwrap();
    assert_eq!(flag.data_type(), DataType::Bool);
    assert_eq!(flag, &TensorValue::Bool(Tensor::filled(&[1], true)));
}

#[test]
fn decoder_rejects_wrong_cache_count() {
    let decoder = OnnxDecoder::new(MockSession::new(NamedTensors::new()), decoder_config());
    let past = vec![Tensor::zeros(&[1, 1, 1, 2]); 2];
    let result = decoder.run_decoder(&DecoderInput {
        input_ids: vec![0],
        past_key_values: &past,
        use_branch_cache: true,
        encoder_hidden_states: None,
    });
    assert!(matches!(
        result,
        Err(GenerateError::ConfigurationMismatch { expected: 4, got: 2, .. })
    ));
}
