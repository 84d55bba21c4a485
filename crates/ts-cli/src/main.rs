//! TensorStack command line
//!
//! Usage:
//!   tensorstack schedule --scheduler euler --steps 20     - Print timesteps and sigmas
//!   tensorstack trace --scheduler kdpm2ancestral          - Step a latent with a fixed prediction
//!   tensorstack sample --logits 0.1,2.0,0.5 --count 8     - Draw tokens from logits
//!   tensorstack inspect model.onnx                        - Print model inputs/outputs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use ts_core::{CancellationToken, ProgressRecord, Tensor};
use ts_generate::{Sampler, SamplingParams};
use ts_pipeline::{
    DenoiseInput, DenoiseModel, DiffusionInput, DiffusionOptions, DiffusionPipeline,
    PipelineResult, PromptEmbeddings,
};
use ts_runtime::{InferenceConfig, OnnxSession};
use ts_scheduler::{SchedulerKind, SchedulerOptions, create_scheduler};

#[derive(Parser)]
#[command(name = "tensorstack", about = "TensorStack inference tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a scheduler's timesteps and sigmas as JSON
    Schedule {
        /// Scheduler name (euler, eulerancestral, kdpm2ancestral, ddpm, ...)
        #[arg(short, long, default_value = "euler")]
        scheduler: String,
        #[arg(long, default_value_t = 30)]
        steps: usize,
        #[arg(long, default_value_t = 1.0)]
        strength: f32,
        /// JSON file with scheduler options
        #[arg(short, long)]
        options: Option<PathBuf>,
    },
    /// Run the denoising loop with a constant model prediction
    Trace {
        #[arg(short, long, default_value = "euler")]
        scheduler: String,
        #[arg(long, default_value_t = 10)]
        steps: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Value the stand-in model predicts everywhere
        #[arg(long, default_value_t = 0.0)]
        prediction: f32,
    },
    /// Draw tokens from a logits vector
    Sample {
        /// Comma separated logits
        #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true)]
        logits: Vec<f32>,
        #[arg(long, default_value_t = 50)]
        top_k: usize,
        #[arg(long, default_value_t = 1.0)]
        top_p: f32,
        #[arg(short, long, default_value_t = 1.0)]
        temperature: f32,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },
    /// Load an ONNX model and print its inputs and outputs
    Inspect { model: PathBuf },
}

#[derive(Serialize)]
struct ScheduleReport {
    scheduler: String,
    start_step: usize,
    start_sigma: f32,
    timesteps: Vec<f32>,
    sigmas: Vec<f32>,
}

#[derive(Serialize)]
struct TraceStep {
    step: usize,
    total_steps: usize,
    mean: f32,
}

/// Stand-in model predicting one value everywhere
struct ConstantDenoiser(f32);

impl DenoiseModel for ConstantDenoiser {
    fn predict(&self, input: &DenoiseInput<'_>) -> PipelineResult<Tensor<f32>> {
        Ok(Tensor::filled(input.sample.dimensions(), self.0))
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Schedule {
            scheduler,
            steps,
            strength,
            options,
        } => print_schedule(&scheduler, steps, strength, options),
        Commands::Trace {
            scheduler,
            steps,
            seed,
            prediction,
        } => trace(&scheduler, steps, seed, prediction),
        Commands::Sample {
            logits,
            top_k,
            top_p,
            temperature,
            seed,
            count,
        } => sample(
            logits,
            SamplingParams {
                top_k,
                top_p,
                temperature,
            },
            seed,
            count,
        ),
        Commands::Inspect { model } => inspect(model),
    }
}

fn load_options(path: Option<PathBuf>) -> Result<SchedulerOptions> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(SchedulerOptions::default()),
    }
}

fn print_schedule(name: &str, steps: usize, strength: f32, options: Option<PathBuf>) -> Result<()> {
    let kind: SchedulerKind = name.parse()?;
    let options = load_options(options)?.with_steps(steps);
    let mut scheduler = create_scheduler(kind, options)?;
    scheduler.initialize(strength)?;

    let state = scheduler.state();
    let report = ScheduleReport {
        scheduler: kind.to_string(),
        start_step: state.start_step(),
        start_sigma: state.start_sigma(),
        timesteps: state.timesteps().to_vec(),
        sigmas: state.sigmas().to_vec(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn trace(name: &str, steps: usize, seed: u64, prediction: f32) -> Result<()> {
    let options = DiffusionOptions {
        scheduler: name.parse()?,
        scheduler_options: SchedulerOptions::default(),
        guidance_scale: 1.0,
        width: 8,
        height: 8,
        latent_channels: 1,
        ..DiffusionOptions::default().with_seed(seed).with_steps(steps)
    };
    let input = DiffusionInput::new(PromptEmbeddings::new(Tensor::zeros(&[1, 1, 1])));
    let pipeline = DiffusionPipeline::new(Arc::new(ConstantDenoiser(prediction)));

    let print_step = |record: ProgressRecord| {
        let step = TraceStep {
            step: record.step,
            total_steps: record.total_steps,
            mean: record.sample.as_ref().map(|s| s.mean()).unwrap_or(f32::NAN),
        };
        if let Ok(line) = serde_json::to_string(&step) {
            println!("{line}");
        }
    };
    let result = pipeline.run(&options, &input, &CancellationToken::new(), &print_step)?;
    log::info!("Trace finished in {:?}", result.elapsed);
    Ok(())
}

fn sample(logits: Vec<f32>, params: SamplingParams, seed: u64, count: usize) -> Result<()> {
    if logits.is_empty() {
        bail!("--logits needs at least one value");
    }
    let mut sampler = Sampler::new(seed);
    let mut draws = Vec::with_capacity(count);
    for _ in 0..count {
        let mut scratch = logits.clone();
        draws.push(sampler.sample(&mut scratch, &params)?);
    }
    println!("{}", serde_json::to_string(&draws)?);
    Ok(())
}

fn inspect(model: PathBuf) -> Result<()> {
    let session = OnnxSession::new(&model, InferenceConfig::default());
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let metadata = runtime.block_on(session.load_async())?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_args() {
        let cli = Cli::try_parse_from([
            "tensorstack",
            "sample",
            "--logits",
            "0.5,-1.0,2.0",
            "--top-k",
            "2",
            "--count",
            "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Sample {
                logits,
                top_k,
                count,
                ..
            } => {
                assert_eq!(logits, vec![0.5, -1.0, 2.0]);
                assert_eq!(top_k, 2);
                assert_eq!(count, 3);
            }
            _ => panic!("expected sample"),
        }
    }

    #[test]
    fn test_schedule_rejects_unknown_scheduler() {
        assert!(print_schedule("lms", 10, 1.0, None).is_err());
        assert!(print_schedule("euler", 10, 1.0, None).is_ok());
    }

    #[test]
    fn test_trace_runs() {
        trace("kdpm2ancestral", 3, 1, 0.0).unwrap();
    }

    #[test]
    fn test_sample_needs_logits() {
        let params = SamplingParams {
            top_k: 1,
            top_p: 1.0,
            temperature: 1.0,
        };
        assert!(sample(Vec::new(), params, 0, 1).is_err());
        assert!(sample(vec![0.1, 0.9], params, 0, 2).is_ok());
    }
}
