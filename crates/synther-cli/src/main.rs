//! synther CLI
//!
//! Command-line interface for elucidated diffusion models over RL transitions.
//!
//! Supports:
//! - Inspecting the Karras noise schedule
//! - Generating synthetic transitions from trained weights
//! - Estimating per-example log-likelihoods

use anyhow::{bail, Context, Result};
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use synther_diffusion::noise::read_values;
use synther_diffusion::{
    DiffusionConfig, ElucidatedDiffusion, FittedNormalizer, GeneratorConfig, HeunSampler,
    LikelihoodConfig, Normalizer, NormalizerStats, ResidualMlpConfig, ResidualMlpDenoiser,
    TransitionGenerator, TransitionLayout, Transitions,
};

type SampleBackend = NdArray<f32>;
type GradBackend = Autodiff<NdArray<f32>>;

#[derive(Parser)]
#[command(name = "synther")]
#[command(about = "Elucidated diffusion for synthetic RL transitions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the model comes from and how its network is shaped
#[derive(Args, Debug)]
struct ModelArgs {
    /// Diffusion configuration (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Network weights saved with burn's binary file recorder
    #[arg(long)]
    weights: PathBuf,

    /// Normalizer statistics (JSON); identity when omitted
    #[arg(long)]
    stats: Option<PathBuf>,

    /// Hidden width of the residual MLP
    #[arg(long, default_value = "1024")]
    mlp_width: usize,

    /// Number of residual blocks
    #[arg(long, default_value = "6")]
    num_layers: usize,

    /// Width of the noise-level embedding
    #[arg(long, default_value = "128")]
    dim_t: usize,

    /// Condition vector (comma-separated), broadcast to every sample
    #[arg(long, value_delimiter = ',')]
    cond: Vec<f32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the sampling noise schedule
    Schedule {
        /// Number of sampling steps (defaults to the config's value)
        #[arg(long)]
        steps: Option<usize>,

        /// Diffusion configuration (JSON); built-in defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Generate synthetic transitions
    Sample {
        #[command(flatten)]
        model: ModelArgs,

        /// Total number of transitions to generate
        #[arg(long, default_value = "100000")]
        num_samples: usize,

        /// Samples drawn per sampler call
        #[arg(long, default_value = "100000")]
        batch_size: usize,

        /// Number of sampling steps
        #[arg(long, default_value = "128")]
        steps: usize,

        /// Observation size
        #[arg(long)]
        obs_dim: usize,

        /// Action size
        #[arg(long)]
        action_dim: usize,

        /// The last feature is a terminal flag
        #[arg(long)]
        terminals: bool,

        /// Threshold turning modelled terminals into 0/1
        #[arg(long)]
        terminal_threshold: Option<f32>,

        /// Consecutive transitions stored in one sample
        #[arg(long, default_value = "1")]
        num_transition: usize,

        /// Random seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Output path (JSON)
        #[arg(short, long, default_value = "transitions.json")]
        output: PathBuf,
    },

    /// Estimate log-likelihoods of samples read from a JSON file
    Likelihood {
        #[command(flatten)]
        model: ModelArgs,

        /// Samples as a JSON array of rows in the raw data space
        #[arg(long)]
        input: PathBuf,

        /// Absolute tolerance of the ODE solver
        #[arg(long, default_value = "1e-4")]
        atol: f64,

        /// Relative tolerance of the ODE solver
        #[arg(long, default_value = "1e-4")]
        rtol: f64,

        /// Function evaluation budget
        #[arg(long, default_value = "10000")]
        max_fevals: usize,

        /// Clamp denoised predictions to [-1, 1]
        #[arg(long)]
        clamp: bool,

        /// Treat the input as already normalized
        #[arg(long)]
        normalized: bool,

        /// Random seed for the trace estimator
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

#[derive(Serialize)]
struct TransitionsJson {
    observations: Vec<Vec<f32>>,
    actions: Vec<Vec<f32>>,
    rewards: Vec<f32>,
    next_observations: Vec<Vec<f32>>,
    terminals: Vec<f32>,
}

#[derive(Serialize)]
struct LikelihoodJson {
    log_likelihood: Vec<f32>,
    fevals: usize,
}

fn rows<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<Vec<f32>>> {
    let [_, width] = tensor.dims();
    let values = read_values(tensor)?;
    Ok(values.chunks(width.max(1)).map(<[f32]>::to_vec).collect())
}

impl TransitionsJson {
    fn from_transitions<B: Backend>(t: Transitions<B>) -> Result<Self> {
        Ok(Self {
            observations: rows(t.observations)?,
            actions: rows(t.actions)?,
            rewards: read_values(t.rewards)?,
            next_observations: rows(t.next_observations)?,
            terminals: read_values(t.terminals)?,
        })
    }
}

fn read_config(path: &Path) -> Result<DiffusionConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: DiffusionConfig =
        serde_json::from_str(&content).context("Failed to parse diffusion config")?;
    config.validate().context("Invalid diffusion config")?;
    Ok(config)
}

fn read_stats(path: Option<&Path>) -> Result<NormalizerStats> {
    let Some(path) = path else {
        return Ok(NormalizerStats::Identity);
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read normalizer stats {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse normalizer stats")
}

fn cond_tensor<B: Backend>(cond: &[f32], device: &B::Device) -> Option<Tensor<B, 2>> {
    (!cond.is_empty())
        .then(|| Tensor::from_data(TensorData::new(cond.to_vec(), [1, cond.len()]), device))
}

type Model<B> = ElucidatedDiffusion<ResidualMlpDenoiser<B>, FittedNormalizer<B>>;

fn load_model<B: Backend>(args: &ModelArgs, device: &B::Device) -> Result<Model<B>> {
    let config = read_config(&args.config)?;
    if config.event_shape.len() != 1 {
        bail!(
            "the residual MLP needs a flat event shape, got {:?}",
            config.event_shape
        );
    }

    let mut network_config = ResidualMlpConfig::new(config.event_numel())
        .with_width(args.mlp_width)
        .with_num_layers(args.num_layers)
        .with_dim_t(args.dim_t);
    if !args.cond.is_empty() {
        network_config = network_config.with_cond_dim(args.cond.len());
    }

    let network = network_config
        .init::<B>(device)
        .load_file(
            args.weights.clone(),
            &BinFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .with_context(|| format!("Failed to load weights {}", args.weights.display()))?;

    let normalizer = FittedNormalizer::from_stats(read_stats(args.stats.as_deref())?, device)
        .context("Invalid normalizer stats")?;
    tracing::info!(
        weights = %args.weights.display(),
        event_dim = config.event_numel(),
        unit_range = Normalizer::<B, 2>::unit_range(&normalizer),
        "loaded model"
    );

    Ok(ElucidatedDiffusion::new(config, network, normalizer)?)
}

fn run_schedule(steps: Option<usize>, config: Option<PathBuf>) -> Result<()> {
    let config = match config {
        Some(path) => read_config(&path)?,
        None => DiffusionConfig::new([1]),
    };
    let steps = steps.unwrap_or(config.num_sample_steps);
    if steps == 0 {
        bail!("--steps must be at least 1");
    }

    let sampler = HeunSampler::new(&config, steps);
    println!("{:>5}  {:>14}  {:>8}", "step", "sigma", "gamma");
    for (i, &sigma) in sampler.schedule().sigmas().iter().enumerate() {
        println!("{:>5}  {:>14.6}  {:>8.4}", i, sigma, sampler.gamma(i));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_sample(
    model: ModelArgs,
    num_samples: usize,
    batch_size: usize,
    steps: usize,
    layout: TransitionLayout,
    seed: u64,
    output: PathBuf,
) -> Result<()> {
    let device = Default::default();
    let diffusion = load_model::<SampleBackend>(&model, &device)?;
    let generator = TransitionGenerator::new(
        &diffusion,
        GeneratorConfig::default()
            .with_num_sample_steps(steps)
            .with_sample_batch_size(batch_size),
        layout,
    )?;
    let num_batches = generator.num_batches(num_samples)?;

    let pb = ProgressBar::new(num_batches as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} batches {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message("sampling");

    let cond = cond_tensor::<SampleBackend>(&model.cond, &device);
    let mut rng = StdRng::seed_from_u64(seed);
    let transitions = generator.generate_with_progress(
        num_samples,
        cond,
        &mut rng,
        &device,
        |done, _| pb.set_position(done as u64),
    )?;
    pb.finish_with_message("done");

    let json = TransitionsJson::from_transitions(transitions)?;
    let file = fs::File::create(&output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    serde_json::to_writer(std::io::BufWriter::new(file), &json)
        .context("Failed to write transitions")?;

    println!("Saved {} transitions to: {}", json.rewards.len(), output.display());
    Ok(())
}

fn run_likelihood(
    model: ModelArgs,
    input: PathBuf,
    config: LikelihoodConfig,
    seed: u64,
) -> Result<()> {
    let device = Default::default();
    let diffusion = load_model::<GradBackend>(&model, &device)?;

    let content = fs::read_to_string(&input)
        .with_context(|| format!("Failed to read samples {}", input.display()))?;
    let samples: Vec<Vec<f32>> =
        serde_json::from_str(&content).context("Failed to parse samples")?;
    let width = diffusion.config().event_numel();
    if let Some(row) = samples.iter().position(|r| r.len() != width) {
        bail!("row {row} has {} features, expected {width}", samples[row].len());
    }
    let batch = samples.len();
    let values: Vec<f32> = samples.into_iter().flatten().collect();
    let x = Tensor::<GradBackend, 2>::from_data(TensorData::new(values, [batch, width]), &device);

    let cond = cond_tensor::<GradBackend>(&model.cond, &device);
    let mut rng = StdRng::seed_from_u64(seed);
    let result = diffusion
        .log_likelihood(x, cond, &config, &mut rng)
        .context("Likelihood estimation failed")?;

    let json = LikelihoodJson {
        log_likelihood: read_values(result.log_likelihood)?,
        fevals: result.fevals,
    };
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Schedule { steps, config } => run_schedule(steps, config),

        Commands::Sample {
            model,
            num_samples,
            batch_size,
            steps,
            obs_dim,
            action_dim,
            terminals,
            terminal_threshold,
            num_transition,
            seed,
            output,
        } => {
            let mut layout =
                TransitionLayout::new(obs_dim, action_dim).with_num_transition(num_transition);
            if terminals {
                layout = layout.with_terminals(terminal_threshold);
            }
            run_sample(model, num_samples, batch_size, steps, layout, seed, output)
        }

        Commands::Likelihood {
            model,
            input,
            atol,
            rtol,
            max_fevals,
            clamp,
            normalized,
            seed,
        } => {
            let config = LikelihoodConfig::default()
                .with_tolerances(atol, rtol)
                .with_max_fevals(max_fevals)
                .with_clamp(clamp)
                .with_normalize(!normalized);
            run_likelihood(model, input, config, seed)
        }
    }
}
