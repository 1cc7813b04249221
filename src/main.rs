//! SAE-rs CLI: train a sparse autoencoder on stored activations

use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use sae_rs::{
    LossReducer, LossWeightedResampler, MetricsPipeline, Pipeline, PipelineConfig,
    SparseAutoencoder, SparseAutoencoderConfig, TensorActivationStore,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-rs")]
#[command(about = "Sparse autoencoder training with dead-neuron resampling")]
#[command(version)]
struct Cli {
    /// Safetensors file holding a 2D activation tensor [n_items, n_neurons]
    #[arg(short, long)]
    activations: PathBuf,

    /// Name of the activation tensor inside the file
    #[arg(long, default_value = "activations")]
    tensor_name: String,

    /// JSON training config (fields not given take defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override number of training steps
    #[arg(long)]
    steps: Option<usize>,

    /// Override training batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override learned features per input feature
    #[arg(long)]
    expansion_factor: Option<usize>,

    /// Override L1 sparsity coefficient
    #[arg(long)]
    l1: Option<f64>,

    /// Output directory for the model and results
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(steps) = cli.steps {
        config.n_steps = steps;
    }
    if let Some(batch_size) = cli.batch_size {
        config.train_batch_size = batch_size;
    }
    if let Some(expansion_factor) = cli.expansion_factor {
        config.expansion_factor = expansion_factor;
    }
    if let Some(l1) = cli.l1 {
        config.l1_coefficient = l1;
    }
    config.validate()?;

    let device = if cli.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    println!("=== SAE-rs: Sparse Autoencoder Training ===");
    println!("Activations: {}", cli.activations.display());
    println!("Output:      {}", cli.output.display());
    if cli.cpu {
        println!("Mode:        CPU (forced)");
    }

    // Load activations
    info!("Loading activations...");
    let store =
        TensorActivationStore::from_safetensors(&cli.activations, &cli.tensor_name, None, &device)?;

    let sae_config = SparseAutoencoderConfig {
        n_input_features: store.n_neurons(),
        n_learned_features: store.n_neurons() * config.expansion_factor,
    };
    let autoencoder = SparseAutoencoder::new(sae_config, &device)?;
    autoencoder.initialize_tied_bias_to_geometric_median(&store, 100)?;

    // Train
    let mut pipeline = Pipeline::new(
        autoencoder,
        Box::new(LossReducer::standard(config.l1_coefficient)),
        Box::new(LossWeightedResampler::new(config.seed)),
        MetricsPipeline::standard(),
        config,
    );
    let results = pipeline.run(&store)?;

    // Print results
    println!("\n=== Results ===");
    println!("Steps:              {}", results.steps);
    println!("Final loss:         {:.5}", results.final_loss);
    println!("Resampling passes:  {}", results.n_resamples);
    println!("Neurons resampled:  {}", results.neurons_resampled);
    if let Some((step, log)) = results.history.last() {
        for (name, value) in log {
            println!("  [{step}] {name}: {value:.5}");
        }
    }

    // Save model and results
    std::fs::create_dir_all(&cli.output)?;
    pipeline
        .autoencoder()
        .save(&cli.output.join("sae.safetensors"))?;
    let results_path = cli.output.join("sae_results.json");
    std::fs::write(&results_path, serde_json::to_string_pretty(&results)?)?;
    info!("Results saved to {}", results_path.display());

    Ok(())
}
