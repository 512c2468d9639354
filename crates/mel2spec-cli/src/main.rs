//! mel2spec CLI - mel-to-linear spectrogram refinement.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use mel2spec::{
    load_checkpoint, save_checkpoint, CheckpointMetadata, Device, LossMode, Mel2SpecConfig,
    RefinementConfig, RefinementNetwork,
};
use mlx_rs::Array;

#[derive(Parser)]
#[command(name = "mel2spec")]
#[command(author, version, about = "Mel-to-linear spectrogram refinement", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a freshly initialised network checkpoint
    Init {
        /// Model configuration file (YAML or JSON); LJSpeech defaults if omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Checkpoint output directory
        #[arg(short, long, default_value = "./checkpoint")]
        output: PathBuf,
    },

    /// Print a checkpoint's configuration and parameter inventory
    Inspect {
        /// Checkpoint directory
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// List every tensor with its shape
        #[arg(long)]
        tensors: bool,
    },

    /// Refine mel spectrograms stored in a safetensors file
    Refine {
        /// Checkpoint directory
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Input safetensors file with a `[B, 1, mel_freq, T]` tensor
        #[arg(short, long)]
        input: PathBuf,

        /// Output safetensors file
        #[arg(short, long)]
        output: PathBuf,

        /// Name of the input tensor
        #[arg(long, default_value = "mel")]
        input_key: String,

        /// Name of the output tensor
        #[arg(long, default_value = "spec")]
        output_key: String,

        /// Compute device
        #[arg(long, value_enum, default_value_t = DeviceArg::Cpu)]
        device: DeviceArg,
    },

    /// List the smoothness loss modes and their pooling windows
    LossModes,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceArg {
    Cpu,
    Gpu,
}

impl From<DeviceArg> for Device {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Cpu => Device::Cpu,
            DeviceArg::Gpu => Device::Gpu,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { config, output } => run_init(config, output),
        Commands::Inspect {
            checkpoint,
            tensors,
        } => run_inspect(checkpoint, tensors),
        Commands::Refine {
            checkpoint,
            input,
            output,
            input_key,
            output_key,
            device,
        } => run_refine(checkpoint, input, output, &input_key, &output_key, device.into()),
        Commands::LossModes => {
            for mode in LossMode::all() {
                let pairs: Vec<String> = mode.pairs().iter().map(ToString::to_string).collect();
                println!("{:>2}  {}", mode.id(), pairs.join(" "));
            }
            Ok(())
        }
    }
}

fn run_init(config: Option<PathBuf>, output: PathBuf) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => Mel2SpecConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
            .mel2spec,
        None => RefinementConfig::default(),
    };
    let network = RefinementNetwork::new(config).context("Failed to build network")?;
    save_checkpoint(&output, &network, CheckpointMetadata::new(0, 0))?;

    println!(
        "Initialised {} parameters in {}",
        network.num_parameters(),
        output.display()
    );
    Ok(())
}

fn run_inspect(checkpoint: PathBuf, tensors: bool) -> anyhow::Result<()> {
    let (network, metadata) = load_checkpoint(&checkpoint)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;

    println!("{}", serde_json::to_string_pretty(network.config())?);
    println!("Channel widths: {:?}", network.widths());
    println!("Parameters: {}", network.num_parameters());
    println!("Step: {} (epoch {})", metadata.step, metadata.epoch);
    if let Some(loss) = metadata.best_val_loss {
        println!("Best validation loss: {loss:.6}");
    }

    if tensors {
        let mut all: Vec<(String, Vec<i32>)> = network
            .named_parameters()
            .into_iter()
            .chain(network.named_buffers())
            .map(|(name, array)| (name.to_string(), array.shape().to_vec()))
            .collect();
        all.sort();
        for (name, shape) in all {
            println!("  {name:<40} {shape:?}");
        }
    }
    Ok(())
}

fn run_refine(
    checkpoint: PathBuf,
    input: PathBuf,
    output: PathBuf,
    input_key: &str,
    output_key: &str,
    device: Device,
) -> anyhow::Result<()> {
    let (mut network, _) = load_checkpoint(&checkpoint)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
    network.relocate(device);

    let mut inputs = Array::load_safetensors(&input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let mel = inputs
        .remove(input_key)
        .with_context(|| format!("{} has no tensor named {input_key:?}", input.display()))?;
    tracing::info!(shape = ?mel.shape(), "Refining");

    let spec = network.forward(&mel, mel2spec::OperationMode::Infer)?;
    spec.eval()?;

    let mut outputs = HashMap::new();
    outputs.insert(output_key.to_string(), spec);
    Array::save_safetensors(outputs, None, &output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Wrote {} to {}", output_key, output.display());
    Ok(())
}
