// SPDX-License-Identifier: MIT OR Apache-2.0

//! Base inference CLI: load a model and print one continuation.

use anyhow::Result;
use candle_tap::{DevicePreference, ModelConfig, ModelHandler, SamplingOptions};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tap-generate")]
#[command(about = "Run single-prompt generation with a local model")]
#[command(version)]
struct Cli {
    /// Model id from `HuggingFace` (e.g. "meta-llama/Llama-3.2-1B")
    #[arg(long, default_value = "meta-llama/Llama-3.2-1B")]
    model_name: String,

    /// Prompt to continue
    #[arg(long, default_value = "Hello, how are you?")]
    prompt: String,

    /// Only use files from the local cache, don't download
    #[arg(long)]
    local_files_only: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut config = ModelConfig::new(&cli.model_name);
    config.local_files_only = cli.local_files_only;
    if cli.cpu {
        config.device = DevicePreference::Cpu;
    }

    let mut handler = ModelHandler::load(config)?;
    let text = handler.generate(&cli.prompt, &SamplingOptions::default())?;
    println!("{text}");
    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
