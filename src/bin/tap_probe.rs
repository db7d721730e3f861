// SPDX-License-Identifier: MIT OR Apache-2.0

//! Inference CLI with activation extraction and probe computation.
//!
//! Runs one generation, reports activation-store statistics, and — when a
//! probe checkpoint is given — scores one captured activation with it.
//! Usage errors are reported without touching the model; probe errors are
//! reported without failing the process.

use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::DType;
use candle_tap::{
    compute_probe, load_probe_from_file, ActivationStore, DevicePreference, ModelConfig,
    ModelHandler, SamplingOptions,
};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tap-probe")]
#[command(about = "Run inference with optional activation extraction and probe computation")]
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

    /// Enable activation extraction during inference
    #[arg(long)]
    extract_activations: bool,

    /// Comma-separated layer indices to extract from (e.g. "0,5,10");
    /// empty extracts from all layers
    #[arg(long)]
    extract_layers: Option<String>,

    /// Path to a probe checkpoint to compute probe outputs
    #[arg(long)]
    probe_path: Option<PathBuf>,

    /// Layer index to use for probe computation (required with --probe-path)
    #[arg(long)]
    probe_layer: Option<usize>,

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

    // Usage validation happens before any model work.
    let extract_layers = match validate_usage(&cli) {
        Ok(layers) => layers,
        Err(message) => {
            eprintln!("{message}");
            return Ok(());
        }
    };

    let mut config = ModelConfig::new(&cli.model_name);
    config.local_files_only = cli.local_files_only;
    config.extract_activations = cli.extract_activations;
    config.extract_layers = extract_layers;
    if cli.cpu {
        config.device = DevicePreference::Cpu;
    }

    let mut handler = ModelHandler::load(config)?;
    let text = handler.generate(&cli.prompt, &SamplingOptions::default())?;
    println!("Generated text: {text}\n");

    if cli.extract_activations {
        match handler.activation_store() {
            Some(store) => report_activations(
                store.as_ref(),
                cli.probe_path.as_deref(),
                cli.probe_layer,
            ),
            None => eprintln!(
                "Warning: activation extraction was requested but the store is not available"
            ),
        }
    }
    Ok(())
}

/// Print store statistics and, when requested, one probe output.
fn report_activations(
    store: &dyn ActivationStore,
    probe_path: Option<&Path>,
    probe_layer: Option<usize>,
) {
    let stats = store.stats();
    let stats_json = serde_json::to_string(&stats).unwrap_or_else(|_| stats.to_string());
    println!("Activation extraction stats: {stats_json}");

    let Some(request_id) = stats.requests.first() else {
        return;
    };
    let layers = store.layers_for_request(request_id);
    let positions = store.positions_for_request(request_id);
    println!("Request {request_id}:");
    println!("  Available layers: {layers:?}");
    println!("  Available positions: {positions:?}");

    let (Some(path), Some(layer)) = (probe_path, probe_layer) else {
        println!("\nTip: use --probe-path and --probe-layer to compute probe outputs");
        return;
    };
    // Probe failures are reported, never fatal.
    if let Err(e) = run_probe(store, request_id, path, layer, &positions) {
        eprintln!("\nError computing probe: {e}");
    }
}

/// Load the probe and score the first available position of `layer`.
fn run_probe(
    store: &dyn ActivationStore,
    request_id: &str,
    path: &Path,
    layer: usize,
    positions: &[usize],
) -> candle_tap::Result<()> {
    let (weights, bias) = load_probe_from_file(path)?;
    println!("\nLoaded probe from {}", path.display());
    println!("Probe weights shape: {:?}", weights.dims());

    let Some(&position) = positions.first() else {
        println!("\nWarning: no token positions available for probe computation");
        return Ok(());
    };
    let Some(activation) = store.activation(request_id, layer, position) else {
        println!("\nWarning: no activation found for layer {layer}, position {position}");
        return Ok(());
    };

    // Align dtypes before the product; probes are typically saved in F32.
    let activation = activation.to_dtype(DType::F32)?;
    let weights = weights.to_dtype(DType::F32)?;
    let bias = match bias {
        Some(b) => Some(b.to_dtype(DType::F32)?),
        None => None,
    };

    let output = compute_probe(&activation, &weights, bias.as_ref())?;
    println!("\nProbe output for layer {layer}, position {position}:");
    let values = output.flatten_all()?.to_vec1::<f32>()?;
    match values.as_slice() {
        [value] => println!("  Value: {value}"),
        _ => println!("  Value: {values:?}"),
    }
    Ok(())
}

/// Check flag combinations that must be rejected before any model work,
/// returning the parsed layer filter on success and the message to print
/// on failure.
fn validate_usage(cli: &Cli) -> std::result::Result<Option<Vec<usize>>, String> {
    let layers = parse_layers(cli.extract_layers.as_deref())
        .map_err(|_| "Error: --extract-layers must be comma-separated integers".to_string())?;
    if cli.probe_path.is_some() && cli.probe_layer.is_none() {
        return Err("Error: --probe-layer is required when --probe-path is set".to_string());
    }
    Ok(layers)
}

/// Parse a comma-separated layer list; an empty list means all layers.
fn parse_layers(spec: Option<&str>) -> std::result::Result<Option<Vec<usize>>, ()> {
    let Some(spec) = spec else {
        return Ok(None);
    };
    let mut layers = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        layers.push(part.parse::<usize>().map_err(|_| ())?);
    }
    Ok(Some(layers))
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["tap-probe"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn probe_path_without_probe_layer_is_a_usage_error() {
        let cli = cli(&["--probe-path", "/tmp/probe.safetensors"]);
        let message = validate_usage(&cli).unwrap_err();
        assert_eq!(
            message,
            "Error: --probe-layer is required when --probe-path is set"
        );
    }

    #[test]
    fn probe_path_with_probe_layer_passes_validation() {
        let cli = cli(&["--probe-path", "/tmp/probe.safetensors", "--probe-layer", "3"]);
        assert!(validate_usage(&cli).is_ok());
    }

    #[test]
    fn bad_extract_layers_is_a_usage_error() {
        let cli = cli(&["--extract-layers", "0,five,10"]);
        let message = validate_usage(&cli).unwrap_err();
        assert_eq!(
            message,
            "Error: --extract-layers must be comma-separated integers"
        );
    }

    #[test]
    fn extract_layers_parsing() {
        assert_eq!(parse_layers(None).unwrap(), None);
        assert_eq!(parse_layers(Some("0,5,10")).unwrap(), Some(vec![0, 5, 10]));
        assert_eq!(parse_layers(Some(" 1 , 2 ")).unwrap(), Some(vec![1, 2]));
        // Empty entries are skipped; an empty filter means all layers.
        assert_eq!(parse_layers(Some("")).unwrap(), Some(vec![]));
        assert!(parse_layers(Some("1,x")).is_err());
        assert!(parse_layers(Some("-1")).is_err());
    }
}
