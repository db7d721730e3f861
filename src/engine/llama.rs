// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in engine adapter over `candle-transformers`' LLaMA family.
//!
//! Loads safetensors weights from the local `HuggingFace` cache (fetching
//! through `hf-hub` when absent) and runs blocking single-prompt
//! generation with a per-request KV cache.
//!
//! This adapter does **not** expose its network module:
//! `candle-transformers` keeps per-layer outputs internal to the forward
//! pass, so activation extraction against it is disabled with a warning
//! while generation proceeds normally.

use std::path::PathBuf;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use tokenizers::Tokenizer;
use tracing::info;

use crate::cache::ModelCache;
use crate::engine::{EngineInfo, SamplingOptions, TextEngine};
use crate::error::{Result, TapError};
use crate::sampling::sample_token;

// ---------------------------------------------------------------------------
// LlamaEngine
// ---------------------------------------------------------------------------

/// A loaded LLaMA-family model with its tokenizer.
pub struct LlamaEngine {
    /// Repository id the model was loaded from.
    model_id: String,
    /// Device the weights live on.
    device: Device,
    /// Weight dtype (F16 on CUDA, F32 on CPU).
    dtype: DType,
    /// The model itself.
    model: Llama,
    /// Runtime configuration (also sizes the KV cache).
    config: Config,
    /// `HuggingFace` tokenizer.
    tokenizer: Tokenizer,
    /// End-of-sequence token ids from `config.json`.
    eos_ids: Vec<u32>,
}

impl LlamaEngine {
    /// Load a model from the hub cache, downloading missing files.
    ///
    /// `prefer_cpu` forces the CPU even when a CUDA device is available.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::Download`] when files cannot be resolved,
    /// [`TapError::Config`] when `config.json` does not describe a
    /// LLaMA-family model, and [`TapError::Model`] when weight loading
    /// fails.
    pub fn load(model_id: &str, cache: &ModelCache, prefer_cpu: bool) -> Result<Self> {
        let device = if prefer_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)?
        };
        // F16 matches common checkpoint dtype on GPU; full precision on CPU.
        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };

        let api = ApiBuilder::new()
            .with_cache_dir(cache.root().to_path_buf())
            .build()
            .map_err(|e| TapError::Download(e.to_string()))?;
        let repo = api.model(model_id.to_string());

        let config_path = fetch(&repo, "config.json")?;
        let tokenizer_path = fetch(&repo, "tokenizer.json")?;
        let weights_paths = resolve_safetensors_paths(&repo)?;

        let config_json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&config_path)?)
                .map_err(|e| TapError::Config(format!("parse config.json: {e}")))?;
        let eos_ids = eos_ids_from_config(&config_json);
        let llama_config: LlamaConfig = serde_json::from_value(config_json)
            .map_err(|e| TapError::Config(format!("config.json is not a LLaMA config: {e}")))?;
        let config = llama_config.into_config(false);

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| TapError::Tokenizer(e.to_string()))?;

        // SAFETY: the safetensors files must not be modified while the
        // model is loaded — the standard invariant for memory-mapped files.
        #[allow(unsafe_code)]
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        info!(model_id, cuda = device.is_cuda(), "loaded LLaMA model");
        Ok(Self {
            model_id: model_id.to_string(),
            device,
            dtype,
            model,
            config,
            tokenizer,
            eos_ids,
        })
    }

    /// Decode generated token ids, skipping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| TapError::Tokenizer(e.to_string()))
    }
}

impl TextEngine for LlamaEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "candle-llama",
            model_id: self.model_id.clone(),
        }
    }

    fn generate(&mut self, prompt: &str, options: &SamplingOptions) -> Result<String> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| TapError::Tokenizer(e.to_string()))?;
        let prompt_ids: Vec<u32> = encoding.get_ids().to_vec();
        if prompt_ids.is_empty() {
            return Err(TapError::Config("prompt tokenized to zero tokens".into()));
        }

        // Fresh KV cache per request; the handler never overlaps calls.
        let mut kv_cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        let mut generated: Vec<u32> = Vec::with_capacity(options.max_tokens);
        let mut index_pos = 0usize;

        // Prime on the full prompt, then decode one token at a time.
        let mut next_input = prompt_ids;
        for _ in 0..options.max_tokens {
            let input =
                Tensor::new(next_input.as_slice(), &self.device)?.reshape((1, next_input.len()))?;
            let logits = self.model.forward(&input, index_pos, &mut kv_cache)?;
            index_pos += next_input.len();

            let last = last_position_logits(&logits)?;
            let token = sample_token(&last, options, &generated)?;
            if self.eos_ids.contains(&token) {
                break;
            }
            generated.push(token);

            if let Some(stops) = options.stop.as_deref() {
                if !stops.is_empty() {
                    let text = self.decode(&generated)?;
                    if let Some(truncated) = truncate_at_stop(&text, stops) {
                        return Ok(truncated);
                    }
                }
            }
            next_input = vec![token];
        }

        self.decode(&generated)
    }

    // Inherits `network_module` = None: the forward pass above offers no
    // per-layer observation points.
}

// ---------------------------------------------------------------------------
// File resolution
// ---------------------------------------------------------------------------

/// Fetch one repo file through the hub api (cache-first).
fn fetch(repo: &ApiRepo, filename: &str) -> Result<PathBuf> {
    repo.get(filename)
        .map_err(|e| TapError::Download(format!("{filename}: {e}")))
}

/// Index structure for sharded safetensors models.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name → shard filename.
    weight_map: std::collections::HashMap<String, String>,
}

/// Resolve safetensors paths: sharded via `model.safetensors.index.json`
/// when present, single `model.safetensors` otherwise.
fn resolve_safetensors_paths(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        let index: SafetensorsIndex =
            serde_json::from_str(&std::fs::read_to_string(&index_path)?)
                .map_err(|e| TapError::Config(format!("parse safetensors index: {e}")))?;

        let mut shard_names: Vec<String> = index.weight_map.into_values().collect();
        shard_names.sort();
        shard_names.dedup();

        let mut paths = Vec::with_capacity(shard_names.len());
        for shard_name in &shard_names {
            paths.push(fetch(repo, shard_name)?);
        }
        return Ok(paths);
    }

    Ok(vec![fetch(repo, "model.safetensors")?])
}

// ---------------------------------------------------------------------------
// Config and logits helpers
// ---------------------------------------------------------------------------

/// Read `eos_token_id` from a raw `config.json` value (number or array).
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn eos_ids_from_config(config: &serde_json::Value) -> Vec<u32> {
    match config.get("eos_token_id") {
        Some(serde_json::Value::Number(n)) => {
            n.as_u64().map(|v| v as u32).into_iter().collect()
        }
        Some(serde_json::Value::Array(values)) => values
            .iter()
            .filter_map(serde_json::Value::as_u64)
            .map(|v| v as u32)
            .collect(),
        _ => Vec::new(),
    }
}

/// Reduce a forward-pass output to the last position's logits
/// (`[vocab_size]`), tolerating the rank variations across model
/// versions.
fn last_position_logits(logits: &Tensor) -> Result<Tensor> {
    let t = match logits.rank() {
        1 => logits.clone(),
        2 => logits.i((logits.dim(0)? - 1, ..))?,
        3 => logits.i((0, logits.dim(1)? - 1, ..))?,
        rank => {
            return Err(TapError::Model(candle_core::Error::Msg(format!(
                "unexpected logits rank {rank}"
            ))))
        }
    };
    Ok(t)
}

/// Cut `text` at the earliest stop-sequence occurrence, if any.
fn truncate_at_stop(text: &str, stops: &[String]) -> Option<String> {
    let cut = stops
        .iter()
        .filter_map(|stop| text.find(stop.as_str()))
        .min()?;
    Some(text[..cut].to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn eos_single_and_multiple() {
        let single: serde_json::Value = serde_json::json!({ "eos_token_id": 2 });
        assert_eq!(eos_ids_from_config(&single), vec![2]);

        let multiple: serde_json::Value =
            serde_json::json!({ "eos_token_id": [128001, 128009] });
        assert_eq!(eos_ids_from_config(&multiple), vec![128_001, 128_009]);

        let missing: serde_json::Value = serde_json::json!({});
        assert!(eos_ids_from_config(&missing).is_empty());
    }

    #[test]
    fn last_position_logits_per_rank() {
        let device = Device::Cpu;

        let rank1 = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        assert_eq!(last_position_logits(&rank1).unwrap().dims(), &[2]);

        let rank2 = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &device).unwrap();
        let last = last_position_logits(&rank2).unwrap();
        assert_eq!(last.to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);

        let rank3 = rank2.unsqueeze(0).unwrap();
        let last = last_position_logits(&rank3).unwrap();
        assert_eq!(last.to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);

        let rank4 = rank3.unsqueeze(0).unwrap();
        assert!(last_position_logits(&rank4).is_err());
    }

    #[test]
    fn stop_sequences_truncate_earliest() {
        let stops = vec!["###".to_string(), "END".to_string()];
        assert_eq!(
            truncate_at_stop("hello END world ###", &stops),
            Some("hello ".to_string())
        );
        assert_eq!(truncate_at_stop("no stops here", &stops), None);
        assert!(truncate_at_stop("", &stops).is_none());
    }
}
