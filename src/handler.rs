// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model handler: configuration, engine wiring, and request-scoped
//! generation.
//!
//! [`ModelHandler`] owns one loaded [`TextEngine`] and, when extraction
//! is enabled, an [`ActivationExtractor`] registered against the engine's
//! network module. Whether a module is available is decided once at
//! construction through the engine's explicit capability query; engines
//! that keep their internals opaque get a warning and plain generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

#[cfg(feature = "llama")]
use crate::cache::ModelCache;
use crate::engine::{SamplingOptions, TextEngine};
use crate::error::Result;
#[cfg(feature = "llama")]
use crate::error::TapError;
use crate::extractor::ActivationExtractor;
use crate::store::ActivationStore;

// ---------------------------------------------------------------------------
// ModelConfig
// ---------------------------------------------------------------------------

/// Device selection for engine loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA device 0 when available, CPU otherwise.
    #[default]
    Auto,
    /// Force the CPU.
    Cpu,
}

/// Immutable configuration for one [`ModelHandler`].
#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    /// `HuggingFace` repository id (e.g. `"meta-llama/Llama-3.2-1B"`).
    pub model_name: String,
    /// Cache-only mode: require the model to be present locally and
    /// never download.
    pub local_files_only: bool,
    /// Device preference for engine loading.
    pub device: DevicePreference,
    /// Whether to capture activations during generation.
    pub extract_activations: bool,
    /// Layer filter for extraction; `None` or empty captures all layers.
    pub extract_layers: Option<Vec<usize>>,
}

impl ModelConfig {
    /// Configuration with defaults for everything but the model name.
    #[must_use]
    pub fn new<S: Into<String>>(model_name: S) -> Self {
        Self {
            model_name: model_name.into(),
            local_files_only: false,
            device: DevicePreference::Auto,
            extract_activations: false,
            extract_layers: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ModelHandler
// ---------------------------------------------------------------------------

/// Owns one loaded engine plus the optional extraction wiring.
///
/// One `generate` call at a time; overlapping calls are not coordinated
/// at this layer.
pub struct ModelHandler {
    /// The configuration the handler was built from.
    config: ModelConfig,
    /// The loaded engine.
    engine: Box<dyn TextEngine>,
    /// Extraction facade, present only when requested.
    extractor: Option<ActivationExtractor>,
    /// Monotonic counter backing synthetic request ids.
    request_counter: AtomicU64,
}

impl ModelHandler {
    /// Load the built-in engine for `config` and wire extraction.
    ///
    /// In cache-only mode a missing model fails with [`TapError::Config`]
    /// reporting the attempted cache path and the available cached
    /// models.
    ///
    /// # Errors
    ///
    /// Propagates engine loading failures; see [`crate::LlamaEngine::load`].
    #[cfg(feature = "llama")]
    pub fn load(config: ModelConfig) -> Result<Self> {
        set_runtime_env();
        let cache = ModelCache::from_env();

        if config.local_files_only && !cache.contains(&config.model_name) {
            let available = cache.list_models();
            return Err(TapError::Config(format!(
                "model {} not found in cache (local files only)\n\
                 cache directory: {}\n\
                 available models: {}",
                config.model_name,
                cache.root().display(),
                available.join(", ")
            )));
        }
        if !cache.contains(&config.model_name) {
            info!(
                model = %config.model_name,
                cache_dir = %cache.root().display(),
                "model not in cache, downloading"
            );
        }

        let prefer_cpu = config.device == DevicePreference::Cpu;
        let engine = crate::engine::llama::LlamaEngine::load(
            &config.model_name,
            &cache,
            prefer_cpu,
        )?;
        Self::from_engine(Box::new(engine), config)
    }

    /// Wire an already-loaded engine.
    ///
    /// If extraction is enabled, queries the engine's network module
    /// once: present ⇒ hooks are registered for the configured layer
    /// filter; absent ⇒ extraction is disabled with a warning and
    /// generation proceeds without capture.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::Hook`] if hook registration fails.
    pub fn from_engine(engine: Box<dyn TextEngine>, config: ModelConfig) -> Result<Self> {
        set_runtime_env();
        let extractor = if config.extract_activations {
            let extractor = ActivationExtractor::new(config.extract_layers.clone(), true);
            match engine.network_module() {
                Some(module) => {
                    extractor.register_module(&module)?;
                    info!(
                        engine = engine.info().name,
                        layers = module.num_layers(),
                        "registered activation extraction hooks"
                    );
                }
                None => {
                    warn!(
                        engine = engine.info().name,
                        "engine does not expose its network module; \
                         activation extraction disabled"
                    );
                }
            }
            Some(extractor)
        } else {
            None
        };

        Ok(Self {
            config,
            engine,
            extractor,
            request_counter: AtomicU64::new(0),
        })
    }

    /// The configuration this handler was built from.
    #[must_use]
    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Generate a continuation for `prompt`.
    ///
    /// When extraction is active, a synthetic monotonic request id
    /// (`req-<n>`) scopes the captures; the request context is cleared
    /// whether or not the engine call succeeds.
    ///
    /// # Errors
    ///
    /// Propagates engine errors.
    pub fn generate(&mut self, prompt: &str, options: &SamplingOptions) -> Result<String> {
        let request_id = self.next_request_id();
        debug!(request_id = %request_id, "generation request");
        if let Some(extractor) = &self.extractor {
            extractor.set_request_context(std::slice::from_ref(&request_id), None);
        }

        let outcome = self.engine.generate(prompt, options);

        if let Some(extractor) = &self.extractor {
            extractor.clear_request_context();
        }
        outcome
    }

    /// The most recently issued request ids are `req-0`, `req-1`, … —
    /// unique within the process regardless of prompt contents.
    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("req-{n}")
    }

    /// The activation store, when extraction was requested.
    #[must_use]
    pub fn activation_store(&self) -> Option<Arc<dyn ActivationStore>> {
        self.extractor.as_ref().map(ActivationExtractor::store)
    }

    /// The extraction facade, when extraction was requested.
    #[must_use]
    pub fn extractor(&self) -> Option<&ActivationExtractor> {
        self.extractor.as_ref()
    }
}

impl Drop for ModelHandler {
    fn drop(&mut self) {
        // Teardown releases hooks and captured memory.
        if let Some(extractor) = &self.extractor {
            extractor.cleanup();
        }
    }
}

/// Environment knobs expected by the tokenizer stack: fork-safety
/// warnings from parallel tokenizers are irrelevant for a single-request
/// CLI, so parallelism is forced off unless the caller chose otherwise.
fn set_runtime_env() {
    if std::env::var_os("TOKENIZERS_PARALLELISM").is_none() {
        std::env::set_var("TOKENIZERS_PARALLELISM", "false");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::EngineInfo;

    /// Engine that records the prompts it saw and echoes them back.
    struct EchoEngine;

    impl TextEngine for EchoEngine {
        fn info(&self) -> EngineInfo {
            EngineInfo {
                name: "echo",
                model_id: "test/echo".to_string(),
            }
        }

        fn generate(&mut self, prompt: &str, _options: &SamplingOptions) -> Result<String> {
            Ok(format!("echo: {prompt}"))
        }
    }

    #[test]
    fn generate_without_extraction() {
        let mut handler =
            ModelHandler::from_engine(Box::new(EchoEngine), ModelConfig::new("test/echo"))
                .unwrap();
        let text = handler
            .generate("hi", &SamplingOptions::default())
            .unwrap();
        assert_eq!(text, "echo: hi");
        assert!(handler.activation_store().is_none());
    }

    #[test]
    fn opaque_engine_disables_extraction_but_generates() {
        let mut config = ModelConfig::new("test/echo");
        config.extract_activations = true;

        let mut handler = ModelHandler::from_engine(Box::new(EchoEngine), config).unwrap();
        let text = handler
            .generate("hi", &SamplingOptions::default())
            .unwrap();
        assert_eq!(text, "echo: hi");

        // The facade exists but captured nothing.
        let store = handler.activation_store().unwrap();
        assert_eq!(store.stats().num_activations, 0);
    }

    #[test]
    fn request_ids_are_monotonic() {
        let handler =
            ModelHandler::from_engine(Box::new(EchoEngine), ModelConfig::new("test/echo"))
                .unwrap();
        assert_eq!(handler.next_request_id(), "req-0");
        assert_eq!(handler.next_request_id(), "req-1");
        assert_eq!(handler.next_request_id(), "req-2");
    }
}
