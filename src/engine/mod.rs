// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine and network-module contracts.
//!
//! [`TextEngine`] is the seam between this crate and the inference engine
//! that actually owns model loading, batching, and the forward pass. Each
//! supported engine is a distinct adapter implementing the trait; whether
//! an adapter can expose its underlying network for hook registration is
//! an explicit capability query ([`TextEngine::network_module`]) answered
//! once at startup — not probed ad hoc per call.

#[cfg(feature = "llama")]
pub mod llama;

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::Result;

// ---------------------------------------------------------------------------
// SamplingOptions
// ---------------------------------------------------------------------------

/// Flat sampling configuration merged into a single generation request.
///
/// Defaults match a plain, unconstrained request: temperature 1.0, no
/// nucleus/top-k truncation, no repetition penalty, 100 new tokens.
#[derive(Debug, Clone)]
pub struct SamplingOptions {
    /// Softmax temperature; `<= 0.0` means greedy (argmax) decoding.
    pub temperature: f32,
    /// Nucleus sampling threshold; `1.0` disables it.
    pub top_p: f32,
    /// Top-k truncation; `0` disables it.
    pub top_k: usize,
    /// Repetition penalty over already-generated tokens; `1.0` disables it.
    pub repetition_penalty: f32,
    /// Maximum number of new tokens to generate.
    pub max_tokens: usize,
    /// Stop sequences; generation ends before the first occurrence.
    pub stop: Option<Vec<String>>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            max_tokens: 100,
            stop: None,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineInfo
// ---------------------------------------------------------------------------

/// Identity of an engine adapter, used in logs and error reports.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    /// Adapter name (e.g. `"candle-llama"`).
    pub name: &'static str,
    /// The model id the adapter loaded.
    pub model_id: String,
}

// ---------------------------------------------------------------------------
// TextEngine
// ---------------------------------------------------------------------------

/// A loaded inference engine able to run single-prompt generation.
///
/// Calls are blocking and single-request; the engine is not required to
/// support overlapping calls, and [`crate::ModelHandler`] never issues
/// them.
pub trait TextEngine: Send {
    /// Adapter identity for logging.
    fn info(&self) -> EngineInfo;

    /// Generate a continuation for `prompt` under `options`.
    ///
    /// Returns only the generated continuation, not the prompt.
    ///
    /// # Errors
    ///
    /// Returns an engine-specific error if tokenization or the forward
    /// pass fails.
    fn generate(&mut self, prompt: &str, options: &SamplingOptions) -> Result<String>;

    /// Expose the underlying network module for hook registration.
    ///
    /// Engines that keep their internals opaque return `None`; activation
    /// extraction is then disabled with a warning while generation
    /// proceeds normally.
    fn network_module(&self) -> Option<Arc<dyn NetworkModule>> {
        None
    }
}

// ---------------------------------------------------------------------------
// NetworkModule
// ---------------------------------------------------------------------------

/// Callback observing one layer's output hidden states during a forward
/// pass, without altering control flow.
///
/// Arguments are the layer index and that layer's output, shape
/// `[seq_len, hidden_size]`. Hooks must not panic; capture failures are
/// logged and dropped.
pub type ForwardHook = Arc<dyn Fn(usize, &Tensor) + Send + Sync>;

/// Identifier for an installed hook, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(pub(crate) u64);

impl HookHandle {
    /// Mint a handle from a module-chosen id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// The hookable network inside an engine.
///
/// This is the narrow "expose underlying module" contract an engine
/// adapter satisfies when it supports activation capture.
pub trait NetworkModule: Send + Sync {
    /// Number of hookable layers.
    fn num_layers(&self) -> usize;

    /// Hidden dimension of the layer outputs.
    fn hidden_size(&self) -> usize;

    /// Install a forward hook on `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TapError::Hook`] if `layer` is out of range.
    fn install_hook(&self, layer: usize, hook: ForwardHook) -> Result<HookHandle>;

    /// Remove a previously installed hook. Unknown handles are ignored.
    fn remove_hook(&self, handle: HookHandle);
}
