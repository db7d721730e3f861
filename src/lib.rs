// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-tap
//!
//! A command-line convenience layer over a large-language-model inference
//! engine: load a model, run single-prompt generation, and optionally tap
//! hidden-layer activations for downstream linear-probe scoring.
//!
//! The inference engine, the hook manager, and the activation store are
//! external collaborators reached through narrow trait contracts
//! ([`TextEngine`], [`NetworkModule`], [`HookManager`],
//! [`ActivationStore`]). The crate's own logic is limited to:
//!
//! - locating and validating the local `HuggingFace` model cache
//!   ([`ModelCache`]),
//! - translating configuration into an engine instance and wiring hook
//!   registration ([`ModelHandler`]),
//! - a request-scoped extraction facade ([`ActivationExtractor`]),
//! - linear-probe evaluation over one captured activation
//!   ([`compute_probe`], [`load_probe_from_file`]).
//!
//! ## Built-in engine
//!
//! The `llama` feature (default) provides [`LlamaEngine`], an adapter over
//! `candle-transformers`' LLaMA-family models. It does not expose its
//! network module, so activation extraction on it is disabled with a
//! warning; engines that do expose a module get hooks registered once at
//! startup via the explicit [`TextEngine::network_module`] capability
//! query.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod cache;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod handler;
pub mod hooks;
pub mod probe;
pub mod sampling;
pub mod store;

pub use cache::ModelCache;
#[cfg(feature = "llama")]
pub use engine::llama::LlamaEngine;
pub use engine::{
    EngineInfo, ForwardHook, HookHandle, NetworkModule, SamplingOptions, TextEngine,
};
pub use error::{Result, TapError};
pub use extractor::{ActivationExtractor, ExtractionScope};
pub use handler::{DevicePreference, ModelConfig, ModelHandler};
pub use hooks::{HookManager, LayerHookManager};
pub use probe::{compute_probe, load_probe_from_file};
pub use store::{ActivationStore, InMemoryActivationStore, StoreStats};
