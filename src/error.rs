// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-tap.

/// Errors that can occur while loading models, tapping activations, or
/// evaluating probes.
#[derive(Debug, thiserror::Error)]
pub enum TapError {
    /// Tensor or model error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Configuration error (bad flag combination, cache-only miss,
    /// unparsable model config).
    #[error("config error: {0}")]
    Config(String),

    /// Hook registration or activation lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Probe loading or evaluation error.
    #[error("probe error: {0}")]
    Probe(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Model file download or resolution error.
    #[error("download error: {0}")]
    Download(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-tap operations.
pub type Result<T> = std::result::Result<T, TapError>;
