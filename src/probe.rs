// SPDX-License-Identifier: MIT OR Apache-2.0

//! Linear-probe evaluation over captured activations.
//!
//! A probe is a weight vector (single-output) or matrix (multi-class)
//! plus an optional bias, stored in a safetensors checkpoint. Evaluation
//! is a dot product or matrix–vector product against one activation
//! vector; no shape validation happens beyond what the tensor ops
//! enforce.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::error::{Result, TapError};

/// Compute a probe output for one activation vector.
///
/// Rank-1 `weights` produce a scalar dot product; higher-rank weights are
/// applied as `weights · activation`, one score per row. `bias` is
/// broadcast-added when present.
///
/// # Shapes
/// - `activation`: `[d]`
/// - `weights`: `[d]` (single-output) or `[r, d]` (multi-class)
/// - returns: scalar tensor, or `[r]`
///
/// # Errors
///
/// Returns [`TapError::Model`] on dimension mismatch (surfaced by the
/// underlying tensor operation).
pub fn compute_probe(
    activation: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
) -> Result<Tensor> {
    let output = if weights.rank() == 1 {
        (activation * weights)?.sum_all()?
    } else {
        weights.matmul(&activation.unsqueeze(1)?)?.squeeze(1)?
    };
    match bias {
        Some(bias) => Ok(output.broadcast_add(bias)?),
        None => Ok(output),
    }
}

/// Load probe weights and optional bias from a safetensors checkpoint.
///
/// Weights are read from the `"weight"` entry, falling back to
/// `"weights"`; the bias from `"bias"`. A checkpoint with neither
/// weights key is rejected, whatever else it contains.
///
/// # Errors
///
/// Returns [`TapError::Probe`] if no weights can be found, and
/// [`TapError::Model`] if the file cannot be read as safetensors.
pub fn load_probe_from_file<P: AsRef<Path>>(path: P) -> Result<(Tensor, Option<Tensor>)> {
    let path = path.as_ref();
    let mut tensors: HashMap<String, Tensor> = candle_core::safetensors::load(path, &Device::Cpu)?;

    let weights = tensors
        .remove("weight")
        .or_else(|| tensors.remove("weights"));
    match weights {
        Some(weights) => Ok((weights, tensors.remove("bias"))),
        None => Err(TapError::Probe(format!(
            "could not find weights in probe file: {}",
            path.display()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
