// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token sampling over a logits vector.
//!
//! Implements the flat sampling surface of
//! [`SamplingOptions`](crate::SamplingOptions): repetition penalty over
//! already-generated tokens, temperature scaling, top-k and nucleus
//! (top-p) truncation, and categorical sampling. `temperature <= 0.0`
//! short-circuits to greedy (argmax) decoding.

use candle_core::{DType, Tensor};

use crate::engine::SamplingOptions;
use crate::error::{Result, TapError};

/// Sample the next token id from `logits` under `options`.
///
/// `history` holds the token ids generated so far in this request and is
/// only consulted for the repetition penalty.
///
/// # Shapes
/// - `logits`: `[vocab_size]`
///
/// # Errors
///
/// Returns [`TapError::Model`] if the logits tensor is empty or cannot be
/// converted to `f32`.
pub fn sample_token(logits: &Tensor, options: &SamplingOptions, history: &[u32]) -> Result<u32> {
    let mut logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if logits.is_empty() {
        return Err(TapError::Model(candle_core::Error::Msg(
            "empty logits".into(),
        )));
    }

    if options.repetition_penalty != 1.0 {
        apply_repetition_penalty(&mut logits, options.repetition_penalty, history);
    }

    if options.temperature <= 0.0 {
        return Ok(argmax(&logits));
    }

    for logit in &mut logits {
        *logit /= options.temperature;
    }
    if options.top_k > 0 {
        top_k_filter(&mut logits, options.top_k);
    }
    if options.top_p < 1.0 {
        top_p_filter(&mut logits, options.top_p);
    }

    Ok(sample_categorical(&logits))
}

/// Penalise tokens that already occurred: positive logits are divided by
/// the penalty, negative logits multiplied (the CTRL formulation).
fn apply_repetition_penalty(logits: &mut [f32], penalty: f32, history: &[u32]) {
    for &token in history {
        if let Some(logit) = logits.get_mut(token as usize) {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

/// Index of the largest logit.
fn argmax(logits: &[f32]) -> u32 {
    let (max_idx, _) = logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or((0, &0.0));
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    {
        max_idx as u32
    }
}

/// Mask everything outside the `k` largest logits to `-inf`.
fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    // Ties at the threshold are all kept; the support may then exceed k.
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Mask the tail of the distribution outside the nucleus of cumulative
/// probability `p`.
fn top_p_filter(logits: &mut [f32], p: f32) {
    let probs = softmax(logits);
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    let mut cutoff = logits.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= p {
            cutoff = rank + 1;
            break;
        }
    }
    for &idx in order.iter().skip(cutoff) {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Numerically stable softmax.
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = logits.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    exp_vals.iter().map(|x| x / sum).collect()
}

/// Draw one index from the categorical distribution over `logits`.
fn sample_categorical(logits: &[f32]) -> u32 {
    use rand::Rng;

    let probs = softmax(logits);
    let mut rng = rand::thread_rng();
    let r: f32 = rng.r#gen();
    let mut cumsum = 0.0f32;
    for (idx, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            return idx as u32;
        }
    }

    // Floating-point rounding edge case: fall back to the last token.
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    {
        (probs.len() - 1) as u32
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
