// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation store contract and in-memory reference implementation.
//!
//! The store is an external collaborator in the overall design: hook
//! callbacks write into it during a forward pass, and probe evaluation
//! reads single vectors back out. [`ActivationStore`] is the minimal
//! interface this crate depends on; [`InMemoryActivationStore`] satisfies
//! it with mutex-guarded maps so the extraction and probe paths are fully
//! exercisable without any particular engine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use candle_core::Tensor;

// ---------------------------------------------------------------------------
// StoreStats
// ---------------------------------------------------------------------------

/// Summary of a store's contents, keyed for human-readable reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    /// Number of requests with at least one stored activation.
    pub num_requests: usize,
    /// Total number of stored (layer, position) activations.
    pub num_activations: usize,
    /// Request ids currently present, sorted.
    pub requests: Vec<String>,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} activation(s) across {} request(s)",
            self.num_activations, self.num_requests
        )
    }
}

// ---------------------------------------------------------------------------
// ActivationStore
// ---------------------------------------------------------------------------

/// Storage for captured activations keyed by
/// (request id, layer index, token position).
///
/// Single-writer/single-reader per request: the store guards its own
/// interior, but callers do not interleave writes and reads for the same
/// request (the handler runs one generation at a time).
pub trait ActivationStore: Send + Sync {
    /// Store one activation vector (shape `[hidden_size]`).
    fn record(&self, request_id: &str, layer: usize, position: usize, activation: Tensor);

    /// Retrieve one activation, or `None` if nothing was captured at that
    /// (layer, position).
    fn activation(&self, request_id: &str, layer: usize, position: usize) -> Option<Tensor>;

    /// Layers captured for a request, sorted ascending.
    fn layers_for_request(&self, request_id: &str) -> Vec<usize>;

    /// Token positions captured for a request, sorted ascending.
    fn positions_for_request(&self, request_id: &str) -> Vec<usize>;

    /// Summary statistics over all requests.
    fn stats(&self) -> StoreStats;

    /// Drop all activations for one request.
    fn clear_request(&self, request_id: &str);

    /// Drop everything.
    fn clear_all(&self);
}

// ---------------------------------------------------------------------------
// InMemoryActivationStore
// ---------------------------------------------------------------------------

/// Reference [`ActivationStore`] backed by in-process maps.
///
/// No eviction and no persistence — captures live until cleared by the
/// caller or by extractor cleanup.
#[derive(Debug, Default)]
pub struct InMemoryActivationStore {
    /// request id → (layer, position) → activation.
    requests: Mutex<BTreeMap<String, BTreeMap<(usize, usize), Tensor>>>,
}

impl InMemoryActivationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivationStore for InMemoryActivationStore {
    fn record(&self, request_id: &str, layer: usize, position: usize, activation: Tensor) {
        let mut requests = self.requests.lock().expect("store lock poisoned");
        requests
            .entry(request_id.to_string())
            .or_default()
            .insert((layer, position), activation);
    }

    fn activation(&self, request_id: &str, layer: usize, position: usize) -> Option<Tensor> {
        let requests = self.requests.lock().expect("store lock poisoned");
        requests
            .get(request_id)
            .and_then(|r| r.get(&(layer, position)))
            .cloned()
    }

    fn layers_for_request(&self, request_id: &str) -> Vec<usize> {
        let requests = self.requests.lock().expect("store lock poisoned");
        let mut layers: Vec<usize> = requests
            .get(request_id)
            .map(|r| r.keys().map(|&(layer, _)| layer).collect())
            .unwrap_or_default();
        layers.sort_unstable();
        layers.dedup();
        layers
    }

    fn positions_for_request(&self, request_id: &str) -> Vec<usize> {
        let requests = self.requests.lock().expect("store lock poisoned");
        let mut positions: Vec<usize> = requests
            .get(request_id)
            .map(|r| r.keys().map(|&(_, position)| position).collect())
            .unwrap_or_default();
        positions.sort_unstable();
        positions.dedup();
        positions
    }

    fn stats(&self) -> StoreStats {
        let requests = self.requests.lock().expect("store lock poisoned");
        StoreStats {
            num_requests: requests.len(),
            num_activations: requests.values().map(BTreeMap::len).sum(),
            requests: requests.keys().cloned().collect(),
        }
    }

    fn clear_request(&self, request_id: &str) {
        let mut requests = self.requests.lock().expect("store lock poisoned");
        requests.remove(request_id);
    }

    fn clear_all(&self) {
        let mut requests = self.requests.lock().expect("store lock poisoned");
        requests.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
