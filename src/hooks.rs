// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook manager contract and per-layer reference implementation.
//!
//! A hook manager owns the forward hooks installed on a
//! [`NetworkModule`](crate::NetworkModule) and the per-request capture
//! context that tells those hooks which request the current forward pass
//! belongs to. [`HookManager`] is the minimal interface the extraction
//! facade depends on; [`LayerHookManager`] implements it by installing one
//! observer per selected layer and writing captured token vectors into an
//! [`ActivationStore`](crate::ActivationStore).

use std::sync::{Arc, Mutex};

use candle_core::Tensor;
use tracing::warn;

use crate::engine::{ForwardHook, HookHandle, NetworkModule};
use crate::error::Result;
use crate::store::ActivationStore;

// ---------------------------------------------------------------------------
// HookManager
// ---------------------------------------------------------------------------

/// Manages hook installation/removal and the active request context.
pub trait HookManager: Send {
    /// Install hooks on `module` for the configured layer filter.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TapError::Hook`] if installation fails; already
    /// installed hooks are removed first.
    fn register_hooks(&mut self, module: &Arc<dyn NetworkModule>) -> Result<()>;

    /// Remove all installed hooks. Idempotent.
    fn remove_hooks(&mut self);

    /// Set the request context for subsequent forward passes.
    ///
    /// `token_positions` limits capture to specific positions; `None`
    /// captures every position of the observed output.
    fn set_request_context(&self, request_ids: &[String], token_positions: Option<&[usize]>);

    /// Clear the request context; captures outside a context are dropped.
    fn clear_request_context(&self);
}

/// Active capture context shared with installed hook closures.
#[derive(Debug, Clone)]
struct RequestContext {
    /// Requests the in-flight forward pass belongs to. The handler runs
    /// one request at a time, so this is a single id in practice.
    request_ids: Vec<String>,
    /// Positions to capture; `None` means all.
    token_positions: Option<Vec<usize>>,
}

// ---------------------------------------------------------------------------
// LayerHookManager
// ---------------------------------------------------------------------------

/// Reference [`HookManager`] capturing per-layer, per-position vectors.
pub struct LayerHookManager {
    /// Destination for captured activations.
    store: Arc<dyn ActivationStore>,
    /// Layer filter; `None` or empty means all layers.
    extract_layers: Option<Vec<usize>>,
    /// Context shared with hook closures.
    context: Arc<Mutex<Option<RequestContext>>>,
    /// Installed hooks with the module they were installed on.
    installed: Vec<(Arc<dyn NetworkModule>, HookHandle)>,
}

impl LayerHookManager {
    /// Create a manager writing into `store` for the given layer filter.
    #[must_use]
    pub fn new(store: Arc<dyn ActivationStore>, extract_layers: Option<Vec<usize>>) -> Self {
        Self {
            store,
            extract_layers,
            context: Arc::new(Mutex::new(None)),
            installed: Vec::new(),
        }
    }

    /// Layers to hook on a module with `num_layers` layers.
    fn selected_layers(&self, num_layers: usize) -> Vec<usize> {
        match &self.extract_layers {
            Some(layers) if !layers.is_empty() => layers
                .iter()
                .copied()
                .filter(|&layer| layer < num_layers)
                .collect(),
            _ => (0..num_layers).collect(),
        }
    }

    /// Build the observer closure for the hooks this manager installs.
    fn capture_hook(&self) -> ForwardHook {
        let store = Arc::clone(&self.store);
        let context = Arc::clone(&self.context);
        Arc::new(move |layer: usize, output: &Tensor| {
            let ctx = context.lock().expect("hook context lock poisoned").clone();
            let Some(ctx) = ctx else {
                // No active request: a forward pass we were not asked to
                // observe. Drop the capture.
                return;
            };
            let Some(request_id) = ctx.request_ids.first() else {
                return;
            };
            if let Err(e) = record_positions(
                store.as_ref(),
                request_id,
                layer,
                output,
                ctx.token_positions.as_deref(),
            ) {
                warn!(layer, error = %e, "dropping activation capture");
            }
        })
    }
}

/// Slice `output` (`[seq_len, hidden]`) into per-position vectors and
/// record them under `request_id`.
fn record_positions(
    store: &dyn ActivationStore,
    request_id: &str,
    layer: usize,
    output: &Tensor,
    token_positions: Option<&[usize]>,
) -> Result<()> {
    let seq_len = output.dim(0)?;
    let positions: Vec<usize> = match token_positions {
        Some(filter) => filter.iter().copied().filter(|&p| p < seq_len).collect(),
        None => (0..seq_len).collect(),
    };
    for position in positions {
        let vector = output.narrow(0, position, 1)?.squeeze(0)?;
        store.record(request_id, layer, position, vector);
    }
    Ok(())
}

impl HookManager for LayerHookManager {
    fn register_hooks(&mut self, module: &Arc<dyn NetworkModule>) -> Result<()> {
        self.remove_hooks();
        for layer in self.selected_layers(module.num_layers()) {
            let handle = module.install_hook(layer, self.capture_hook())?;
            self.installed.push((Arc::clone(module), handle));
        }
        Ok(())
    }

    fn remove_hooks(&mut self) {
        for (module, handle) in self.installed.drain(..) {
            module.remove_hook(handle);
        }
    }

    fn set_request_context(&self, request_ids: &[String], token_positions: Option<&[usize]>) {
        let mut ctx = self.context.lock().expect("hook context lock poisoned");
        *ctx = Some(RequestContext {
            request_ids: request_ids.to_vec(),
            token_positions: token_positions.map(<[usize]>::to_vec),
        });
    }

    fn clear_request_context(&self) {
        let mut ctx = self.context.lock().expect("hook context lock poisoned");
        *ctx = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryActivationStore;
    use candle_core::{DType, Device};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Minimal hookable module: hooks fire when `run_forward` is called.
    struct TestModule {
        layers: usize,
        hidden: usize,
        hooks: Mutex<HashMap<HookHandle, (usize, ForwardHook)>>,
        next_id: AtomicU64,
    }

    impl TestModule {
        fn new(layers: usize, hidden: usize) -> Self {
            Self {
                layers,
                hidden,
                hooks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }
        }

        fn run_forward(&self, seq_len: usize) {
            let hooks = self.hooks.lock().unwrap();
            for (layer, hook) in hooks.values() {
                let output =
                    Tensor::zeros((seq_len, self.hidden), DType::F32, &Device::Cpu).unwrap();
                hook(*layer, &output);
            }
        }

        fn num_installed(&self) -> usize {
            self.hooks.lock().unwrap().len()
        }
    }

    impl NetworkModule for TestModule {
        fn num_layers(&self) -> usize {
            self.layers
        }

        fn hidden_size(&self) -> usize {
            self.hidden
        }

        fn install_hook(&self, layer: usize, hook: ForwardHook) -> Result<HookHandle> {
            if layer >= self.layers {
                return Err(crate::TapError::Hook(format!("layer {layer} out of range")));
            }
            let handle = HookHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
            self.hooks.lock().unwrap().insert(handle, (layer, hook));
            Ok(handle)
        }

        fn remove_hook(&self, handle: HookHandle) {
            self.hooks.lock().unwrap().remove(&handle);
        }
    }

    fn setup(
        layers: usize,
        filter: Option<Vec<usize>>,
    ) -> (Arc<InMemoryActivationStore>, LayerHookManager, Arc<TestModule>) {
        let store = Arc::new(InMemoryActivationStore::new());
        let manager = LayerHookManager::new(store.clone(), filter);
        let module = Arc::new(TestModule::new(layers, 16));
        (store, manager, module)
    }

    #[test]
    fn captures_all_layers_without_filter() {
        let (store, mut manager, module) = setup(3, None);
        let dyn_module: Arc<dyn NetworkModule> = module.clone();
        manager.register_hooks(&dyn_module).unwrap();
        assert_eq!(module.num_installed(), 3);

        manager.set_request_context(&["req-0".to_string()], None);
        module.run_forward(2);
        manager.clear_request_context();

        assert_eq!(store.layers_for_request("req-0"), vec![0, 1, 2]);
        assert_eq!(store.positions_for_request("req-0"), vec![0, 1]);
    }

    #[test]
    fn layer_filter_and_out_of_range_layers() {
        // Layer 9 exceeds the module and is skipped at registration.
        let (store, mut manager, module) = setup(4, Some(vec![1, 3, 9]));
        let dyn_module: Arc<dyn NetworkModule> = module.clone();
        manager.register_hooks(&dyn_module).unwrap();
        assert_eq!(module.num_installed(), 2);

        manager.set_request_context(&["req-0".to_string()], None);
        module.run_forward(1);

        assert_eq!(store.layers_for_request("req-0"), vec![1, 3]);
    }

    #[test]
    fn no_context_drops_captures() {
        let (store, mut manager, module) = setup(2, None);
        let dyn_module: Arc<dyn NetworkModule> = module.clone();
        manager.register_hooks(&dyn_module).unwrap();

        module.run_forward(2);
        assert_eq!(store.stats().num_activations, 0);

        manager.set_request_context(&["req-0".to_string()], None);
        manager.clear_request_context();
        module.run_forward(2);
        assert_eq!(store.stats().num_activations, 0);
    }

    #[test]
    fn position_filter_limits_captures() {
        let (store, mut manager, module) = setup(1, None);
        let dyn_module: Arc<dyn NetworkModule> = module.clone();
        manager.register_hooks(&dyn_module).unwrap();

        manager.set_request_context(&["req-0".to_string()], Some(&[1, 7]));
        module.run_forward(3); // position 7 is out of range and skipped

        assert_eq!(store.positions_for_request("req-0"), vec![1]);
    }

    #[test]
    fn reregistration_replaces_hooks() {
        let (_store, mut manager, module) = setup(2, None);
        let dyn_module: Arc<dyn NetworkModule> = module.clone();
        manager.register_hooks(&dyn_module).unwrap();
        manager.register_hooks(&dyn_module).unwrap();
        assert_eq!(module.num_installed(), 2);

        manager.remove_hooks();
        manager.remove_hooks();
        assert_eq!(module.num_installed(), 0);
    }
}
