// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request-scoped activation extraction facade.
//!
//! [`ActivationExtractor`] wraps an [`ActivationStore`] and a
//! [`HookManager`] behind one small surface: register hooks on a module,
//! set/clear the per-request capture context around a generation call,
//! read captures back out, and release everything on cleanup. A single
//! mutex serialises hook (re)registration and cleanup; it does not
//! serialise store reads, which follow the single-writer/single-reader
//! per request design.

use std::sync::{Arc, Mutex};

use crate::engine::NetworkModule;
use crate::error::Result;
use crate::hooks::{HookManager, LayerHookManager};
use crate::store::{ActivationStore, InMemoryActivationStore};

// ---------------------------------------------------------------------------
// ActivationExtractor
// ---------------------------------------------------------------------------

/// Facade over the activation store and hook manager.
///
/// # Example
///
/// ```
/// use candle_tap::ActivationExtractor;
///
/// let extractor = ActivationExtractor::new(Some(vec![0, 5]), true);
/// let scope = extractor.scope();
/// // ... register a module, run generation ...
/// drop(scope); // hooks removed, store cleared
/// ```
pub struct ActivationExtractor {
    /// When false, every operation is a no-op.
    enabled: bool,
    /// Backing store; shared with the hook manager and with probe readers.
    store: Arc<dyn ActivationStore>,
    /// Hook manager behind the registration lock.
    manager: Mutex<Box<dyn HookManager>>,
}

impl ActivationExtractor {
    /// Create an extractor over the in-memory reference store.
    ///
    /// `extract_layers` limits capture to specific layer indices; `None`
    /// or an empty list captures all layers.
    #[must_use]
    pub fn new(extract_layers: Option<Vec<usize>>, enabled: bool) -> Self {
        let store: Arc<dyn ActivationStore> = Arc::new(InMemoryActivationStore::new());
        let manager = LayerHookManager::new(Arc::clone(&store), extract_layers);
        Self {
            enabled,
            store,
            manager: Mutex::new(Box::new(manager)),
        }
    }

    /// Create an extractor over externally provided store and manager
    /// implementations.
    #[must_use]
    pub fn with_parts(store: Arc<dyn ActivationStore>, manager: Box<dyn HookManager>) -> Self {
        Self {
            enabled: true,
            store,
            manager: Mutex::new(manager),
        }
    }

    /// Whether extraction is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Register hooks on `module`, removing any previously registered
    /// hooks first. No-op when extraction is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TapError::Hook`] if hook installation fails.
    pub fn register_module(&self, module: &Arc<dyn NetworkModule>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut manager = self.manager.lock().expect("extractor lock poisoned");
        manager.register_hooks(module)
    }

    /// Set the request context for the next forward passes.
    pub fn set_request_context(&self, request_ids: &[String], token_positions: Option<&[usize]>) {
        if !self.enabled {
            return;
        }
        let manager = self.manager.lock().expect("extractor lock poisoned");
        manager.set_request_context(request_ids, token_positions);
    }

    /// Clear the request context.
    pub fn clear_request_context(&self) {
        if !self.enabled {
            return;
        }
        let manager = self.manager.lock().expect("extractor lock poisoned");
        manager.clear_request_context();
    }

    /// The backing activation store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn ActivationStore> {
        Arc::clone(&self.store)
    }

    /// Clear captures for one request, or everything when `request_id`
    /// is `None`.
    pub fn clear_activations(&self, request_id: Option<&str>) {
        match request_id {
            Some(id) => self.store.clear_request(id),
            None => self.store.clear_all(),
        }
    }

    /// Remove hooks and clear all stored activations. Idempotent.
    pub fn cleanup(&self) {
        let mut manager = self.manager.lock().expect("extractor lock poisoned");
        manager.remove_hooks();
        self.store.clear_all();
    }

    /// RAII guard running [`cleanup`](Self::cleanup) on drop, including
    /// when generation unwinds with an error.
    #[must_use]
    pub fn scope(&self) -> ExtractionScope<'_> {
        ExtractionScope { extractor: self }
    }
}

// ---------------------------------------------------------------------------
// ExtractionScope
// ---------------------------------------------------------------------------

/// Guard that releases hooks and clears captured memory when dropped.
pub struct ExtractionScope<'a> {
    /// The extractor to clean up.
    extractor: &'a ActivationExtractor,
}

impl Drop for ExtractionScope<'_> {
    fn drop(&mut self) {
        self.extractor.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{ForwardHook, HookHandle};
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TestModule {
        hooks: Mutex<HashMap<HookHandle, (usize, ForwardHook)>>,
        next_id: AtomicU64,
    }

    impl TestModule {
        fn new() -> Self {
            Self {
                hooks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }
        }

        fn run_forward(&self, seq_len: usize) {
            for (layer, hook) in self.hooks.lock().unwrap().values() {
                let output = Tensor::zeros((seq_len, 8), DType::F32, &Device::Cpu).unwrap();
                hook(*layer, &output);
            }
        }

        fn num_installed(&self) -> usize {
            self.hooks.lock().unwrap().len()
        }
    }

    impl NetworkModule for TestModule {
        fn num_layers(&self) -> usize {
            2
        }

        fn hidden_size(&self) -> usize {
            8
        }

        fn install_hook(&self, layer: usize, hook: ForwardHook) -> Result<HookHandle> {
            let handle = HookHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
            self.hooks.lock().unwrap().insert(handle, (layer, hook));
            Ok(handle)
        }

        fn remove_hook(&self, handle: HookHandle) {
            self.hooks.lock().unwrap().remove(&handle);
        }
    }

    #[test]
    fn disabled_extractor_is_inert() {
        let extractor = ActivationExtractor::new(None, false);
        let module = Arc::new(TestModule::new());
        let dyn_module: Arc<dyn NetworkModule> = module.clone();

        extractor.register_module(&dyn_module).unwrap();
        assert_eq!(module.num_installed(), 0);

        extractor.set_request_context(&["req-0".to_string()], None);
        module.run_forward(2);
        assert_eq!(extractor.store().stats().num_activations, 0);
    }

    #[test]
    fn capture_and_clear_by_request() {
        let extractor = ActivationExtractor::new(None, true);
        let module = Arc::new(TestModule::new());
        let dyn_module: Arc<dyn NetworkModule> = module.clone();
        extractor.register_module(&dyn_module).unwrap();

        extractor.set_request_context(&["req-0".to_string()], None);
        module.run_forward(3);
        extractor.clear_request_context();

        let store = extractor.store();
        assert_eq!(store.stats().num_requests, 1);
        assert_eq!(store.layers_for_request("req-0"), vec![0, 1]);

        extractor.clear_activations(Some("req-0"));
        assert_eq!(store.stats().num_requests, 0);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let extractor = ActivationExtractor::new(None, true);
        let module = Arc::new(TestModule::new());
        let dyn_module: Arc<dyn NetworkModule> = module.clone();
        extractor.register_module(&dyn_module).unwrap();

        extractor.set_request_context(&["req-0".to_string()], None);
        module.run_forward(1);

        extractor.cleanup();
        assert_eq!(module.num_installed(), 0);
        assert_eq!(extractor.store().stats().num_activations, 0);

        // Second cleanup: no error, hooks stay absent, store stays empty.
        extractor.cleanup();
        assert_eq!(module.num_installed(), 0);
        assert_eq!(extractor.store().stats().num_activations, 0);
    }

    #[test]
    fn scope_guard_cleans_up_on_drop() {
        let extractor = ActivationExtractor::new(None, true);
        let module = Arc::new(TestModule::new());
        let dyn_module: Arc<dyn NetworkModule> = module.clone();
        extractor.register_module(&dyn_module).unwrap();

        {
            let _scope = extractor.scope();
            extractor.set_request_context(&["req-0".to_string()], None);
            module.run_forward(2);
            assert!(extractor.store().stats().num_activations > 0);
        }

        assert_eq!(module.num_installed(), 0);
        assert_eq!(extractor.store().stats().num_activations, 0);
    }

    #[test]
    fn reregistration_goes_through_the_lock() {
        let extractor = ActivationExtractor::new(Some(vec![1]), true);
        let module = Arc::new(TestModule::new());
        let dyn_module: Arc<dyn NetworkModule> = module.clone();

        extractor.register_module(&dyn_module).unwrap();
        extractor.register_module(&dyn_module).unwrap();
        assert_eq!(module.num_installed(), 1);
    }
}
