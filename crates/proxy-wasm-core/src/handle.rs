//! Handles and per-process / per-thread VM caches.
//!
//! The base VM for a `vm_key` is loaded once per process and cached weakly.
//! Worker threads never run the base: each gets its own clone, cached in a
//! thread-local map, plus one started plugin per `(vm_key, plugin key)`.
//! Before a plugin is accepted, a throwaway canary clone runs it through
//! start and configure so a broken configuration never reaches a live VM.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use proxy_wasm_common::FailState;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::context::ContextBase;
use crate::handler::ContextHandler;
use crate::plugin::PluginBase;
use crate::vm::VmFactory;
use crate::wasm::WasmBase;

/// Builds an uninitialized clone of a base VM.
pub type WasmHandleCloneFactory =
    Arc<dyn Fn(&Arc<WasmHandle>) -> Option<Arc<WasmHandle>> + Send + Sync>;

/// Builds a fresh, not yet loaded base VM for a `vm_key`.
pub type WasmHandleFactory = Arc<dyn Fn(&str) -> Option<Arc<WasmHandle>> + Send + Sync>;

/// One slot per `vm_key`. The slot lock is held while a base VM loads, so
/// concurrent callers for the same key wait for it instead of loading twice.
type BaseSlot = Arc<Mutex<Weak<WasmHandle>>>;

static BASE_WASMS: LazyLock<DashMap<String, BaseSlot>> = LazyLock::new(DashMap::new);

thread_local! {
    static LOCAL_WASMS: RefCell<HashMap<String, Weak<WasmHandle>>> = RefCell::new(HashMap::new());
    static LOCAL_PLUGINS: RefCell<HashMap<String, Weak<PluginHandle>>> = RefCell::new(HashMap::new());
}

/// Owns a VM. Dropping the last handle shuts down its root contexts.
pub struct WasmHandle {
    wasm: Arc<WasmBase>,
    killed: AtomicBool,
    canary_results: Mutex<HashMap<String, bool>>,
}

impl WasmHandle {
    pub fn new(wasm: Arc<WasmBase>) -> Arc<Self> {
        Arc::new(Self {
            wasm,
            killed: AtomicBool::new(false),
            canary_results: Mutex::new(HashMap::new()),
        })
    }

    pub fn wasm(&self) -> &Arc<WasmBase> {
        &self.wasm
    }

    /// Drop without running shutdown hooks.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// A clone factory that clones through the engine, or creates a fresh VM
    /// from `factory` when the engine cannot clone.
    pub fn clone_factory(factory: VmFactory) -> WasmHandleCloneFactory {
        Arc::new(move |base: &Arc<WasmHandle>| {
            Some(WasmHandle::new(WasmBase::clone_from_base(base, &factory)))
        })
    }

    /// Run `plugin` through start and configure on a throwaway clone.
    ///
    /// The result is remembered per plugin key.
    pub fn canary(self: &Arc<Self>, plugin: &Arc<PluginBase>, clone_factory: &WasmHandleCloneFactory) -> bool {
        if let Some(&passed) = self.canary_results.lock().get(plugin.key()) {
            return passed;
        }
        let passed = self.run_canary(plugin, clone_factory);
        self.canary_results
            .lock()
            .insert(plugin.key().to_string(), passed);
        passed
    }

    fn run_canary(self: &Arc<Self>, plugin: &Arc<PluginBase>, clone_factory: &WasmHandleCloneFactory) -> bool {
        let Some(canary) = clone_factory(self) else {
            self.wasm.fail(FailState::UnableToCloneVm, "failed to clone base VM");
            return false;
        };
        if !canary.wasm.initialize() {
            self.wasm.fail(FailState::UnableToInitializeCode, "failed to initialize module");
            return false;
        }
        let Some(root) = canary.wasm.start(plugin) else {
            canary.wasm.fail(FailState::StartFailed, "failed to start plugin");
            warn!(plugin = plugin.log_prefix(), "canary rejected plugin: start failed");
            return false;
        };
        if !canary.wasm.configure(&root, plugin) {
            canary.wasm.fail(FailState::ConfigureFailed, "failed to configure plugin");
            warn!(plugin = plugin.log_prefix(), "canary rejected plugin: configure failed");
            return false;
        }
        canary.kill();
        debug!(plugin = plugin.log_prefix(), "canary passed");
        true
    }
}

impl Drop for WasmHandle {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::Acquire) {
            self.wasm.start_shutdown(None);
        }
    }
}

impl fmt::Debug for WasmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmHandle")
            .field("wasm", &self.wasm)
            .field("killed", &self.killed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A started plugin in a VM. Dropping it shuts down the plugin's root
/// context.
pub struct PluginHandle {
    wasm_handle: Arc<WasmHandle>,
    plugin: Arc<PluginBase>,
}

impl PluginHandle {
    pub fn new(wasm_handle: Arc<WasmHandle>, plugin: Arc<PluginBase>) -> Arc<Self> {
        Arc::new(Self { wasm_handle, plugin })
    }

    pub fn wasm_handle(&self) -> &Arc<WasmHandle> {
        &self.wasm_handle
    }

    pub fn wasm(&self) -> &Arc<WasmBase> {
        self.wasm_handle.wasm()
    }

    pub fn plugin(&self) -> &Arc<PluginBase> {
        &self.plugin
    }

    /// The plugin's root context in this VM.
    pub fn root_context(&self) -> Option<Arc<ContextBase>> {
        self.wasm().get_root_context(self.plugin.key())
    }

    /// Create a stream context that keeps this plugin alive.
    pub fn create_stream_context(self: &Arc<Self>, handler: Arc<dyn ContextHandler>) -> Option<Arc<ContextBase>> {
        self.wasm()
            .create_stream_context_with(&self.plugin, Some(Arc::clone(self)), handler)
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        self.wasm_handle.wasm().start_shutdown(Some(self.plugin.key()));
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

/// Cache key of a VM: hex SHA-256 of id, configuration and code.
pub fn make_vm_key(vm_id: &str, vm_configuration: &str, code: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vm_id.as_bytes());
    hasher.update(b"||");
    hasher.update(vm_configuration.as_bytes());
    hasher.update(b"||");
    hasher.update(code);
    hex::encode(hasher.finalize())
}

/// Get the cached base VM for `vm_key` or load a new one, then canary
/// `plugin` against it.
pub fn create_wasm(
    vm_key: &str,
    code: &[u8],
    plugin: &Arc<PluginBase>,
    factory: &WasmHandleFactory,
    clone_factory: &WasmHandleCloneFactory,
    allow_precompiled: bool,
) -> Option<Arc<WasmHandle>> {
    let slot = Arc::clone(BASE_WASMS.entry(vm_key.to_string()).or_default().value());
    let handle = {
        let mut cached = slot.lock();
        match cached.upgrade() {
            Some(handle) => handle,
            None => {
                let handle = factory(vm_key)?;
                if !handle.wasm.load(code, allow_precompiled) {
                    handle.wasm.fail(FailState::UnableToInitializeCode, "failed to load module");
                    return None;
                }
                if !handle.wasm.initialize() {
                    handle.wasm.fail(FailState::UnableToInitializeCode, "failed to initialize module");
                    return None;
                }
                *cached = Arc::downgrade(&handle);
                info!(vm_id = %handle.wasm.vm_id(), vm_key, "base VM loaded");
                handle
            }
        }
    };
    handle.canary(plugin, clone_factory).then_some(handle)
}

/// The base VM cached for `vm_key`, if still alive.
pub fn get_base_wasm(vm_key: &str) -> Option<Arc<WasmHandle>> {
    let slot = BASE_WASMS.get(vm_key).map(|entry| Arc::clone(entry.value()))?;
    slot.lock().upgrade()
}

/// This thread's clone for `vm_key`, if one is cached and alive.
pub fn get_thread_local_wasm(vm_key: &str) -> Option<Arc<WasmHandle>> {
    LOCAL_WASMS.with(|wasms| wasms.borrow().get(vm_key).and_then(Weak::upgrade))
}

/// This thread's clone of `base`, creating and initializing it on first use.
///
/// The clone evicts itself from the cache when it fails at runtime.
pub fn get_or_create_thread_local_wasm(
    base: &Arc<WasmHandle>,
    clone_factory: &WasmHandleCloneFactory,
) -> Option<Arc<WasmHandle>> {
    let vm_key = base.wasm.vm_key().to_string();
    if let Some(handle) = get_thread_local_wasm(&vm_key) {
        return Some(handle);
    }
    let Some(handle) = clone_factory(base) else {
        base.wasm.fail(FailState::UnableToCloneVm, "failed to clone base VM");
        return None;
    };
    if !handle.wasm.initialize() {
        base.wasm.fail(FailState::UnableToInitializeCode, "failed to initialize module");
        return None;
    }
    LOCAL_WASMS.with(|wasms| {
        wasms
            .borrow_mut()
            .insert(vm_key.clone(), Arc::downgrade(&handle))
    });
    handle.wasm.add_fail_callback(Arc::new(move |state| {
        if state == FailState::RuntimeError {
            evict(&LOCAL_WASMS, &vm_key);
        }
    }));
    Some(handle)
}

/// This thread's started plugin for `plugin` on a clone of `base`.
pub fn get_or_create_thread_local_plugin(
    base: &Arc<WasmHandle>,
    plugin: &Arc<PluginBase>,
    clone_factory: &WasmHandleCloneFactory,
) -> Option<Arc<PluginHandle>> {
    let key = format!("{}||{}", base.wasm.vm_key(), plugin.key());
    let cached = LOCAL_PLUGINS.with(|plugins| plugins.borrow().get(&key).and_then(Weak::upgrade));
    if let Some(handle) = cached {
        return Some(handle);
    }

    let wasm_handle = get_or_create_thread_local_wasm(base, clone_factory)?;
    let Some(root) = wasm_handle.wasm.start(plugin) else {
        base.wasm.fail(FailState::StartFailed, "failed to start thread-local plugin");
        return None;
    };
    if !wasm_handle.wasm.configure(&root, plugin) {
        base.wasm.fail(FailState::ConfigureFailed, "failed to configure thread-local plugin");
        return None;
    }

    let handle = PluginHandle::new(Arc::clone(&wasm_handle), Arc::clone(plugin));
    LOCAL_PLUGINS.with(|plugins| plugins.borrow_mut().insert(key.clone(), Arc::downgrade(&handle)));
    wasm_handle.wasm.add_fail_callback(Arc::new(move |state| {
        if state == FailState::RuntimeError {
            evict(&LOCAL_PLUGINS, &key);
        }
    }));
    Some(handle)
}

fn evict<T>(cache: &'static std::thread::LocalKey<RefCell<HashMap<String, Weak<T>>>>, key: &str) {
    // Fail callbacks may fire on another thread; only this thread's map is touched.
    let _ = cache.try_with(|entries| {
        if let Ok(mut entries) = entries.try_borrow_mut() {
            if entries.remove(key).is_some() {
                debug!(key, "evicted failed VM from thread-local cache");
            }
        }
    });
}

/// Forget every cached VM and plugin (process-wide and on this thread).
pub fn clear_wasm_caches_for_testing() {
    BASE_WASMS.clear();
    LOCAL_WASMS.with(|wasms| wasms.borrow_mut().clear());
    LOCAL_PLUGINS.with(|plugins| plugins.borrow_mut().clear());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_key_is_stable() {
        let a = make_vm_key("vm", "config", b"code");
        let b = make_vm_key("vm", "config", b"code");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_vm_key_separates_fields() {
        assert_ne!(
            make_vm_key("vm", "config", b"code"),
            make_vm_key("vm", "config", b"other")
        );
        assert_ne!(make_vm_key("a", "", b""), make_vm_key("", "a", b""));
    }

    #[test]
    fn test_missing_thread_local_wasm() {
        assert!(get_thread_local_wasm("never-loaded").is_none());
    }
}
