//! One loaded guest module and the contexts living in it.
//!
//! [`WasmBase`] owns a [`WasmVm`], resolves the guest's exports, registers
//! host callbacks, and keeps the context table. It executes guest code
//! synchronously: one top-level call at a time, with effects requested
//! during a call (root deletion, route cache clears, queue delivery) queued
//! until that call returns.
//!
//! ```text
//!   builder ──build──▶ load(code) ──▶ initialize() ──▶ start(plugin) ──▶ configure
//!                                                            │
//!                                  create_stream_context ◀───┘
//!                                            │
//!                          on_request_headers ... on_done / on_delete
//!                                            │
//!                                   start_shutdown(key?)
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use proxy_wasm_common::{AbiVersion, FailState, VmError, WasmResult};
use tracing::{debug, error, info, trace, warn};

use crate::bytecode;
use crate::capabilities::Capabilities;
use crate::context::{ContextBase, ContextKind};
use crate::current;
use crate::exports::GuestExports;
use crate::handle::{PluginHandle, WasmHandle};
use crate::handler::{ContextHandler, DefaultContextHandler};
use crate::plugin::PluginBase;
use crate::shared_queue::{CallOnThread, call_inline};
use crate::signature::verify_signature;
use crate::vm::{Cloneable, Guest, GuestFunction, HostCallback, HostFunction, VmFactory, WasmVm};
use crate::vm_id::{VmIdHandle, get_vm_id_handle};
use crate::word::Word;

/// Creates the handler of each new root context.
pub type RootHandlerFactory = Arc<dyn Fn(&Arc<PluginBase>) -> Arc<dyn ContextHandler> + Send + Sync>;

/// Notified with the new state every time the VM fails.
pub type FailCallback = Arc<dyn Fn(FailState) + Send + Sync>;

/// Work deferred until the outermost guest call returns.
pub type AfterVmCallAction = Box<dyn FnOnce() + Send>;

/// Imports a guest may use while its bootstrap code runs, keyed by
/// `module.name`.
const BOOTSTRAP_CALLBACKS: &[&str] = &[
    "env.proxy_log",
    "env.proxy_get_current_time_nanoseconds",
    "wasi_snapshot_preview1.fd_write",
    "wasi_snapshot_preview1.clock_time_get",
    "wasi_unstable.fd_write",
    "wasi_unstable.clock_time_get",
];

fn is_bootstrap_callback(module: &str, name: &str) -> bool {
    BOOTSTRAP_CALLBACKS.iter().any(|allowed| {
        allowed
            .split_once('.')
            .is_some_and(|(m, n)| m == module && n == name)
    })
}

/// Settings shared between a VM and its clones.
#[derive(Clone)]
struct Settings {
    vm_id: String,
    vm_key: String,
    vm_configuration: String,
    envs: Vec<(String, String)>,
    capabilities: Capabilities,
    host_callbacks: &'static [HostCallback],
    root_handler: RootHandlerFactory,
    vm_handler: Arc<dyn ContextHandler>,
    call_on_thread: CallOnThread,
    signing_key: Option<[u8; 32]>,
}

#[derive(Default)]
pub(crate) struct WasmState {
    abi_version: Option<AbiVersion>,
    bytecode: Vec<u8>,
    precompiled: Vec<u8>,
    function_names: HashMap<u32, String>,
    next_context_id: u32,
    contexts: HashMap<u32, Weak<ContextBase>>,
    vm_context: Option<Arc<ContextBase>>,
    root_contexts: HashMap<String, Arc<ContextBase>>,
    pending_done: HashMap<String, Arc<ContextBase>>,
    pending_delete: Vec<Arc<ContextBase>>,
}

impl WasmState {
    /// Next free id. Ids of live contexts are skipped after wraparound.
    pub(crate) fn alloc_context_id(&mut self) -> u32 {
        loop {
            let id = self.next_context_id;
            self.next_context_id = self.next_context_id.wrapping_add(1);
            if id == 0 {
                continue;
            }
            match self.contexts.get(&id) {
                Some(context) if context.strong_count() > 0 => continue,
                _ => return id,
            }
        }
    }
}

/// Builder for a base [`WasmBase`].
pub struct WasmBaseBuilder {
    settings: Settings,
}

impl WasmBaseBuilder {
    /// Key identifying this VM in the handle caches. Defaults to the vm id.
    #[must_use]
    pub fn vm_key(mut self, vm_key: impl Into<String>) -> Self {
        self.settings.vm_key = vm_key.into();
        self
    }

    /// Configuration returned to `proxy_on_vm_start`.
    #[must_use]
    pub fn vm_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.settings.vm_configuration = configuration.into();
        self
    }

    /// Environment exposed through WASI `environ_get`.
    #[must_use]
    pub fn environment<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.settings.envs = envs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.settings.capabilities = capabilities;
        self
    }

    /// Table of host functions registered on every instance.
    #[must_use]
    pub fn host_callbacks(mut self, callbacks: &'static [HostCallback]) -> Self {
        self.settings.host_callbacks = callbacks;
        self
    }

    #[must_use]
    pub fn root_handler(mut self, factory: RootHandlerFactory) -> Self {
        self.settings.root_handler = factory;
        self
    }

    /// Handler of the VM context (id 0).
    #[must_use]
    pub fn vm_handler(mut self, handler: Arc<dyn ContextHandler>) -> Self {
        self.settings.vm_handler = handler;
        self
    }

    /// How shared queue notifications reach this VM's thread.
    #[must_use]
    pub fn call_on_thread(mut self, call_on_thread: CallOnThread) -> Self {
        self.settings.call_on_thread = call_on_thread;
        self
    }

    /// Require modules to be signed by this ed25519 public key.
    #[must_use]
    pub fn signing_key(mut self, key: [u8; 32]) -> Self {
        self.settings.signing_key = Some(key);
        self
    }

    /// Build a base VM around `vm`. A missing VM leaves it failed.
    pub fn build(self, vm: Option<Box<dyn WasmVm>>) -> Arc<WasmBase> {
        WasmBase::create(self.settings, vm, None)
    }
}

pub struct WasmBase {
    settings: Settings,
    engine: &'static str,
    vm: Mutex<Option<Box<dyn WasmVm>>>,
    /// Set on clones: how the VM was replicated from the base.
    started_from: Option<Cloneable>,
    base: Option<Arc<WasmHandle>>,
    self_ref: Weak<WasmBase>,
    _vm_id_handle: Arc<VmIdHandle>,
    state: Mutex<WasmState>,
    exports: RwLock<Arc<GuestExports>>,
    fail_state: Mutex<FailState>,
    fail_callbacks: Mutex<Vec<FailCallback>>,
    after_vm_call: Mutex<VecDeque<AfterVmCallAction>>,
    in_vm_call: AtomicBool,
    stop_iteration: AtomicBool,
    restricted: AtomicBool,
}

impl WasmBase {
    /// Start building a base VM for `vm_id`.
    pub fn builder(vm_id: impl Into<String>) -> WasmBaseBuilder {
        let vm_id = vm_id.into();
        WasmBaseBuilder {
            settings: Settings {
                vm_key: vm_id.clone(),
                vm_id,
                vm_configuration: String::new(),
                envs: Vec::new(),
                capabilities: Capabilities::All,
                host_callbacks: &[],
                root_handler: Arc::new(|_: &Arc<PluginBase>| {
                    Arc::new(DefaultContextHandler) as Arc<dyn ContextHandler>
                }),
                vm_handler: Arc::new(DefaultContextHandler),
                call_on_thread: call_inline(),
                signing_key: None,
            },
        }
    }

    /// Build a clone of the VM behind `base`.
    ///
    /// Cloneable engines share compiled code with the base; others get a
    /// fresh VM from `factory` and reload the base's bytecode in
    /// [`WasmBase::initialize`].
    pub fn clone_from_base(base: &Arc<WasmHandle>, factory: &VmFactory) -> Arc<WasmBase> {
        let base_wasm = base.wasm();
        let cloneable = base_wasm.cloneable();
        let vm = match cloneable {
            Cloneable::NotCloneable => factory(),
            _ => base_wasm.vm.lock().as_ref().and_then(|vm| vm.clone_vm()),
        };
        Self::create(
            base_wasm.settings.clone(),
            vm,
            Some((Arc::clone(base), cloneable)),
        )
    }

    fn create(
        settings: Settings,
        vm: Option<Box<dyn WasmVm>>,
        base: Option<(Arc<WasmHandle>, Cloneable)>,
    ) -> Arc<WasmBase> {
        let engine = vm.as_ref().map_or("none", |vm| vm.engine());
        let (base, started_from) = match base {
            Some((base, cloneable)) => (Some(base), Some(cloneable)),
            None => (None, None),
        };
        let missing_vm = vm.is_none();
        let vm_id_handle = get_vm_id_handle(&settings.vm_id);
        let wasm = Arc::new_cyclic(|self_ref| WasmBase {
            settings,
            engine,
            vm: Mutex::new(vm),
            started_from,
            base,
            self_ref: Weak::clone(self_ref),
            _vm_id_handle: vm_id_handle,
            state: Mutex::new(WasmState {
                next_context_id: 1,
                ..WasmState::default()
            }),
            exports: RwLock::new(Arc::new(GuestExports::default())),
            fail_state: Mutex::new(FailState::Ok),
            fail_callbacks: Mutex::new(Vec::new()),
            after_vm_call: Mutex::new(VecDeque::new()),
            in_vm_call: AtomicBool::new(false),
            stop_iteration: AtomicBool::new(false),
            restricted: AtomicBool::new(false),
        });
        if missing_vm {
            match started_from {
                Some(Cloneable::CompiledBytecode | Cloneable::InstantiatedModule) => {
                    wasm.fail(FailState::UnableToCloneVm, "failed to clone VM");
                }
                _ => wasm.fail(FailState::UnableToCreateVm, "failed to create VM"),
            }
        }
        wasm
    }

    pub fn vm_id(&self) -> &str {
        &self.settings.vm_id
    }

    pub fn vm_key(&self) -> &str {
        &self.settings.vm_key
    }

    pub fn vm_configuration(&self) -> &str {
        &self.settings.vm_configuration
    }

    /// Environment exposed to the guest through WASI.
    pub fn envs(&self) -> &[(String, String)] {
        &self.settings.envs
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.settings.capabilities
    }

    pub fn call_on_thread(&self) -> &CallOnThread {
        &self.settings.call_on_thread
    }

    /// Engine name of the underlying VM, `"none"` when there is none.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// `None` for base VMs.
    pub fn started_from(&self) -> Option<Cloneable> {
        self.started_from
    }

    fn cloneable(&self) -> Cloneable {
        self.vm
            .lock()
            .as_ref()
            .map_or(Cloneable::NotCloneable, |vm| vm.cloneable())
    }

    /// ABI version detected at load time, `Unknown` before that.
    pub fn abi_version(&self) -> AbiVersion {
        self.state.lock().abi_version.unwrap_or(AbiVersion::Unknown)
    }

    /// Snapshot of the resolved guest exports.
    pub fn exports(&self) -> Arc<GuestExports> {
        Arc::clone(&self.exports.read())
    }

    // ---- failure ----

    pub fn fail_state(&self) -> FailState {
        *self.fail_state.lock()
    }

    pub fn is_failed(&self) -> bool {
        self.fail_state().is_failed()
    }

    /// Record a failure. The first failure sticks; callbacks see every one.
    pub fn fail(&self, state: FailState, message: &str) {
        error!(vm_id = %self.settings.vm_id, ?state, "{message}");
        {
            let mut current = self.fail_state.lock();
            if !current.is_failed() {
                *current = state;
            }
        }
        let callbacks = self.fail_callbacks.lock().clone();
        for callback in callbacks {
            callback(state);
        }
    }

    pub fn add_fail_callback(&self, callback: FailCallback) {
        self.fail_callbacks.lock().push(callback);
    }

    // ---- loading ----

    /// Validate and compile `code`.
    pub fn load(&self, code: &[u8], allow_precompiled: bool) -> bool {
        if self.is_failed() {
            return false;
        }
        match self.try_load(code, allow_precompiled) {
            Ok(()) => true,
            Err(message) => {
                self.fail(FailState::UnableToInitializeCode, &message);
                false
            }
        }
    }

    fn try_load(&self, code: &[u8], allow_precompiled: bool) -> Result<(), String> {
        bytecode::check_wasm_header(code).map_err(|e| format!("invalid module: {e}"))?;

        match &self.settings.signing_key {
            Some(key) => {
                verify_signature(code, key).map_err(|e| e.to_string())?;
                debug!(vm_id = %self.settings.vm_id, "module signature verified");
            }
            None => trace!(vm_id = %self.settings.vm_id, "no signing key configured, skipping signature check"),
        }

        let abi_version = bytecode::get_abi_version(code)
            .map_err(|e| format!("failed to parse corrupted module: {e}"))?;
        if abi_version == AbiVersion::Unknown {
            return Err("missing or unknown Proxy-Wasm ABI version".to_string());
        }
        let function_names = bytecode::get_function_name_index(code)
            .map_err(|e| format!("failed to parse corrupted module: {e}"))?;

        let mut vm = self.vm.lock();
        let vm = vm.as_mut().ok_or("no VM")?;
        let precompiled = if allow_precompiled {
            let section = vm.precompiled_section_name();
            bytecode::get_custom_section(code, &section)
                .map_err(|e| format!("failed to parse corrupted module: {e}"))?
                .unwrap_or_default()
        } else {
            &[]
        };
        let stripped = bytecode::get_stripped_source(code)
            .map_err(|e| format!("failed to parse corrupted module: {e}"))?;

        if !vm.load(stripped, precompiled, &function_names) {
            return Err("failed to load Wasm bytecode".to_string());
        }
        info!(
            vm_id = %self.settings.vm_id,
            abi = %abi_version,
            bytes = code.len(),
            precompiled = !precompiled.is_empty(),
            "module loaded"
        );

        let mut state = self.state.lock();
        state.abi_version = Some(abi_version);
        if vm.cloneable() == Cloneable::NotCloneable {
            state.bytecode = stripped.to_vec();
            state.precompiled = precompiled.to_vec();
        }
        state.function_names = function_names;
        Ok(())
    }

    /// Link, resolve exports and run the guest's bootstrap code.
    pub fn initialize(self: &Arc<Self>) -> bool {
        if self.is_failed() {
            return false;
        }
        match self.link_and_resolve() {
            Ok(exports) => *self.exports.write() = Arc::new(exports),
            Err((state, message)) => {
                self.fail(state, &message);
                return false;
            }
        }

        let vm_context = Arc::new(ContextBase::new(
            Weak::clone(&self.self_ref),
            0,
            0,
            ContextKind::Vm,
            None,
            None,
            Arc::clone(&self.settings.vm_handler),
        ));
        self.state.lock().vm_context = Some(vm_context);

        if self.exports().malloc.is_none() {
            self.fail(FailState::MissingFunction, "missing malloc or proxy_on_memory_allocate export");
            return false;
        }
        if self.started_from != Some(Cloneable::InstantiatedModule) && !self.run_bootstrap() {
            return false;
        }
        !self.is_failed()
    }

    fn link_and_resolve(self: &Arc<Self>) -> Result<GuestExports, (FailState, String)> {
        let base_module = match (&self.base, self.started_from) {
            (Some(base), Some(cloneable)) => {
                let state = base.wasm().state.lock();
                Some((
                    cloneable,
                    state.abi_version,
                    state.bytecode.clone(),
                    state.precompiled.clone(),
                    state.function_names.clone(),
                ))
            }
            _ => None,
        };

        let mut guard = self.vm.lock();
        let vm = guard
            .as_mut()
            .ok_or((FailState::UnableToCreateVm, "no VM".to_string()))?;

        if let Some((cloneable, abi_version, bytecode, precompiled, function_names)) = base_module {
            if cloneable == Cloneable::NotCloneable
                && !vm.load(&bytecode, &precompiled, &function_names)
            {
                return Err((
                    FailState::UnableToInitializeCode,
                    "failed to load module from base VM".to_string(),
                ));
            }
            let mut state = self.state.lock();
            state.abi_version = abi_version;
            state.function_names = function_names;
        }

        if self.started_from != Some(Cloneable::InstantiatedModule) {
            self.register_callbacks(vm.as_mut());
            if !vm.link(&self.settings.vm_id) {
                return Err((FailState::UnableToInitializeCode, "failed to link module".to_string()));
            }
        }
        Ok(GuestExports::resolve(
            vm.as_mut(),
            self.abi_version(),
            &self.settings.capabilities,
        ))
    }

    fn register_callbacks(&self, vm: &mut dyn WasmVm) {
        for callback in self.settings.host_callbacks {
            let HostCallback {
                module,
                name,
                signature,
                function,
            } = *callback;
            let allowed = self.settings.capabilities.is_allowed(name);
            let bootstrap = is_bootstrap_callback(module, name);
            let wasm = Weak::clone(&self.self_ref);
            let host: HostFunction = Arc::new(move |guest: &mut dyn Guest, args: &[Word]| {
                if !allowed {
                    warn!(module, name, "call to host function without capability");
                    return Err(VmError::capability_denied(name));
                }
                let restricted = wasm
                    .upgrade()
                    .is_some_and(|wasm| wasm.restricted.load(Ordering::Acquire));
                if restricted && !bootstrap {
                    return Err(VmError::RestrictedCallback {
                        module: module.to_string(),
                        name: name.to_string(),
                    });
                }
                function(guest, args)
            });
            vm.register_callback(module, name, signature, host);
        }
    }

    /// Run `_initialize` then `main`, or `_start`, with only the bootstrap
    /// imports available. Returns false when a bootstrap call failed.
    fn run_bootstrap(self: &Arc<Self>) -> bool {
        let Some(vm_context) = self.vm_context() else {
            return true;
        };
        self.restricted.store(true, Ordering::Release);
        let result = self.bootstrap_calls(&vm_context);
        self.restricted.store(false, Ordering::Release);
        if let Err(e) = &result {
            warn!(vm_id = %self.settings.vm_id, "bootstrap aborted: {e}");
        }
        result.is_ok()
    }

    fn bootstrap_calls(self: &Arc<Self>, vm_context: &Arc<ContextBase>) -> Result<(), VmError> {
        let exports = self.exports();
        if let Some(initialize) = &exports.initialize {
            self.call_guest(vm_context, initialize, &[])?;
            if let Some(main) = &exports.main {
                self.call_guest(vm_context, main, &[Word(0), Word(0)])?;
            }
        } else if let Some(start) = &exports.start {
            self.call_guest(vm_context, start, &[])?;
        }
        Ok(())
    }

    // ---- calls ----

    /// Whether a guest call is executing on this VM.
    pub fn in_vm_call(&self) -> bool {
        self.in_vm_call.load(Ordering::Acquire)
    }

    /// Call a guest export on behalf of `context`.
    ///
    /// Nested top-level calls are refused. A trap fails the VM with
    /// [`FailState::RuntimeError`]. Deferred actions run before returning.
    pub fn call_guest(
        self: &Arc<Self>,
        context: &Arc<ContextBase>,
        function: &GuestFunction,
        args: &[Word],
    ) -> Result<Option<Word>, VmError> {
        if self.in_vm_call.swap(true, Ordering::AcqRel) {
            warn!(vm_id = %self.settings.vm_id, function = %function.name, "refusing reentrant call");
            return Err(VmError::Reentrant {
                function: function.name.to_string(),
            });
        }
        self.stop_iteration.store(false, Ordering::Release);
        let result = {
            let _attribution = current::enter(Arc::clone(self), Arc::clone(context));
            let mut vm = self.vm.lock();
            match vm.as_mut() {
                Some(vm) => vm.call(function, args),
                None => Err(VmError::Terminated),
            }
        };
        self.in_vm_call.store(false, Ordering::Release);

        if let Err(e) = &result {
            self.fail(FailState::RuntimeError, &e.to_string());
        }
        self.run_after_vm_call_actions();
        result
    }

    /// Queue work for after the current guest call, or run it now when no
    /// call is executing.
    pub fn add_after_vm_call_action(&self, action: AfterVmCallAction) {
        self.after_vm_call.lock().push_back(action);
        if !self.in_vm_call() {
            self.run_after_vm_call_actions();
        }
    }

    fn run_after_vm_call_actions(&self) {
        loop {
            let Some(action) = self.after_vm_call.lock().pop_front() else {
                break;
            };
            action();
        }
    }

    /// Ask the current stream callback to stop iteration (used by
    /// `proxy_send_local_response`).
    pub fn request_stop_iteration(&self) {
        self.stop_iteration.store(true, Ordering::Release);
    }

    pub(crate) fn take_stop_iteration(&self) -> bool {
        self.stop_iteration.swap(false, Ordering::AcqRel)
    }

    /// Stop the VM for good. Returns `false` when a guest call holds the VM;
    /// runaway calls are interrupted by the engine's deadline instead.
    pub fn terminate(&self) -> bool {
        let Some(mut vm) = self.vm.try_lock() else {
            return false;
        };
        if let Some(vm) = vm.as_mut() {
            vm.terminate();
        }
        drop(vm);
        self.fail(FailState::RuntimeError, "VM terminated");
        true
    }

    // ---- guest memory ----

    /// Allocate `size` bytes in the guest through its `malloc`.
    pub fn alloc_memory(self: &Arc<Self>, guest: &mut dyn Guest, size: u64) -> Option<u64> {
        let malloc = self.exports().malloc.clone()?;
        let vm_context = self.vm_context()?;
        let _attribution = current::enter(Arc::clone(self), vm_context);
        match guest.call(&malloc, &[Word(size)]) {
            Ok(Some(pointer)) if pointer.u64() != 0 || size == 0 => Some(pointer.u64()),
            Ok(_) => None,
            Err(e) => {
                warn!(vm_id = %self.settings.vm_id, "malloc failed: {e}");
                None
            }
        }
    }

    /// Copy `data` into fresh guest memory and store its pointer and size
    /// at `pointer_ptr` and `size_ptr`.
    pub fn copy_to_pointer_size(
        self: &Arc<Self>,
        guest: &mut dyn Guest,
        data: &[u8],
        pointer_ptr: u64,
        size_ptr: u64,
    ) -> bool {
        if data.is_empty() {
            return guest.set_word(pointer_ptr, Word(0)) && guest.set_word(size_ptr, Word(0));
        }
        let size = data.len() as u64;
        let Some(pointer) = self.alloc_memory(guest, size) else {
            return false;
        };
        guest.set_memory(pointer, data)
            && guest.set_word(pointer_ptr, Word(pointer))
            && guest.set_word(size_ptr, Word(size))
    }

    // ---- contexts ----

    pub fn vm_context(&self) -> Option<Arc<ContextBase>> {
        self.state.lock().vm_context.clone()
    }

    /// Look up a live context; id 0 is the VM context.
    pub fn get_context(&self, id: u32) -> Option<Arc<ContextBase>> {
        let state = self.state.lock();
        if id == 0 {
            return state.vm_context.clone();
        }
        state.contexts.get(&id).and_then(Weak::upgrade)
    }

    /// The root context serving `plugin`, if started.
    pub fn get_root_context(&self, plugin_key: &str) -> Option<Arc<ContextBase>> {
        self.state.lock().root_contexts.get(plugin_key).cloned()
    }

    fn new_context(
        &self,
        kind: ContextKind,
        parent_id: u32,
        plugin: &Arc<PluginBase>,
        plugin_handle: Option<Arc<PluginHandle>>,
        handler: Arc<dyn ContextHandler>,
    ) -> Arc<ContextBase> {
        let mut state = self.state.lock();
        state.contexts.retain(|_, context| context.strong_count() > 0);
        let id = state.alloc_context_id();
        let context = Arc::new(ContextBase::new(
            Weak::clone(&self.self_ref),
            id,
            parent_id,
            kind,
            Some(Arc::clone(plugin)),
            plugin_handle,
            handler,
        ));
        state.contexts.insert(id, Arc::downgrade(&context));
        context
    }

    /// Create (first call) or restart the root context of `plugin`.
    ///
    /// Returns `None` when the VM has failed or the first start fails.
    pub fn start(self: &Arc<Self>, plugin: &Arc<PluginBase>) -> Option<Arc<ContextBase>> {
        if self.is_failed() {
            return None;
        }
        if let Some(root) = self.get_root_context(plugin.key()) {
            root.on_start(plugin);
            return Some(root);
        }
        let handler = (self.settings.root_handler)(plugin);
        let root = self.new_context(ContextKind::Root, 0, plugin, None, handler);
        self.state
            .lock()
            .root_contexts
            .insert(plugin.key().to_string(), Arc::clone(&root));
        debug!(
            vm_id = %self.settings.vm_id,
            plugin = plugin.log_prefix(),
            context_id = root.id(),
            "starting root context"
        );
        root.on_start(plugin).then_some(root)
    }

    /// Deliver the plugin configuration to its root context.
    pub fn configure(&self, root: &Arc<ContextBase>, plugin: &Arc<PluginBase>) -> bool {
        if self.is_failed() {
            return false;
        }
        root.on_configure(plugin)
    }

    /// Create a stream context under the root context of `plugin`.
    pub fn create_stream_context(
        self: &Arc<Self>,
        plugin: &Arc<PluginBase>,
        handler: Arc<dyn ContextHandler>,
    ) -> Option<Arc<ContextBase>> {
        self.create_stream_context_with(plugin, None, handler)
    }

    pub(crate) fn create_stream_context_with(
        self: &Arc<Self>,
        plugin: &Arc<PluginBase>,
        plugin_handle: Option<Arc<PluginHandle>>,
        handler: Arc<dyn ContextHandler>,
    ) -> Option<Arc<ContextBase>> {
        let root = self.get_root_context(plugin.key())?;
        let context = self.new_context(ContextKind::Stream, root.id(), plugin, plugin_handle, handler);
        context.on_create();
        Some(context)
    }

    /// Shut down one root context, or all of them when `plugin_key` is
    /// `None`. Roots whose `proxy_on_done` returns false stay pending until
    /// the guest calls `proxy_done`.
    pub fn start_shutdown(&self, plugin_key: Option<&str>) {
        let roots: Vec<(String, Arc<ContextBase>)> = {
            let mut state = self.state.lock();
            match plugin_key {
                Some(key) => state.root_contexts.remove_entry(key).into_iter().collect(),
                None => state.root_contexts.drain().collect(),
            }
        };
        for (key, root) in roots {
            if root.on_done() {
                root.on_delete();
            } else {
                debug!(vm_id = %self.settings.vm_id, plugin = root.log_prefix(), "root context pending done");
                self.state.lock().pending_done.insert(key, root);
            }
        }
    }

    /// Guest-initiated completion of a pending root context. The root is
    /// deleted once the current guest call returns.
    pub fn done(&self, root: &ContextBase) -> WasmResult {
        let Some(plugin) = root.plugin() else {
            return WasmResult::NotFound;
        };
        {
            let mut state = self.state.lock();
            let Some(pending) = state.pending_done.remove(plugin.key()) else {
                return WasmResult::NotFound;
            };
            state.pending_delete.push(pending);
        }
        let wasm = Weak::clone(&self.self_ref);
        self.add_after_vm_call_action(Box::new(move || {
            if let Some(wasm) = wasm.upgrade() {
                wasm.finish_shutdown();
            }
        }));
        WasmResult::Ok
    }

    fn finish_shutdown(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending_delete);
        for root in pending {
            root.on_delete();
        }
    }

    /// No root context is live or waiting to finish.
    pub fn is_shutdown_complete(&self) -> bool {
        let state = self.state.lock();
        state.root_contexts.is_empty() && state.pending_done.is_empty() && state.pending_delete.is_empty()
    }
}

impl fmt::Debug for WasmBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmBase")
            .field("vm_id", &self.settings.vm_id)
            .field("engine", &self.engine)
            .field("started_from", &self.started_from)
            .field("fail_state", &self.fail_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_context(id: u32) -> Arc<ContextBase> {
        Arc::new(ContextBase::new(
            Weak::new(),
            id,
            0,
            ContextKind::Root,
            None,
            None,
            Arc::new(DefaultContextHandler),
        ))
    }

    #[test]
    fn test_bootstrap_callbacks_are_module_qualified() {
        assert!(is_bootstrap_callback("env", "proxy_log"));
        assert!(is_bootstrap_callback("wasi_snapshot_preview1", "fd_write"));
        assert!(is_bootstrap_callback("wasi_unstable", "clock_time_get"));
        assert!(!is_bootstrap_callback("env", "fd_write"));
        assert!(!is_bootstrap_callback("wasi_snapshot_preview1", "proxy_log"));
        assert!(!is_bootstrap_callback("wasi_snapshot_preview1", "random_get"));
        assert!(!is_bootstrap_callback("wasi_snapshot_preview1", "environ_sizes_get"));
        assert!(!is_bootstrap_callback("wasi_snapshot_preview1", "proc_exit"));
    }

    #[test]
    fn test_context_ids_increment() {
        let mut state = WasmState {
            next_context_id: 1,
            ..WasmState::default()
        };
        assert_eq!(state.alloc_context_id(), 1);
        assert_eq!(state.alloc_context_id(), 2);
    }

    #[test]
    fn test_context_ids_skip_zero_and_live() {
        let live = live_context(1);
        let mut state = WasmState {
            next_context_id: u32::MAX,
            ..WasmState::default()
        };
        state.contexts.insert(1, Arc::downgrade(&live));

        assert_eq!(state.alloc_context_id(), u32::MAX);
        assert_eq!(state.alloc_context_id(), 2);
    }

    #[test]
    fn test_context_ids_reuse_dead() {
        let dead = Arc::downgrade(&live_context(1));
        let mut state = WasmState {
            next_context_id: 1,
            ..WasmState::default()
        };
        state.contexts.insert(1, dead);

        assert_eq!(state.alloc_context_id(), 1);
    }

    #[test]
    fn test_missing_vm_fails() {
        let wasm = WasmBase::builder("no-vm").build(None);
        assert_eq!(wasm.fail_state(), FailState::UnableToCreateVm);
        assert!(!wasm.load(b"\0asm\x01\0\0\0", false));
        assert!(!wasm.initialize());
        assert_eq!(wasm.engine(), "none");
    }

    #[test]
    fn test_first_failure_sticks() {
        let wasm = WasmBase::builder("sticky").build(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        wasm.add_fail_callback(Arc::new(move |state| recorder.lock().push(state)));

        wasm.fail(FailState::RuntimeError, "boom");
        assert_eq!(wasm.fail_state(), FailState::UnableToCreateVm);
        assert_eq!(*seen.lock(), vec![FailState::RuntimeError]);
    }

    #[test]
    fn test_after_call_action_runs_immediately_outside_calls() {
        let wasm = WasmBase::builder("actions").build(None);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        wasm.add_after_vm_call_action(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }
}
