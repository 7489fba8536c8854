//! [`WasmVm`] on top of a Wasmtime store.
//!
//! Each [`WasmtimeVm`] owns one [`Store`]. Clones share the compiled
//! [`Module`] and instantiate it into a fresh store, so per-thread copies of
//! a base VM never recompile.
//!
//! Host functions are registered with [`Linker::func_new`]; while one runs it
//! sees the VM through a guest view wrapping the Wasmtime [`Caller`],
//! which is also how it reenters the guest for `malloc`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, error, warn};
use wasmtime::{
    AsContextMut, Caller, Func, FuncType, Instance, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, Trap, Val, ValType, WasmBacktrace,
};

use proxy_wasm_common::VmError;
use proxy_wasm_core::word::memory_range;
use proxy_wasm_core::{
    Cloneable, Guest, GuestFunction, HostFunction, Signature, ValueType, WasmVm, Word,
};

use crate::engine::WasmtimeEngine;

/// Wasmtime major version, part of the precompiled section name.
const WASMTIME_MAJOR: u32 = 28;

/// Name of the custom section holding code precompiled by this backend for
/// the current platform.
pub fn precompiled_section_name() -> String {
    format!(
        "precompiled_wasmtime_v{WASMTIME_MAJOR}_{}_{}",
        std::env::consts::ARCH,
        std::env::consts::OS
    )
}

/// Data attached to the store.
struct VmState {
    /// Exports resolved by [`WasmVm::get_function`], indexed by
    /// [`GuestFunction::index`].
    functions: Vec<Func>,
    /// The guest's exported `memory`.
    memory: Option<Memory>,
    /// Function index to name, for symbolizing traps.
    function_names: Arc<HashMap<u32, String>>,
    limits: StoreLimits,
}

/// A Wasmtime-backed VM.
pub struct WasmtimeVm {
    engine: WasmtimeEngine,
    store: Store<VmState>,
    linker: Linker<VmState>,
    module: Option<Module>,
    instance: Option<Instance>,
    terminated: bool,
}

impl WasmtimeVm {
    /// Create an empty VM on `engine`.
    pub fn new(engine: WasmtimeEngine) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(engine.execution().max_memory_bytes())
            .build();
        let mut store = Store::new(
            engine.inner(),
            VmState {
                functions: Vec::new(),
                memory: None,
                function_names: Arc::new(HashMap::new()),
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);
        let linker = Linker::new(engine.inner());

        Self {
            engine,
            store,
            linker,
            module: None,
            instance: None,
            terminated: false,
        }
    }

    /// Re-arm fuel and the epoch deadline before a top-level call.
    fn arm_limits(&mut self) {
        let execution = self.engine.execution();
        if execution.fuel_metering {
            if let Err(e) = self.store.set_fuel(execution.max_fuel) {
                warn!(error = %e, "failed to set fuel");
            }
        }
        if self.engine.config().epoch_interruption {
            self.store.set_epoch_deadline(execution.epoch_deadline());
        }
    }

    #[allow(unsafe_code)]
    fn deserialize(&self, precompiled: &[u8]) -> Option<Module> {
        // SAFETY: precompiled sections are only read when the embedder allows
        // them, and Wasmtime rejects artifacts from other versions or hosts.
        match unsafe { Module::deserialize(self.engine.inner(), precompiled) } {
            Ok(module) => Some(module),
            Err(e) => {
                warn!(error = %e, "unusable precompiled code, compiling bytecode instead");
                None
            }
        }
    }
}

fn to_val_type(ty: ValueType) -> ValType {
    match ty {
        ValueType::I32 => ValType::I32,
        ValueType::I64 => ValType::I64,
    }
}

fn val_type_matches(actual: &ValType, expected: ValueType) -> bool {
    match expected {
        ValueType::I32 => matches!(actual, ValType::I32),
        ValueType::I64 => matches!(actual, ValType::I64),
    }
}

fn signature_matches(ty: &FuncType, signature: Signature) -> bool {
    let params_match = ty.params().len() == signature.params.len()
        && ty
            .params()
            .zip(signature.params)
            .all(|(actual, &expected)| val_type_matches(&actual, expected));
    let mut results = ty.results();
    let result_matches = match (results.next(), signature.result) {
        (None, None) => true,
        (Some(actual), Some(expected)) => {
            val_type_matches(&actual, expected) && results.next().is_none()
        }
        _ => false,
    };
    params_match && result_matches
}

#[allow(clippy::cast_possible_wrap)]
fn to_val(ty: ValueType, word: Word) -> Val {
    match ty {
        ValueType::I32 => Val::I32(word.u32() as i32),
        ValueType::I64 => Val::I64(word.u64() as i64),
    }
}

#[allow(clippy::cast_sign_loss)]
fn from_val(val: &Val) -> Word {
    match val {
        Val::I32(value) => Word::from(*value as u32),
        Val::I64(value) => Word(*value as u64),
        _ => Word(0),
    }
}

/// Describe a failed call, naming the frames of the guest backtrace.
fn describe_error(error: &wasmtime::Error, names: &HashMap<u32, String>) -> String {
    let mut message = match error.downcast_ref::<Trap>() {
        Some(trap) => trap.to_string(),
        None => error.root_cause().to_string(),
    };
    if let Some(backtrace) = error.downcast_ref::<WasmBacktrace>() {
        for (i, frame) in backtrace.frames().iter().enumerate() {
            let index = frame.func_index();
            let name = frame
                .func_name()
                .or_else(|| names.get(&index).map(String::as_str))
                .map_or_else(|| format!("<wasm function {index}>"), str::to_string);
            let _ = write!(message, "\n  {i}: {name}");
        }
    }
    message
}

fn into_vm_error(function: &str, error: wasmtime::Error, names: &HashMap<u32, String>) -> VmError {
    let message = describe_error(&error, names);
    match error.downcast::<VmError>() {
        Ok(vm_error) => vm_error,
        Err(_) => VmError::trap(function, message),
    }
}

/// Call `func` with arguments typed by `function.signature`.
fn invoke(
    mut store: impl AsContextMut<Data = VmState>,
    func: Func,
    function: &GuestFunction,
    args: &[Word],
) -> Result<Option<Word>, VmError> {
    if args.len() != function.signature.params.len() {
        return Err(VmError::trap(
            function.name.as_ref(),
            format!(
                "expected {} arguments, got {}",
                function.signature.params.len(),
                args.len()
            ),
        ));
    }
    let params: Vec<Val> = function
        .signature
        .params
        .iter()
        .zip(args)
        .map(|(&ty, &word)| to_val(ty, word))
        .collect();
    let mut results: Vec<Val> = function
        .signature
        .result
        .map(|ty| to_val(ty, Word(0)))
        .into_iter()
        .collect();

    let names = Arc::clone(&store.as_context_mut().data().function_names);
    func.call(&mut store, &params, &mut results)
        .map_err(|e| into_vm_error(&function.name, e, &names))?;
    Ok(results.first().map(from_val))
}

fn resolved(state: &VmState, function: &GuestFunction) -> Result<Func, VmError> {
    state
        .functions
        .get(function.index)
        .copied()
        .ok_or_else(|| VmError::trap(function.name.as_ref(), "function was not resolved on this VM"))
}

impl Guest for WasmtimeVm {
    fn memory_size(&self) -> u64 {
        self.store
            .data()
            .memory
            .map_or(0, |memory| memory.data_size(&self.store) as u64)
    }

    fn get_memory(&self, pointer: u64, size: u64) -> Option<&[u8]> {
        let memory = self.store.data().memory?;
        let data = memory.data(&self.store);
        let range = memory_range(pointer, size, data.len())?;
        Some(&data[range])
    }

    fn set_memory(&mut self, pointer: u64, data: &[u8]) -> bool {
        let Some(memory) = self.store.data().memory else {
            return false;
        };
        let memory = memory.data_mut(&mut self.store);
        match memory_range(pointer, data.len() as u64, memory.len()) {
            Some(range) => {
                memory[range].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    fn call(&mut self, function: &GuestFunction, args: &[Word]) -> Result<Option<Word>, VmError> {
        if self.terminated {
            return Err(VmError::Terminated);
        }
        let func = resolved(self.store.data(), function)?;
        self.arm_limits();
        invoke(&mut self.store, func, function, args)
    }
}

impl WasmVm for WasmtimeVm {
    fn engine(&self) -> &'static str {
        "wasmtime"
    }

    fn cloneable(&self) -> Cloneable {
        Cloneable::CompiledBytecode
    }

    fn clone_vm(&self) -> Option<Box<dyn WasmVm>> {
        let module = self.module.clone()?;
        let mut vm = WasmtimeVm::new(self.engine.clone());
        vm.store.data_mut().function_names = Arc::clone(&self.store.data().function_names);
        vm.module = Some(module);
        Some(Box::new(vm))
    }

    fn load(
        &mut self,
        bytecode: &[u8],
        precompiled: &[u8],
        function_names: &HashMap<u32, String>,
    ) -> bool {
        let module = if precompiled.is_empty() {
            None
        } else {
            self.deserialize(precompiled)
        };
        let module = match module {
            Some(module) => module,
            None => match Module::new(self.engine.inner(), bytecode) {
                Ok(module) => module,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "failed to compile module");
                    return false;
                }
            },
        };
        self.module = Some(module);
        self.store.data_mut().function_names = Arc::new(function_names.clone());
        true
    }

    fn link(&mut self, debug_name: &str) -> bool {
        let Some(module) = self.module.clone() else {
            error!(vm = debug_name, "link called before load");
            return false;
        };
        self.arm_limits();
        match self.linker.instantiate(&mut self.store, &module) {
            Ok(instance) => {
                let memory = instance.get_memory(&mut self.store, "memory");
                if memory.is_none() {
                    warn!(vm = debug_name, "module does not export memory");
                }
                self.store.data_mut().memory = memory;
                self.instance = Some(instance);
                debug!(vm = debug_name, "module instantiated");
                true
            }
            Err(e) => {
                error!(vm = debug_name, error = %format!("{e:#}"), "failed to link module");
                false
            }
        }
    }

    fn precompiled_section_name(&self) -> String {
        precompiled_section_name()
    }

    fn get_function(&mut self, name: &str, signature: Signature) -> Option<GuestFunction> {
        let instance = self.instance?;
        let func = instance.get_func(&mut self.store, name)?;
        let ty = func.ty(&self.store);
        if !signature_matches(&ty, signature) {
            error!(
                function = name,
                expected = %signature,
                "bad signature for exported function"
            );
            return None;
        }
        let functions = &mut self.store.data_mut().functions;
        functions.push(func);
        Some(GuestFunction {
            index: functions.len() - 1,
            name: Arc::from(name),
            signature,
        })
    }

    fn register_callback(
        &mut self,
        module: &str,
        name: &str,
        signature: Signature,
        function: HostFunction,
    ) {
        let ty = FuncType::new(
            self.engine.inner(),
            signature.params.iter().map(|&ty| to_val_type(ty)),
            signature.result.map(to_val_type),
        );
        let defined = self.linker.func_new(module, name, ty, move |mut caller, params, results| {
            let args: Vec<Word> = params.iter().map(from_val).collect();
            let word = function(&mut CallerGuest { caller: &mut caller }, &args)
                .map_err(wasmtime::Error::new)?;
            if let (Some(ty), Some(slot)) = (signature.result, results.first_mut()) {
                *slot = to_val(ty, word);
            }
            Ok(())
        });
        if let Err(e) = defined {
            warn!(module, name, error = %e, "failed to register host function");
        }
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// The VM as seen from inside a host function.
struct CallerGuest<'a, 'b> {
    caller: &'a mut Caller<'b, VmState>,
}

impl Guest for CallerGuest<'_, '_> {
    fn memory_size(&self) -> u64 {
        self.caller
            .data()
            .memory
            .map_or(0, |memory| memory.data_size(&*self.caller) as u64)
    }

    fn get_memory(&self, pointer: u64, size: u64) -> Option<&[u8]> {
        let memory = self.caller.data().memory?;
        let data = memory.data(&*self.caller);
        let range = memory_range(pointer, size, data.len())?;
        Some(&data[range])
    }

    fn set_memory(&mut self, pointer: u64, data: &[u8]) -> bool {
        let Some(memory) = self.caller.data().memory else {
            return false;
        };
        let memory = memory.data_mut(&mut *self.caller);
        match memory_range(pointer, data.len() as u64, memory.len()) {
            Some(range) => {
                memory[range].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    fn call(&mut self, function: &GuestFunction, args: &[Word]) -> Result<Option<Word>, VmError> {
        let func = resolved(self.caller.data(), function)?;
        invoke(&mut *self.caller, func, function, args)
    }
}

#[cfg(test)]
mod tests {
    use proxy_wasm_common::{EngineConfig, ExecutionConfig};
    use proxy_wasm_core::signature;

    use super::*;

    const GUEST: &str = r#"
        (module
            (import "env" "host_double" (func $double (param i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "hello")
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add)
            (func (export "double_via_host") (param i32) (result i32)
                local.get 0
                call $double)
            (func (export "crash")
                unreachable)
            (func (export "spin")
                (loop $l br $l)))
    "#;

    fn engine(execution: ExecutionConfig) -> WasmtimeEngine {
        let config = EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        };
        WasmtimeEngine::new(&config, &execution).unwrap()
    }

    fn double(_: &mut dyn Guest, args: &[Word]) -> Result<Word, VmError> {
        Ok(Word(args[0].u64() * 2))
    }

    fn loaded_vm(execution: ExecutionConfig) -> WasmtimeVm {
        let mut vm = WasmtimeVm::new(engine(execution));
        let bytecode = wat::parse_str(GUEST).unwrap();
        assert!(vm.load(&bytecode, &[], &HashMap::new()));
        vm.register_callback("env", "host_double", signature!((i32) -> i32), Arc::new(double));
        assert!(vm.link("test"));
        vm
    }

    #[test]
    fn test_call_export() {
        let mut vm = loaded_vm(ExecutionConfig::default());
        let add = vm.get_function("add", signature!((i32, i32) -> i32)).unwrap();
        assert_eq!(vm.call(&add, &[Word(2), Word(40)]).unwrap(), Some(Word(42)));
    }

    #[test]
    fn test_signature_mismatch_is_rejected() {
        let mut vm = loaded_vm(ExecutionConfig::default());
        assert!(vm.get_function("add", signature!((i32) -> i32)).is_none());
        assert!(vm.get_function("add", signature!((i32, i32))).is_none());
        assert!(vm.get_function("missing", signature!(())).is_none());
    }

    #[test]
    fn test_host_function() {
        let mut vm = loaded_vm(ExecutionConfig::default());
        let f = vm.get_function("double_via_host", signature!((i32) -> i32)).unwrap();
        assert_eq!(vm.call(&f, &[Word(21)]).unwrap(), Some(Word(42)));
    }

    #[test]
    fn test_memory_access() {
        let mut vm = loaded_vm(ExecutionConfig::default());
        assert_eq!(vm.memory_size(), 65536);
        assert_eq!(vm.get_memory(16, 5), Some(&b"hello"[..]));
        assert!(vm.set_memory(100, b"abc"));
        assert_eq!(vm.read_string(Word(100), Word(3)).as_deref(), Some("abc"));
        assert!(vm.get_memory(65535, 2).is_none());
        assert!(!vm.set_memory(65535, b"xy"));
    }

    #[test]
    fn test_trap_names_function() {
        let mut vm = loaded_vm(ExecutionConfig::default());
        let crash = vm.get_function("crash", signature!(())).unwrap();
        match vm.call(&crash, &[]) {
            Err(VmError::Trap { function, .. }) => assert_eq!(function, "crash"),
            other => panic!("expected trap, got {other:?}"),
        }
    }

    #[test]
    fn test_fuel_exhaustion_traps() {
        let mut vm = loaded_vm(ExecutionConfig {
            max_fuel: 10_000,
            fuel_metering: true,
            ..Default::default()
        });
        let spin = vm.get_function("spin", signature!(())).unwrap();
        assert!(matches!(vm.call(&spin, &[]), Err(VmError::Trap { .. })));

        // Fuel is re-armed for the next call.
        let add = vm.get_function("add", signature!((i32, i32) -> i32)).unwrap();
        assert_eq!(vm.call(&add, &[Word(1), Word(1)]).unwrap(), Some(Word(2)));
    }

    #[test]
    fn test_terminate() {
        let mut vm = loaded_vm(ExecutionConfig::default());
        let add = vm.get_function("add", signature!((i32, i32) -> i32)).unwrap();
        vm.terminate();
        assert!(vm.is_terminated());
        assert!(matches!(vm.call(&add, &[Word(1), Word(2)]), Err(VmError::Terminated)));
    }

    #[test]
    fn test_clone_shares_module() {
        let vm = loaded_vm(ExecutionConfig::default());
        let mut clone = vm.clone_vm().unwrap();
        clone.register_callback("env", "host_double", signature!((i32) -> i32), Arc::new(double));
        assert!(clone.link("clone"));
        let add = clone.get_function("add", signature!((i32, i32) -> i32)).unwrap();
        assert_eq!(clone.call(&add, &[Word(3), Word(4)]).unwrap(), Some(Word(7)));
    }

    #[test]
    fn test_missing_import_fails_link() {
        let mut vm = WasmtimeVm::new(engine(ExecutionConfig::default()));
        let bytecode = wat::parse_str(GUEST).unwrap();
        assert!(vm.load(&bytecode, &[], &HashMap::new()));
        assert!(!vm.link("test"));
    }

    #[test]
    fn test_bad_precompiled_falls_back_to_bytecode() {
        let mut vm = WasmtimeVm::new(engine(ExecutionConfig::default()));
        let bytecode = wat::parse_str(GUEST).unwrap();
        assert!(vm.load(&bytecode, b"not a native artifact", &HashMap::new()));
    }

    #[test]
    fn test_precompiled_section_name() {
        let name = precompiled_section_name();
        assert!(name.starts_with("precompiled_wasmtime_v28_"));
        assert!(name.ends_with(std::env::consts::OS));
    }
}
