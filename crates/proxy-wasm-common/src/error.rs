//! Error types for the proxy-wasm runtime.
//!
//! Two levels of failure exist:
//! - [`WasmResult`]: the per-call status code handed back to the guest
//!   from every host function. Never a panic, never fatal to the VM.
//! - [`FailState`]: the sticky health state of a whole VM.
//!
//! On the Rust side, errors are layered with `thiserror`:
//! - [`VmError`]: failures of a guest call or a host function (become traps)
//! - [`BytecodeError`]: malformed module input
//! - [`HostError`]: embedder-facing errors (engine setup, files, configuration)

use std::io;

use thiserror::Error;

/// Status code returned to the guest by host functions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WasmResult {
    #[error("ok")]
    Ok = 0,
    #[error("not found")]
    NotFound = 1,
    #[error("bad argument")]
    BadArgument = 2,
    #[error("serialization failure")]
    SerializationFailure = 3,
    #[error("parse failure")]
    ParseFailure = 4,
    #[error("bad expression")]
    BadExpression = 5,
    #[error("invalid memory access")]
    InvalidMemoryAccess = 6,
    #[error("empty")]
    Empty = 7,
    #[error("cas mismatch")]
    CasMismatch = 8,
    #[error("result mismatch")]
    ResultMismatch = 9,
    #[error("internal failure")]
    InternalFailure = 10,
    #[error("broken connection")]
    BrokenConnection = 11,
    #[error("unimplemented")]
    Unimplemented = 12,
}

impl WasmResult {
    /// Raw ABI value.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Collapse a `Result` whose error side is already a status code.
    pub fn from_result<T>(result: Result<T, WasmResult>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(status) => status,
        }
    }
}

/// Sticky health state of a VM.
///
/// Set once by the first failure and never cleared. Any value other than
/// [`FailState::Ok`] means the VM refuses further work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FailState {
    #[default]
    Ok,
    UnableToCreateVm,
    UnableToCloneVm,
    MissingFunction,
    UnableToInitializeCode,
    StartFailed,
    ConfigureFailed,
    RuntimeError,
}

impl FailState {
    /// Returns `true` for any state other than `Ok`.
    pub fn is_failed(self) -> bool {
        self != Self::Ok
    }
}

/// Failure of a guest call or of a host function invoked by the guest.
///
/// Host functions return this to abort the guest with a trap. Guest calls
/// return it when the guest traps or the VM refuses the call.
#[derive(Error, Debug)]
pub enum VmError {
    /// The guest trapped (unreachable, out of bounds, fuel, ...).
    #[error("Wasm trap in {function}: {message}")]
    Trap {
        /// Export that was being called.
        function: String,
        /// Engine-provided description, including a backtrace when available.
        message: String,
    },

    /// The VM was terminated and refuses all calls.
    #[error("VM has been terminated")]
    Terminated,

    /// A top-level call was attempted while the VM was already executing.
    #[error("reentrant call into {function} refused")]
    Reentrant {
        /// Export that was being called.
        function: String,
    },

    /// A host function outside the bootstrap allow-list was called during startup.
    #[error("restricted callback {module}.{name} called during bootstrap")]
    RestrictedCallback {
        /// Import module.
        module: String,
        /// Import name.
        name: String,
    },

    /// A host function that the capability allow-list does not grant was called.
    #[error("capability {name} is not allowed")]
    CapabilityDenied {
        /// Capability (import) name.
        name: String,
    },

    /// A host function ran with no context attributed to the current thread.
    #[error("host function {name} called without an active context")]
    NoActiveContext {
        /// Import name.
        name: &'static str,
    },

    /// A host function received a different number of arguments than declared.
    #[error("host function {name} expected {expected} arguments, got {actual}")]
    ArgumentCount {
        /// Import name.
        name: &'static str,
        /// Declared arity.
        expected: usize,
        /// Actual arity.
        actual: usize,
    },

    /// The guest requested process exit.
    #[error("guest called proc_exit({code})")]
    Exit {
        /// Exit code passed by the guest.
        code: u32,
    },
}

impl VmError {
    /// Create a new `Trap` error.
    pub fn trap(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Trap {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Create a new `CapabilityDenied` error.
    pub fn capability_denied(name: impl Into<String>) -> Self {
        Self::CapabilityDenied { name: name.into() }
    }
}

/// Malformed module bytecode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BytecodeError {
    /// Missing `\0asm` magic or unsupported version.
    #[error("invalid Wasm header")]
    InvalidHeader,

    /// The input ended inside a section, name, or varint.
    #[error("unexpected end of bytecode at offset {offset}")]
    Truncated {
        /// Offset at which more bytes were expected.
        offset: usize,
    },

    /// A varint did not fit in 32 bits.
    #[error("varint overflow at offset {offset}")]
    VarintOverflow {
        /// Offset of the varint's first byte.
        offset: usize,
    },

    /// A section or name did not fit inside its enclosing bounds.
    #[error("malformed section at offset {offset}")]
    MalformedSection {
        /// Offset of the section header.
        offset: usize,
    },

    /// The module signature section is missing or does not verify.
    #[error("signature verification failed: {reason}")]
    Signature {
        /// Description of the failure.
        reason: String,
    },
}

/// Top-level errors surfaced to embedders.
#[derive(Error, Debug)]
pub enum HostError {
    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// The engine could not be created.
    #[error("Engine creation failed: {reason}")]
    EngineCreation {
        /// Description of the engine failure.
        reason: String,
    },

    /// A module failed to load, link, or start.
    #[error("Plugin {plugin} failed: {state:?}")]
    PluginFailed {
        /// Plugin name.
        plugin: String,
        /// VM state when the failure was detected.
        state: FailState,
    },

    /// Malformed bytecode.
    #[error("Bytecode error: {0}")]
    Bytecode(#[from] BytecodeError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl HostError {
    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `EngineCreation` error.
    pub fn engine_creation(reason: impl Into<String>) -> Self {
        Self::EngineCreation {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wasm_result_codes() {
        assert_eq!(WasmResult::Ok.as_u32(), 0);
        assert_eq!(WasmResult::InvalidMemoryAccess.as_u32(), 6);
        assert_eq!(WasmResult::CasMismatch.as_u32(), 8);
        assert_eq!(WasmResult::Unimplemented.as_u32(), 12);
    }

    #[test]
    fn test_wasm_result_from_result() {
        assert_eq!(WasmResult::from_result::<u32>(Ok(7)), WasmResult::Ok);
        assert_eq!(
            WasmResult::from_result::<u32>(Err(WasmResult::NotFound)),
            WasmResult::NotFound
        );
    }

    #[test]
    fn test_fail_state() {
        assert!(!FailState::default().is_failed());
        assert!(FailState::RuntimeError.is_failed());
    }

    #[test]
    fn test_error_display() {
        let err = VmError::capability_denied("proxy_http_call");
        assert_eq!(err.to_string(), "capability proxy_http_call is not allowed");

        let err = HostError::invalid_config("missing vm_id");
        assert_eq!(err.to_string(), "Invalid configuration: missing vm_id");
    }

    #[test]
    fn test_error_from_bytecode() {
        let err: HostError = BytecodeError::InvalidHeader.into();
        assert!(matches!(err, HostError::Bytecode(BytecodeError::InvalidHeader)));
    }
}
