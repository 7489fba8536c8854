//! Engine abstraction.
//!
//! A backend implements [`WasmVm`] once per engine. The host never talks to an
//! engine directly: it loads bytecode, registers host callbacks, links, looks
//! up typed exports and calls them through this trait.
//!
//! While the guest is running, host functions see the VM only as a
//! [`Guest`]: linear memory plus the ability to call back into exports (for
//! `malloc`). Backends hand host functions a `Guest` wrapping the engine's
//! caller handle, so no lock on the VM is needed on the way back in.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use proxy_wasm_common::VmError;

use crate::word::{WORD_SIZE, Word};

/// Scalar types appearing in host and guest signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
}

/// Typed function signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Parameter types in order.
    pub params: &'static [ValueType],
    /// Result type, if any.
    pub result: Option<ValueType>,
}

impl Signature {
    /// Create a signature.
    pub const fn new(params: &'static [ValueType], result: Option<ValueType>) -> Self {
        Self { params, result }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param:?}")?;
        }
        write!(f, ")")?;
        if let Some(result) = self.result {
            write!(f, " -> {result:?}")?;
        }
        Ok(())
    }
}

/// Build a [`Signature`] from a compact list of `i32`/`i64` types.
///
/// ```
/// use proxy_wasm_core::signature;
/// let sig = signature!((i32, i64) -> i32);
/// assert_eq!(sig.params.len(), 2);
/// ```
#[macro_export]
macro_rules! signature {
    (@ty i32) => { $crate::vm::ValueType::I32 };
    (@ty i64) => { $crate::vm::ValueType::I64 };
    (( $($param:ident),* )) => {
        $crate::vm::Signature::new(&[$($crate::signature!(@ty $param)),*], None)
    };
    (( $($param:ident),* ) -> $result:ident) => {
        $crate::vm::Signature::new(
            &[$($crate::signature!(@ty $param)),*],
            Some($crate::signature!(@ty $result)),
        )
    };
}

/// Handle to a guest export resolved by [`WasmVm::get_function`].
///
/// Only valid for the VM that produced it.
#[derive(Debug, Clone)]
pub struct GuestFunction {
    /// Backend-specific slot.
    pub index: usize,
    /// Export name, for diagnostics.
    pub name: Arc<str>,
    /// Signature the export was checked against.
    pub signature: Signature,
}

/// Host function callable by the guest.
pub type HostFunction = Arc<dyn Fn(&mut dyn Guest, &[Word]) -> Result<Word, VmError> + Send + Sync>;

/// Plain host function pointer, as stored in the callback table.
pub type HostFn = fn(&mut dyn Guest, &[Word]) -> Result<Word, VmError>;

/// One row of the host callback table.
///
/// When the capability `name` is not granted, a stub that traps is bound
/// in place of `function`.
#[derive(Clone, Copy)]
pub struct HostCallback {
    /// Import module (`env`, `wasi_snapshot_preview1`, ...).
    pub module: &'static str,
    /// Import name, which is also the capability name.
    pub name: &'static str,
    /// Declared signature.
    pub signature: Signature,
    /// Implementation.
    pub function: HostFn,
}

impl HostCallback {
    /// Create a table row.
    pub const fn new(
        module: &'static str,
        name: &'static str,
        signature: Signature,
        function: HostFn,
    ) -> Self {
        Self {
            module,
            name,
            signature,
            function,
        }
    }
}

impl fmt::Debug for HostCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCallback")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// How a VM can be replicated onto other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cloneable {
    /// Clones must reload from bytecode.
    NotCloneable,
    /// Clones share compiled code and instantiate fresh.
    CompiledBytecode,
    /// Clones share an already instantiated module.
    InstantiatedModule,
}

/// Guest linear memory and calls, as seen by host functions.
pub trait Guest {
    /// Current size of linear memory in bytes.
    fn memory_size(&self) -> u64;

    /// Borrow `size` bytes at `pointer`, or `None` when out of bounds.
    fn get_memory(&self, pointer: u64, size: u64) -> Option<&[u8]>;

    /// Copy `data` to `pointer`. Returns `false` when out of bounds.
    fn set_memory(&mut self, pointer: u64, data: &[u8]) -> bool;

    /// Call a resolved export.
    fn call(&mut self, function: &GuestFunction, args: &[Word]) -> Result<Option<Word>, VmError>;

    /// Read a little-endian guest word.
    fn get_word(&self, pointer: u64) -> Option<Word> {
        let bytes = self.get_memory(pointer, WORD_SIZE)?;
        let bytes: [u8; 4] = bytes.try_into().ok()?;
        Some(Word::from(u32::from_le_bytes(bytes)))
    }

    /// Write a little-endian guest word (truncated to 32 bits).
    fn set_word(&mut self, pointer: u64, word: Word) -> bool {
        self.set_memory(pointer, &word.u32().to_le_bytes())
    }

    /// Write a little-endian `u64`.
    fn set_u64(&mut self, pointer: u64, value: u64) -> bool {
        self.set_memory(pointer, &value.to_le_bytes())
    }

    /// Copy `size` bytes at `pointer` out of guest memory.
    fn read_bytes(&self, pointer: Word, size: Word) -> Option<Vec<u8>> {
        self.get_memory(pointer.u64(), size.u64()).map(<[u8]>::to_vec)
    }

    /// Read a UTF-8 string (lossily) from guest memory.
    fn read_string(&self, pointer: Word, size: Word) -> Option<String> {
        self.get_memory(pointer.u64(), size.u64())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

/// A WebAssembly engine instance.
pub trait WasmVm: Guest + Send {
    /// Engine name, e.g. `"wasmtime"`.
    fn engine(&self) -> &'static str;

    /// How this VM can be cloned.
    fn cloneable(&self) -> Cloneable;

    /// Create a sibling VM sharing compiled code. Only meaningful when
    /// [`WasmVm::cloneable`] is not [`Cloneable::NotCloneable`].
    fn clone_vm(&self) -> Option<Box<dyn WasmVm>>;

    /// Compile `bytecode`, or use `precompiled` when it is non-empty and valid.
    /// Leaves the VM untouched on failure.
    fn load(
        &mut self,
        bytecode: &[u8],
        precompiled: &[u8],
        function_names: &HashMap<u32, String>,
    ) -> bool;

    /// Resolve imports against registered callbacks and instantiate.
    fn link(&mut self, debug_name: &str) -> bool;

    /// Name of the custom section holding this engine's precompiled code.
    fn precompiled_section_name(&self) -> String;

    /// Look up an export and check it against `signature`.
    /// A signature mismatch is reported and yields `None`.
    fn get_function(&mut self, name: &str, signature: Signature) -> Option<GuestFunction>;

    /// Make a host function available as `module.name`.
    fn register_callback(
        &mut self,
        module: &str,
        name: &str,
        signature: Signature,
        function: HostFunction,
    );

    /// Stop the VM; every later call fails with [`VmError::Terminated`].
    fn terminate(&mut self);

    /// Whether [`WasmVm::terminate`] was called.
    fn is_terminated(&self) -> bool;
}

/// Creates fresh VMs for one engine.
pub type VmFactory = Arc<dyn Fn() -> Option<Box<dyn WasmVm>> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatMemory(Vec<u8>);

    impl Guest for FlatMemory {
        fn memory_size(&self) -> u64 {
            self.0.len() as u64
        }

        fn get_memory(&self, pointer: u64, size: u64) -> Option<&[u8]> {
            let range = crate::word::memory_range(pointer, size, self.0.len())?;
            Some(&self.0[range])
        }

        fn set_memory(&mut self, pointer: u64, data: &[u8]) -> bool {
            match crate::word::memory_range(pointer, data.len() as u64, self.0.len()) {
                Some(range) => {
                    self.0[range].copy_from_slice(data);
                    true
                }
                None => false,
            }
        }

        fn call(&mut self, function: &GuestFunction, _: &[Word]) -> Result<Option<Word>, VmError> {
            Err(VmError::trap(function.name.as_ref(), "no code"))
        }
    }

    #[test]
    fn test_signature_macro() {
        let sig = signature!((i32, i64) -> i32);
        assert_eq!(sig.params, &[ValueType::I32, ValueType::I64]);
        assert_eq!(sig.result, Some(ValueType::I32));

        let sig = signature!(());
        assert!(sig.params.is_empty());
        assert_eq!(sig.result, None);
        assert_eq!(signature!((i32) -> i64).to_string(), "(I32) -> I64");
    }

    #[test]
    fn test_words_are_little_endian() {
        let mut memory = FlatMemory(vec![0; 8]);
        assert!(memory.set_word(4, Word(0x0102_0304)));
        assert_eq!(&memory.0[4..], &[4, 3, 2, 1]);
        assert_eq!(memory.get_word(4), Some(Word(0x0102_0304)));
    }

    #[test]
    fn test_word_access_out_of_bounds() {
        let mut memory = FlatMemory(vec![0; 8]);
        assert!(!memory.set_word(5, Word(1)));
        assert_eq!(memory.get_word(6), None);
        assert_eq!(memory.read_bytes(Word(8), Word(1)), None);
        assert_eq!(memory.read_bytes(Word(8), Word(0)), Some(Vec::new()));
    }
}
