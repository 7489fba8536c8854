//! Named host functions callable through `proxy_call_foreign_function`.
//!
//! Embedders register extensions here once per process; guests invoke them
//! by name with an opaque argument buffer.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use proxy_wasm_common::WasmResult;

use crate::wasm::WasmBase;

/// A foreign function: receives the calling VM and the argument bytes, and
/// returns the result bytes handed back to the guest.
pub type ForeignFunction = Arc<dyn Fn(&WasmBase, &[u8]) -> Result<Vec<u8>, WasmResult> + Send + Sync>;

static REGISTRY: LazyLock<DashMap<String, ForeignFunction>> = LazyLock::new(DashMap::new);

/// Register (or replace) a foreign function.
pub fn register_foreign_function(name: impl Into<String>, function: ForeignFunction) {
    REGISTRY.insert(name.into(), function);
}

/// Look up a foreign function by name.
pub fn get_foreign_function(name: &str) -> Option<ForeignFunction> {
    REGISTRY.get(name).map(|entry| Arc::clone(entry.value()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        register_foreign_function(
            "reverse_for_test",
            Arc::new(|_: &WasmBase, args: &[u8]| Ok(args.iter().rev().copied().collect())),
        );

        assert!(get_foreign_function("reverse_for_test").is_some());
        assert!(get_foreign_function("missing_for_test").is_none());
    }
}
