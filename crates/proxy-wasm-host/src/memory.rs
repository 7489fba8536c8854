//! Argument and guest memory helpers shared by the host functions.

use std::sync::Arc;

use proxy_wasm_common::{VmError, WasmResult};
use proxy_wasm_core::{ContextBase, Guest, WasmBase, Word, current};

/// Return type of every host function.
pub type HostResult = Result<Word, VmError>;

/// Destructure exactly `N` arguments.
pub(crate) fn expect_args<const N: usize>(
    name: &'static str,
    args: &[Word],
) -> Result<[Word; N], VmError> {
    <[Word; N]>::try_from(args).map_err(|_| VmError::ArgumentCount {
        name,
        expected: N,
        actual: args.len(),
    })
}

/// The VM and the (effective) context the call is attributed to.
pub(crate) fn active(name: &'static str) -> Result<(Arc<WasmBase>, Arc<ContextBase>), VmError> {
    current::context_or_effective().ok_or(VmError::NoActiveContext { name })
}

/// Run a host operation and hand its status back to the guest.
pub(crate) fn run(operation: impl FnOnce() -> Result<(), WasmResult>) -> HostResult {
    Ok(Word::from(WasmResult::from_result(operation())))
}

/// Turn a handler status into a `Result`.
pub(crate) fn check(status: WasmResult) -> Result<(), WasmResult> {
    match status {
        WasmResult::Ok => Ok(()),
        error => Err(error),
    }
}

pub(crate) fn read_bytes(guest: &dyn Guest, pointer: Word, size: Word) -> Result<Vec<u8>, WasmResult> {
    guest
        .read_bytes(pointer, size)
        .ok_or(WasmResult::InvalidMemoryAccess)
}

pub(crate) fn read_string(guest: &dyn Guest, pointer: Word, size: Word) -> Result<String, WasmResult> {
    guest
        .read_string(pointer, size)
        .ok_or(WasmResult::InvalidMemoryAccess)
}

pub(crate) fn write_u32(guest: &mut dyn Guest, pointer: Word, value: u32) -> Result<(), WasmResult> {
    if guest.set_word(pointer.u64(), Word::from(value)) {
        Ok(())
    } else {
        Err(WasmResult::InvalidMemoryAccess)
    }
}

pub(crate) fn write_u64(guest: &mut dyn Guest, pointer: Word, value: u64) -> Result<(), WasmResult> {
    if guest.set_u64(pointer.u64(), value) {
        Ok(())
    } else {
        Err(WasmResult::InvalidMemoryAccess)
    }
}

/// Copy `data` into guest-allocated memory and report where it went.
pub(crate) fn copy_out(
    wasm: &Arc<WasmBase>,
    guest: &mut dyn Guest,
    data: &[u8],
    pointer_ptr: Word,
    size_ptr: Word,
) -> Result<(), WasmResult> {
    if wasm.copy_to_pointer_size(guest, data, pointer_ptr.u64(), size_ptr.u64()) {
        Ok(())
    } else {
        Err(WasmResult::InvalidMemoryAccess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_args() {
        let [a, b] = expect_args::<2>("f", &[Word(1), Word(2)]).unwrap();
        assert_eq!((a, b), (Word(1), Word(2)));

        let err = expect_args::<3>("f", &[Word(1)]).unwrap_err();
        assert!(matches!(
            err,
            VmError::ArgumentCount {
                name: "f",
                expected: 3,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_check_and_run() {
        assert_eq!(check(WasmResult::Ok), Ok(()));
        assert_eq!(check(WasmResult::NotFound), Err(WasmResult::NotFound));
        assert_eq!(run(|| Err(WasmResult::Empty)).unwrap(), Word(7));
        assert_eq!(run(|| Ok(())).unwrap(), Word(0));
    }

    #[test]
    fn test_no_active_context() {
        assert!(matches!(
            active("proxy_log"),
            Err(VmError::NoActiveContext { name: "proxy_log" })
        ));
    }
}
