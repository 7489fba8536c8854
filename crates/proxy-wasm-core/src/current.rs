//! Thread-local attribution of host calls to a context.
//!
//! Host functions receive no context argument from the guest. Before any
//! call into a VM, the caller enters a [`ContextGuard`], which records the
//! VM and the context the call is made on behalf of. Host functions then
//! resolve their target with [`context_or_effective`]. The guard restores
//! the previous attribution when dropped, so nested calls unwind correctly.
//!
//! This module is the only place the thread-locals are touched.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::ContextBase;
use crate::wasm::WasmBase;

#[derive(Clone)]
struct Frame {
    wasm: Arc<WasmBase>,
    context: Arc<ContextBase>,
}

thread_local! {
    static CURRENT: RefCell<Option<Frame>> = const { RefCell::new(None) };
    static EFFECTIVE_CONTEXT_ID: Cell<u32> = const { Cell::new(0) };
}

/// Restores the previous current and effective context on drop.
///
/// Not `Send`: it must be dropped on the thread that created it.
#[must_use = "the context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    saved: Option<Frame>,
    saved_effective: u32,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = CURRENT.with(|current| current.replace(self.saved.take()));
        EFFECTIVE_CONTEXT_ID.with(|effective| effective.set(self.saved_effective));
        drop(previous);
    }
}

/// Attribute host calls on this thread to `context` until the guard drops.
///
/// The effective context override is cleared for the duration.
pub fn enter(wasm: Arc<WasmBase>, context: Arc<ContextBase>) -> ContextGuard {
    let saved = CURRENT.with(|current| current.replace(Some(Frame { wasm, context })));
    let saved_effective = EFFECTIVE_CONTEXT_ID.with(|effective| effective.replace(0));
    ContextGuard {
        saved,
        saved_effective,
        _not_send: PhantomData,
    }
}

/// The VM and context the current guest call is attributed to.
pub fn current() -> Option<(Arc<WasmBase>, Arc<ContextBase>)> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|frame| (Arc::clone(&frame.wasm), Arc::clone(&frame.context)))
    })
}

/// Override the context used by host calls until the current guard drops.
pub fn set_effective_context(context_id: u32) {
    EFFECTIVE_CONTEXT_ID.with(|effective| effective.set(context_id));
}

/// The current effective context override, 0 when unset.
pub fn effective_context_id() -> u32 {
    EFFECTIVE_CONTEXT_ID.with(Cell::get)
}

/// The effective context if one is set and still alive, else the current one.
pub fn context_or_effective() -> Option<(Arc<WasmBase>, Arc<ContextBase>)> {
    let (wasm, context) = current()?;
    let effective = effective_context_id();
    if effective != 0 {
        if let Some(effective_context) = wasm.get_context(effective) {
            return Some((wasm, effective_context));
        }
    }
    Some((wasm, context))
}
