//! Process-wide named FIFO queues between VMs.
//!
//! A queue is owned by the root context that registered it. Enqueueing
//! hands a delivery closure to the owner's `call_on_thread` function, which
//! may run it inline or post it to the owner's thread. The closure looks the
//! owner up again by `vm_key`, so delivery is skipped if the VM is gone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use proxy_wasm_common::WasmResult;
use tracing::trace;

use crate::handle::get_thread_local_wasm;

/// Runs a task on the thread that owns a VM.
pub type CallOnThread = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// A [`CallOnThread`] that runs the task immediately on the calling thread.
pub fn call_inline() -> CallOnThread {
    Arc::new(|task: Box<dyn FnOnce() + Send>| task())
}

struct Queue {
    vm_key: String,
    context_id: u32,
    call_on_thread: CallOnThread,
    items: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    next_token: u32,
    tokens: HashMap<(String, String), u32>,
    live_tokens: HashSet<u32>,
    queues: HashMap<u32, Queue>,
}

impl Inner {
    fn next_token(&mut self) -> u32 {
        loop {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            if token != 0 && !self.live_tokens.contains(&token) {
                return token;
            }
        }
    }
}

/// Named queues keyed by `(vm_id, name)` and addressed by token.
pub struct SharedQueue {
    inner: Mutex<Inner>,
}

static GLOBAL: LazyLock<SharedQueue> = LazyLock::new(SharedQueue::new);

impl Default for SharedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedQueue {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_token: 1,
                ..Inner::default()
            }),
        }
    }

    /// The process-wide registry used by host functions.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Register (or re-register) a queue owned by `context_id` in the VM
    /// identified by `vm_key`. Re-registration keeps the token and any
    /// queued items but moves ownership to the new caller.
    pub fn register(
        &self,
        vm_id: &str,
        name: &str,
        context_id: u32,
        call_on_thread: CallOnThread,
        vm_key: &str,
    ) -> u32 {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let key = (vm_id.to_string(), name.to_string());
        let existing = inner.tokens.get(&key).copied();
        let token = match existing {
            Some(token) => token,
            None => {
                let token = inner.next_token();
                inner.tokens.insert(key, token);
                inner.live_tokens.insert(token);
                token
            }
        };
        let queue = inner.queues.entry(token).or_insert_with(|| Queue {
            vm_key: String::new(),
            context_id: 0,
            call_on_thread: Arc::clone(&call_on_thread),
            items: VecDeque::new(),
        });
        queue.vm_key = vm_key.to_string();
        queue.context_id = context_id;
        queue.call_on_thread = call_on_thread;
        token
    }

    /// Token of a registered queue, or `None`.
    pub fn resolve(&self, vm_id: &str, name: &str) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .tokens
            .get(&(vm_id.to_string(), name.to_string()))
            .copied()
    }

    /// Pop the oldest item.
    pub fn dequeue(&self, token: u32) -> Result<Vec<u8>, WasmResult> {
        let mut inner = self.inner.lock();
        let queue = inner.queues.get_mut(&token).ok_or(WasmResult::NotFound)?;
        queue.items.pop_front().ok_or(WasmResult::Empty)
    }

    /// Append an item and notify the owner.
    ///
    /// The notification is handed to `call_on_thread` after the lock is
    /// released.
    pub fn enqueue(&self, token: u32, value: &[u8]) -> Result<(), WasmResult> {
        let (vm_key, context_id, call_on_thread) = {
            let mut inner = self.inner.lock();
            let queue = inner.queues.get_mut(&token).ok_or(WasmResult::NotFound)?;
            queue.items.push_back(value.to_vec());
            (
                queue.vm_key.clone(),
                queue.context_id,
                Arc::clone(&queue.call_on_thread),
            )
        };

        call_on_thread(Box::new(move || {
            let Some(handle) = get_thread_local_wasm(&vm_key) else {
                trace!(token, vm_key = %vm_key, "queue owner is not loaded on this thread");
                return;
            };
            if let Some(context) = handle.wasm().get_context(context_id) {
                context.on_queue_ready(token);
            }
        }));
        Ok(())
    }

    /// Drop every queue registered under `vm_id`.
    pub fn delete_by_vm_id(&self, vm_id: &str) {
        let mut inner = self.inner.lock();
        let removed: Vec<u32> = inner
            .tokens
            .iter()
            .filter(|((id, _), _)| id == vm_id)
            .map(|(_, token)| *token)
            .collect();
        inner.tokens.retain(|(id, _), _| id != vm_id);
        for token in removed {
            inner.live_tokens.remove(&token);
            inner.queues.remove(&token);
        }
    }
}

impl fmt::Debug for SharedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SharedQueue")
            .field("queues", &inner.queues.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting() -> (CallOnThread, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let call: CallOnThread = Arc::new(move |_task: Box<dyn FnOnce() + Send>| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (call, count)
    }

    #[test]
    fn test_register_and_resolve() {
        let queues = SharedQueue::new();
        let (call, _) = counting();
        let token = queues.register("vm", "q", 1, call, "key");

        assert_ne!(token, 0);
        assert_eq!(queues.resolve("vm", "q"), Some(token));
        assert_eq!(queues.resolve("vm", "other"), None);
        assert_eq!(queues.resolve("other-vm", "q"), None);
    }

    #[test]
    fn test_fifo_order() {
        let queues = SharedQueue::new();
        let (call, notified) = counting();
        let token = queues.register("vm", "q", 1, call, "key");

        queues.enqueue(token, b"a").unwrap();
        queues.enqueue(token, b"b").unwrap();

        assert_eq!(queues.dequeue(token), Ok(b"a".to_vec()));
        assert_eq!(queues.dequeue(token), Ok(b"b".to_vec()));
        assert_eq!(queues.dequeue(token), Err(WasmResult::Empty));
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_token() {
        let queues = SharedQueue::new();
        assert_eq!(queues.dequeue(99), Err(WasmResult::NotFound));
        assert_eq!(queues.enqueue(99, b"x"), Err(WasmResult::NotFound));
    }

    #[test]
    fn test_reregister_preserves_items() {
        let queues = SharedQueue::new();
        let (call, _) = counting();
        let token = queues.register("vm", "q", 1, Arc::clone(&call), "key");
        queues.enqueue(token, b"kept").unwrap();

        let again = queues.register("vm", "q", 7, call, "other-key");
        assert_eq!(again, token);
        assert_eq!(queues.dequeue(token), Ok(b"kept".to_vec()));
    }

    #[test]
    fn test_distinct_tokens() {
        let queues = SharedQueue::new();
        let (call, _) = counting();
        let a = queues.register("vm", "a", 1, Arc::clone(&call), "key");
        let b = queues.register("vm", "b", 1, call, "key");
        assert_ne!(a, b);
    }

    #[test]
    fn test_delete_by_vm_id() {
        let queues = SharedQueue::new();
        let (call, _) = counting();
        let token = queues.register("vm", "q", 1, Arc::clone(&call), "key");
        let kept = queues.register("other", "q", 1, call, "key");

        queues.delete_by_vm_id("vm");
        assert_eq!(queues.resolve("vm", "q"), None);
        assert_eq!(queues.dequeue(token), Err(WasmResult::NotFound));
        assert_eq!(queues.resolve("other", "q"), Some(kept));
    }

    #[test]
    fn test_inline_delivery_without_owner_is_skipped() {
        let queues = SharedQueue::new();
        let token = queues.register("vm", "q", 1, call_inline(), "no-such-vm-key");
        assert_eq!(queues.enqueue(token, b"x"), Ok(()));
        assert_eq!(queues.dequeue(token), Ok(b"x".to_vec()));
    }
}
