//! Reference counting of VMs per `vm_id`.
//!
//! Every [`WasmBase`](crate::WasmBase) holds a [`VmIdHandle`] for its `vm_id`.
//! When the last handle for an id is dropped, the shared data and queues
//! stored under that id are released.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::shared_data::SharedData;
use crate::shared_queue::SharedQueue;

static HANDLES: LazyLock<Mutex<HashMap<String, Weak<VmIdHandle>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Keeps the shared state of one `vm_id` alive.
#[derive(Debug)]
pub struct VmIdHandle {
    vm_id: String,
}

impl VmIdHandle {
    /// The id this handle keeps alive.
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }
}

impl Drop for VmIdHandle {
    fn drop(&mut self) {
        {
            let mut handles = HANDLES.lock();
            if handles
                .get(&self.vm_id)
                .is_some_and(|weak| weak.strong_count() == 0)
            {
                handles.remove(&self.vm_id);
            }
        }
        debug!(vm_id = %self.vm_id, "last VM for vm_id released, dropping shared state");
        SharedData::global().delete_by_vm_id(&self.vm_id);
        SharedQueue::global().delete_by_vm_id(&self.vm_id);
    }
}

/// Get the live handle for `vm_id`, creating one if none exists.
pub fn get_vm_id_handle(vm_id: &str) -> Arc<VmIdHandle> {
    let mut handles = HANDLES.lock();
    if let Some(handle) = handles.get(vm_id).and_then(Weak::upgrade) {
        return handle;
    }
    let handle = Arc::new(VmIdHandle {
        vm_id: vm_id.to_string(),
    });
    handles.insert(vm_id.to_string(), Arc::downgrade(&handle));
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_shared() {
        let a = get_vm_id_handle("vm-id-shared");
        let b = get_vm_id_handle("vm-id-shared");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.vm_id(), "vm-id-shared");
    }

    #[test]
    fn test_last_handle_clears_shared_data() {
        let handle = get_vm_id_handle("vm-id-cleanup");
        SharedData::global()
            .set("vm-id-cleanup", "key", b"value", 0)
            .unwrap();

        let second = get_vm_id_handle("vm-id-cleanup");
        drop(handle);
        assert!(SharedData::global().get("vm-id-cleanup", "key").is_ok());

        drop(second);
        assert!(SharedData::global().get("vm-id-cleanup", "key").is_err());
    }
}
