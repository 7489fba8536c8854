//! Process-wide key/value store shared by all VMs with the same `vm_id`.
//!
//! Values carry a compare-and-swap token. Tokens are never 0 after a write,
//! so 0 can mean "unconditional" in [`SharedData::set`] and
//! [`SharedData::remove`].

use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::Mutex;
use proxy_wasm_common::WasmResult;

/// A stored value and its CAS token.
pub type SharedValue = (Vec<u8>, u32);

#[derive(Debug)]
struct Inner {
    next_cas: u32,
    data: HashMap<String, HashMap<String, SharedValue>>,
}

impl Inner {
    fn next_cas(&mut self) -> u32 {
        let cas = self.next_cas;
        self.next_cas = self.next_cas.wrapping_add(1);
        if self.next_cas == 0 {
            self.next_cas = 1;
        }
        cas
    }
}

/// Key/value store partitioned by `vm_id`, guarded by one lock.
#[derive(Debug)]
pub struct SharedData {
    inner: Mutex<Inner>,
}

static GLOBAL: LazyLock<SharedData> = LazyLock::new(SharedData::new);

impl Default for SharedData {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedData {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_initial_cas(1)
    }

    fn with_initial_cas(next_cas: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_cas,
                data: HashMap::new(),
            }),
        }
    }

    /// The process-wide store used by host functions.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Fetch a value and its CAS token.
    pub fn get(&self, vm_id: &str, key: &str) -> Result<SharedValue, WasmResult> {
        let inner = self.inner.lock();
        inner
            .data
            .get(vm_id)
            .and_then(|map| map.get(key))
            .cloned()
            .ok_or(WasmResult::NotFound)
    }

    /// Store a value.
    ///
    /// With `cas != 0` the write only succeeds if the key exists with that
    /// token; otherwise `CasMismatch`. A missing key is always created.
    pub fn set(&self, vm_id: &str, key: &str, value: &[u8], cas: u32) -> Result<(), WasmResult> {
        let mut inner = self.inner.lock();
        let current = inner
            .data
            .get(vm_id)
            .and_then(|map| map.get(key))
            .map(|(_, token)| *token);
        if let Some(token) = current {
            if cas != 0 && cas != token {
                return Err(WasmResult::CasMismatch);
            }
        }
        let token = inner.next_cas();
        inner
            .data
            .entry(vm_id.to_string())
            .or_default()
            .insert(key.to_string(), (value.to_vec(), token));
        Ok(())
    }

    /// Remove a value, returning what was stored.
    ///
    /// With `cas != 0` the removal only happens if the token matches.
    pub fn remove(&self, vm_id: &str, key: &str, cas: u32) -> Result<SharedValue, WasmResult> {
        let mut inner = self.inner.lock();
        let map = inner.data.get_mut(vm_id).ok_or(WasmResult::NotFound)?;
        let (_, token) = map.get(key).ok_or(WasmResult::NotFound)?;
        if cas != 0 && cas != *token {
            return Err(WasmResult::CasMismatch);
        }
        map.remove(key).ok_or(WasmResult::NotFound)
    }

    /// All keys stored for `vm_id`, in no particular order.
    pub fn keys(&self, vm_id: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .data
            .get(vm_id)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop everything stored for `vm_id`.
    pub fn delete_by_vm_id(&self, vm_id: &str) {
        self.inner.lock().data.remove(vm_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing() {
        let data = SharedData::new();
        assert_eq!(data.get("vm", "key"), Err(WasmResult::NotFound));
    }

    #[test]
    fn test_set_then_get() {
        let data = SharedData::new();
        data.set("vm", "key", b"v1", 0).unwrap();

        let (value, cas) = data.get("vm", "key").unwrap();
        assert_eq!(value, b"v1");
        assert_ne!(cas, 0);
    }

    #[test]
    fn test_cas_semantics() {
        let data = SharedData::new();
        data.set("vm", "key", b"v1", 0).unwrap();
        let (_, c1) = data.get("vm", "key").unwrap();

        data.set("vm", "key", b"v2", c1).unwrap();
        let (value, c2) = data.get("vm", "key").unwrap();
        assert_eq!(value, b"v2");
        assert_ne!(c2, c1);

        assert_eq!(data.set("vm", "key", b"v3", c1), Err(WasmResult::CasMismatch));
        assert_eq!(data.get("vm", "key").unwrap().0, b"v2");
    }

    #[test]
    fn test_cas_ignored_for_new_key() {
        let data = SharedData::new();
        assert_eq!(data.set("vm", "fresh", b"x", 42), Ok(()));
    }

    #[test]
    fn test_partitioned_by_vm_id() {
        let data = SharedData::new();
        data.set("a", "key", b"from-a", 0).unwrap();
        assert_eq!(data.get("b", "key"), Err(WasmResult::NotFound));
        assert!(data.keys("b").is_empty());
    }

    #[test]
    fn test_remove() {
        let data = SharedData::new();
        data.set("vm", "key", b"v", 0).unwrap();
        let (_, cas) = data.get("vm", "key").unwrap();

        assert_eq!(
            data.remove("vm", "key", cas.wrapping_add(1)),
            Err(WasmResult::CasMismatch)
        );
        assert_eq!(data.remove("vm", "key", cas), Ok((b"v".to_vec(), cas)));
        assert_eq!(data.remove("vm", "key", 0), Err(WasmResult::NotFound));
    }

    #[test]
    fn test_keys_and_delete_by_vm_id() {
        let data = SharedData::new();
        data.set("vm", "a", b"1", 0).unwrap();
        data.set("vm", "b", b"2", 0).unwrap();

        let mut keys = data.keys("vm");
        keys.sort();
        assert_eq!(keys, ["a", "b"]);

        data.delete_by_vm_id("vm");
        assert!(data.keys("vm").is_empty());
    }

    #[test]
    fn test_cas_skips_zero_on_wraparound() {
        let data = SharedData::with_initial_cas(u32::MAX);
        data.set("vm", "a", b"1", 0).unwrap();
        data.set("vm", "b", b"2", 0).unwrap();

        assert_eq!(data.get("vm", "a").unwrap().1, u32::MAX);
        assert_eq!(data.get("vm", "b").unwrap().1, 1);
    }
}
