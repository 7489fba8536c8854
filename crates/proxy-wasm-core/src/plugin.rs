//! Plugin identity.

use std::fmt;

/// Immutable description of one plugin (root context) inside a VM.
#[derive(Clone, PartialEq, Eq)]
pub struct PluginBase {
    name: String,
    root_id: String,
    vm_id: String,
    engine: String,
    plugin_configuration: String,
    fail_open: bool,
    key: String,
    log_prefix: String,
}

impl PluginBase {
    /// Create a plugin description.
    ///
    /// # Arguments
    ///
    /// * `name` - Human readable name, used in logs
    /// * `root_id` - Root id the guest SDK dispatches on
    /// * `vm_id` - VM id; plugins sharing it share `SharedData` and queues
    /// * `engine` - Engine name the plugin is meant for
    /// * `plugin_configuration` - Opaque configuration for `proxy_on_configure`
    /// * `fail_open` - Let traffic through when the VM has failed
    /// * `key_extra` - Extra discriminator appended to the plugin key
    pub fn new(
        name: impl Into<String>,
        root_id: impl Into<String>,
        vm_id: impl Into<String>,
        engine: impl Into<String>,
        plugin_configuration: impl Into<String>,
        fail_open: bool,
        key_extra: &str,
    ) -> Self {
        let name = name.into();
        let root_id = root_id.into();
        let vm_id = vm_id.into();
        let plugin_configuration = plugin_configuration.into();
        let key = format!("{root_id}||{plugin_configuration}||{key_extra}");
        let log_prefix = [name.as_str(), root_id.as_str(), vm_id.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            name,
            root_id,
            vm_id,
            engine: engine.into(),
            plugin_configuration,
            fail_open,
            key,
            log_prefix,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn plugin_configuration(&self) -> &str {
        &self.plugin_configuration
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    /// Identifies the plugin's root context within a VM.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `name root_id vm_id`, skipping empty parts.
    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }
}

impl fmt::Debug for PluginBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginBase")
            .field("name", &self.name)
            .field("root_id", &self.root_id)
            .field("vm_id", &self.vm_id)
            .field("fail_open", &self.fail_open)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let plugin = PluginBase::new("auth", "root", "vm", "wasmtime", "{}", false, "listener-1");
        assert_eq!(plugin.key(), "root||{}||listener-1");
    }

    #[test]
    fn test_same_root_different_config() {
        let a = PluginBase::new("a", "root", "vm", "wasmtime", "one", false, "");
        let b = PluginBase::new("b", "root", "vm", "wasmtime", "two", false, "");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_log_prefix_skips_empty() {
        let plugin = PluginBase::new("auth", "", "vm", "wasmtime", "", true, "");
        assert_eq!(plugin.log_prefix(), "auth vm");
        assert!(plugin.fail_open());
    }
}
