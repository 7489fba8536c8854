//! Plugin configuration files.
//!
//! This module defines the TOML layout read by the command line tool:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`VmEntry`]: A VM, i.e. one module plus its VM-wide configuration
//! - [`PluginEntry`]: A plugin (root context) running inside a VM

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::HostConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [host.engine]
/// pooling_allocator = false
///
/// [host.execution]
/// max_fuel = 50_000_000
///
/// [[vms]]
/// id = "auth"
/// path = "./plugins/auth.wasm"
/// configuration = "{\"mode\": \"strict\"}"
/// allowed_capabilities = ["proxy_log", "proxy_get_header_map_value"]
///
/// [vms.environment]
/// REGION = "eu-west-1"
///
/// [[plugins]]
/// name = "auth-filter"
/// root_id = "auth_root"
/// vm = "auth"
/// configuration = "{}"
/// fail_open = false
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Engine and execution settings.
    #[serde(default)]
    pub host: HostConfig,

    /// VMs to create.
    #[serde(default)]
    pub vms: Vec<VmEntry>,

    /// Plugins to start inside those VMs.
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

impl ConfigFile {
    /// Load configuration from a file.
    ///
    /// Files ending in `.json` are read as JSON, everything else as TOML.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Same as [`ConfigFile::from_toml`].
    pub fn from_json(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = serde_json::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML or if a
    /// plugin refers to an undeclared VM.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references between tables and the engine limits.
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        self.host
            .engine
            .validate(&self.host.execution)
            .map_err(|e| ConfigFileError::Invalid {
                message: e.to_string(),
            })?;
        let mut ids = HashSet::new();
        for vm in &self.vms {
            if !ids.insert(vm.id.as_str()) {
                return Err(ConfigFileError::Invalid {
                    message: format!("duplicate vm id '{}'", vm.id),
                });
            }
        }
        for plugin in &self.plugins {
            if !ids.contains(plugin.vm.as_str()) {
                return Err(ConfigFileError::Invalid {
                    message: format!(
                        "plugin '{}' refers to unknown vm '{}'",
                        plugin.name, plugin.vm
                    ),
                });
            }
        }
        Ok(())
    }

    /// Look up a VM by id.
    pub fn vm(&self, id: &str) -> Option<&VmEntry> {
        self.vms.iter().find(|vm| vm.id == id)
    }
}

/// A VM entry: one module and its VM-wide settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmEntry {
    /// VM id. Plugins sharing a VM id share `SharedData` and queues.
    pub id: String,

    /// Path to the WebAssembly module file.
    pub path: String,

    /// Opaque VM configuration delivered to `proxy_on_vm_start`.
    #[serde(default)]
    pub configuration: String,

    /// Environment variables visible through WASI `environ_get`.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Host functions the module may call. Absent means all of them.
    #[serde(default)]
    pub allowed_capabilities: Option<Vec<String>>,

    /// Hex-encoded ed25519 public key the module signature must verify against.
    #[serde(default)]
    pub signing_key: Option<String>,
}

/// A plugin entry: one root context inside a VM.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginEntry {
    /// Human readable plugin name.
    pub name: String,

    /// Root id used by the guest SDK to pick its root context.
    #[serde(default)]
    pub root_id: String,

    /// Id of the [`VmEntry`] this plugin runs in.
    pub vm: String,

    /// Opaque plugin configuration delivered to `proxy_on_configure`.
    #[serde(default)]
    pub configuration: String,

    /// Let traffic through when the VM has failed.
    #[serde(default)]
    pub fail_open: bool,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// The file parsed but its tables are inconsistent.
    #[error("Invalid config file: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.vms.is_empty());
        assert!(config.plugins.is_empty());
        assert!(config.host.engine.pooling_allocator);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [host.engine]
            pooling_allocator = false

            [host.execution]
            max_fuel = 5_000_000

            [[vms]]
            id = "auth"
            path = "./auth.wasm"
            configuration = "vm-config"
            allowed_capabilities = ["proxy_log"]

            [vms.environment]
            REGION = "eu"

            [[plugins]]
            name = "auth-filter"
            root_id = "auth_root"
            vm = "auth"
            configuration = "{}"
            fail_open = true
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(!config.host.engine.pooling_allocator);
        assert_eq!(config.host.execution.max_fuel, 5_000_000);
        assert_eq!(config.vms.len(), 1);
        assert_eq!(config.vms[0].configuration, "vm-config");
        assert_eq!(config.vms[0].environment.get("REGION").map(String::as_str), Some("eu"));
        assert_eq!(
            config.vms[0].allowed_capabilities.as_deref(),
            Some(&["proxy_log".to_string()][..])
        );
        assert_eq!(config.plugins[0].root_id, "auth_root");
        assert!(config.plugins[0].fail_open);
        assert_eq!(config.vm("auth").map(|vm| vm.path.as_str()), Some("./auth.wasm"));
    }

    #[test]
    fn test_plugin_defaults() {
        let toml = r#"
            [[vms]]
            id = "a"
            path = "a.wasm"

            [[plugins]]
            name = "p"
            vm = "a"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();
        let plugin = &config.plugins[0];
        assert_eq!(plugin.root_id, "");
        assert_eq!(plugin.configuration, "");
        assert!(!plugin.fail_open);
        assert!(config.vms[0].allowed_capabilities.is_none());
        assert!(config.vms[0].signing_key.is_none());
    }

    #[test]
    fn test_unknown_vm_reference() {
        let toml = r#"
            [[plugins]]
            name = "orphan"
            vm = "missing"
        "#;

        let err = ConfigFile::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigFileError::Invalid { .. }));
    }

    #[test]
    fn test_duplicate_vm_id() {
        let toml = r#"
            [[vms]]
            id = "a"
            path = "a.wasm"

            [[vms]]
            id = "a"
            path = "b.wasm"
        "#;

        assert!(ConfigFile::from_toml(toml).is_err());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_engine_limits_checked() {
        let toml = r#"
            [host.engine]
            instance_memory_mb = 8

            [host.execution]
            max_memory_mb = 16
        "#;

        let err = ConfigFile::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("instance_memory_mb"));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"vms": [{{"id": "j", "path": "j.wasm"}}], "plugins": [{{"name": "p", "vm": "j"}}]}}"#
        )
        .unwrap();

        let config = ConfigFile::from_file(file.path()).unwrap();
        assert_eq!(config.vms[0].id, "j");
        assert_eq!(config.plugins[0].vm, "j");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[vms]]\nid = \"x\"\npath = \"x.wasm\"").unwrap();

        let config = ConfigFile::from_file(file.path()).unwrap();
        assert_eq!(config.vms[0].id, "x");

        let missing = ConfigFile::from_file("/nonexistent/plugins.toml");
        assert!(matches!(missing, Err(ConfigFileError::Io { .. })));
    }
}
