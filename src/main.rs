//! Proxy-Wasm runtime CLI entry point.
//!
//! - `inspect`: print what the runtime sees in a module (ABI version, custom
//!   sections, function names, vm key)
//! - `check`: load, initialize and canary every plugin of a TOML
//!   configuration file, as a proxy would before accepting traffic

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxy_wasm_common::{AbiVersion, ConfigFile, FailState, HostError, VmEntry};
use proxy_wasm_core::bytecode;
use proxy_wasm_core::{
    Capabilities, PluginBase, VmFactory, WasmBase, WasmHandle, WasmHandleFactory, create_wasm,
    make_vm_key,
};
use proxy_wasm_host::host_callbacks;
use proxy_wasm_wasmtime::{WasmtimeEngine, precompiled_section_name};

/// Custom section carrying a module signature.
const SIGNATURE_SECTION: &str = "signature_wasmsign";

#[derive(Parser)]
#[command(name = "proxy-wasm-runtime", version, about = "Proxy-Wasm plugin host runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the ABI version, custom sections and function names of a module.
    Inspect {
        /// Path to the WebAssembly module.
        path: PathBuf,

        /// Also print the vm key this module gets under this vm id.
        #[arg(long)]
        vm_id: Option<String>,

        /// VM configuration used for the vm key.
        #[arg(long, default_value = "")]
        vm_configuration: String,
    },

    /// Load, initialize and canary every plugin of a configuration file.
    Check {
        /// Path to the configuration file (TOML, or JSON with a `.json` extension).
        #[arg(short, long, env = "PROXY_WASM_CONFIG")]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,proxy_wasm_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Inspect {
            path,
            vm_id,
            vm_configuration,
        } => {
            let code = std::fs::read(&path)
                .with_context(|| format!("Failed to read module {}", path.display()))?;
            let report = inspect(&code, vm_id.as_deref(), &vm_configuration)?;
            print!("{report}");
        }
        Command::Check { config } => {
            let results = check(&config)?;
            for result in &results {
                match &result.failure {
                    None => println!("ok      {} (vm {})", result.plugin, result.vm_id),
                    Some(reason) => {
                        println!("FAILED  {} (vm {}): {reason}", result.plugin, result.vm_id);
                    }
                }
            }
            let failed = results.iter().filter(|r| r.failure.is_some()).count();
            if failed > 0 {
                bail!("{failed} of {} plugins failed", results.len());
            }
        }
    }

    Ok(())
}

/// Describe a module.
fn inspect(code: &[u8], vm_id: Option<&str>, vm_configuration: &str) -> anyhow::Result<String> {
    use std::fmt::Write as _;

    bytecode::check_wasm_header(code).context("Not a WebAssembly module")?;
    let abi = bytecode::get_abi_version(code).context("Failed to parse module")?;
    let sections = bytecode::custom_sections(code).context("Failed to parse module")?;
    let mut names: Vec<_> = bytecode::get_function_name_index(code)
        .context("Failed to parse module")?
        .into_iter()
        .collect();
    names.sort_unstable();

    let precompiled = precompiled_section_name();
    let mut out = String::new();
    writeln!(out, "size:        {} bytes", code.len())?;
    writeln!(out, "abi:         {abi}")?;
    if abi == AbiVersion::Unknown {
        writeln!(out, "             (not a Proxy-Wasm module)")?;
    }
    writeln!(
        out,
        "signed:      {}",
        sections.iter().any(|(name, _)| *name == SIGNATURE_SECTION)
    )?;
    writeln!(
        out,
        "precompiled: {} ({precompiled})",
        sections.iter().any(|(name, _)| *name == precompiled)
    )?;
    if let Some(vm_id) = vm_id {
        writeln!(out, "vm key:      {}", make_vm_key(vm_id, vm_configuration, code))?;
    }
    writeln!(out, "custom sections:")?;
    for (name, payload) in &sections {
        writeln!(out, "  {name} ({} bytes)", payload.len())?;
    }
    writeln!(out, "function names: {}", names.len())?;
    for (index, name) in &names {
        writeln!(out, "  {index}: {name}")?;
    }
    Ok(out)
}

/// Outcome of checking one plugin.
#[derive(Debug)]
struct CheckResult {
    plugin: String,
    vm_id: String,
    failure: Option<String>,
}

/// Load every VM of `config_path` and canary each plugin against it.
fn check(config_path: &Path) -> anyhow::Result<Vec<CheckResult>> {
    let config = ConfigFile::from_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    let engine = WasmtimeEngine::new(&config.host.engine, &config.host.execution)?;
    let vm_factory = engine.vm_factory();
    let clone_factory = WasmHandle::clone_factory(Arc::clone(&vm_factory));

    // Keep every loaded VM alive until all plugins are checked, so plugins
    // sharing a VM share its base.
    let mut handles = Vec::new();
    let mut results = Vec::new();
    for entry in &config.plugins {
        let Some(vm) = config.vm(&entry.vm) else {
            bail!("plugin '{}' refers to unknown vm '{}'", entry.name, entry.vm);
        };
        let path = base_dir.join(&vm.path);
        let code = std::fs::read(&path)
            .with_context(|| format!("Failed to read module {}", path.display()))?;
        let vm_key = make_vm_key(&vm.id, &vm.configuration, &code);
        let plugin = Arc::new(PluginBase::new(
            &entry.name,
            &entry.root_id,
            &vm.id,
            "wasmtime",
            &entry.configuration,
            entry.fail_open,
            "",
        ));

        let base_failure = Arc::new(OnceLock::new());
        let factory = wasm_factory(vm, &vm_factory, Arc::clone(&base_failure))?;
        let handle = create_wasm(
            &vm_key,
            &code,
            &plugin,
            &factory,
            &clone_factory,
            config.host.engine.allow_precompiled,
        );
        let failure = match handle {
            Some(handle) => {
                info!(plugin = %entry.name, vm_id = %vm.id, "plugin passed canary");
                handles.push(handle);
                None
            }
            None => {
                let reason = match base_failure.get() {
                    Some(&state) => HostError::PluginFailed {
                        plugin: entry.name.clone(),
                        state,
                    }
                    .to_string(),
                    None => "plugin rejected its configuration or failed to start".to_string(),
                };
                warn!(plugin = %entry.name, vm_id = %vm.id, %reason, "plugin failed canary");
                Some(reason)
            }
        };
        results.push(CheckResult {
            plugin: entry.name.clone(),
            vm_id: vm.id.clone(),
            failure,
        });
    }

    drop(handles);
    Ok(results)
}

/// Build the factory creating base VMs for `vm`. The first failure of a
/// created VM is recorded in `failure`.
fn wasm_factory(
    vm: &VmEntry,
    vm_factory: &VmFactory,
    failure: Arc<OnceLock<FailState>>,
) -> anyhow::Result<WasmHandleFactory> {
    let signing_key = vm
        .signing_key
        .as_deref()
        .map(|key| {
            let bytes = hex::decode(key).context("signing_key is not hex")?;
            <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| anyhow::anyhow!("signing_key must be 32 bytes, got {}", bytes.len()))
        })
        .transpose()
        .with_context(|| format!("Invalid signing key for vm '{}'", vm.id))?;
    let capabilities = Capabilities::from_list(vm.allowed_capabilities.clone());
    let vm = vm.clone();
    let vm_factory = Arc::clone(vm_factory);

    Ok(Arc::new(move |vm_key: &str| {
        let builder = WasmBase::builder(&vm.id)
            .vm_key(vm_key)
            .vm_configuration(&vm.configuration)
            .environment(vm.environment.clone())
            .capabilities(capabilities.clone())
            .host_callbacks(host_callbacks());
        let builder = match signing_key {
            Some(key) => builder.signing_key(key),
            None => builder,
        };
        let wasm = builder.build(vm_factory());
        let failure = Arc::clone(&failure);
        wasm.add_fail_callback(Arc::new(move |state| {
            let _ = failure.set(state);
        }));
        Some(WasmHandle::new(wasm))
    }))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::CommandFactory;
    use tempfile::TempDir;

    use super::*;

    fn guest(configure_result: i32) -> Vec<u8> {
        wat::parse_str(format!(
            r#"
            (module
                (memory (export "memory") 1)
                (global $heap (mut i32) (i32.const 1024))
                (func (export "proxy_abi_version_0_2_1"))
                (func (export "malloc") (param $size i32) (result i32)
                    (local $ptr i32)
                    global.get $heap
                    local.set $ptr
                    global.get $heap
                    local.get $size
                    i32.add
                    global.set $heap
                    local.get $ptr)
                (func (export "proxy_on_context_create") (param i32 i32))
                (func (export "proxy_on_vm_start") (param i32 i32) (result i32)
                    i32.const 1)
                (func (export "proxy_on_configure") (param i32 i32) (result i32)
                    i32.const {configure_result}))
            "#
        ))
        .unwrap()
    }

    fn write_config(dir: &TempDir, module: &str, code: &[u8]) -> PathBuf {
        std::fs::write(dir.path().join(module), code).unwrap();
        let path = dir.path().join("plugins.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
[host.engine]
pooling_allocator = false

[[vms]]
id = "vm-{module}"
path = "{module}"

[[plugins]]
name = "plugin-{module}"
vm = "vm-{module}"
"#
        )
        .unwrap();
        path
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_inspect_reports_abi_and_key() {
        let code = guest(1);
        let report = inspect(&code, Some("vm"), "").unwrap();
        assert!(report.contains("abi:         0.2.1"));
        assert!(report.contains("signed:      false"));
        assert!(report.contains(&make_vm_key("vm", "", &code)));
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        assert!(inspect(b"not wasm", None, "").is_err());
    }

    #[test]
    fn test_check_passes_healthy_plugin() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "healthy.wasm", &guest(1));

        let results = check(&config).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].plugin, "plugin-healthy.wasm");
        assert!(results[0].failure.is_none());
    }

    #[test]
    fn test_check_reports_rejected_configuration() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "rejecting.wasm", &guest(0));

        let results = check(&config).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].failure.is_some());
    }

    #[test]
    fn test_check_reports_vm_failure() {
        let dir = TempDir::new().unwrap();
        let code = wat::parse_str(r#"(module (memory (export "memory") 1))"#).unwrap();
        let config = write_config(&dir, "no-abi.wasm", &code);

        let results = check(&config).unwrap();
        let failure = results[0].failure.as_deref().unwrap();
        assert!(failure.contains("UnableToInitializeCode"), "{failure}");
    }

    #[test]
    fn test_check_missing_module() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "present.wasm", &guest(1));
        std::fs::remove_file(dir.path().join("present.wasm")).unwrap();

        assert!(check(&config).is_err());
    }
}
