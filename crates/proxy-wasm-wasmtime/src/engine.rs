//! Wasmtime engine configuration and creation.
//!
//! The [`WasmtimeEngine`] is shared by every VM of the process. It is:
//! - Thread-safe and cheap to clone
//! - Configured with the pooling allocator for fast per-thread clones
//! - Set up with fuel metering and epoch interruption for per-call limits

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use proxy_wasm_common::{EngineConfig, ExecutionConfig, HostError};
use proxy_wasm_core::{VmFactory, WasmVm};

use crate::vm::WasmtimeVm;

/// Thread-safe Wasmtime engine wrapper.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Pooling Allocator**: reserves instance slots up front so that cloning
///   a base VM onto a worker thread only instantiates
/// - **Fuel Metering**: deterministic CPU limit per top-level guest call
/// - **Epoch Interruption**: wall clock limit, driven by [`WasmtimeEngine::increment_epoch`]
///
/// # Example
///
/// ```ignore
/// use proxy_wasm_common::HostConfig;
/// use proxy_wasm_wasmtime::WasmtimeEngine;
///
/// let config = HostConfig::default();
/// let engine = WasmtimeEngine::new(&config.engine, &config.execution)?;
/// let factory = engine.vm_factory();
/// ```
#[derive(Clone)]
pub struct WasmtimeEngine {
    engine: Engine,
    config: Arc<EngineConfig>,
    execution: Arc<ExecutionConfig>,
}

impl WasmtimeEngine {
    /// Create a new engine.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The limits are inconsistent (see [`EngineConfig::validate`])
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot reserve its slots
    pub fn new(config: &EngineConfig, execution: &ExecutionConfig) -> Result<Self, HostError> {
        config.validate(execution)?;

        let mut wasmtime_config = Config::new();

        wasmtime_config.consume_fuel(execution.fuel_metering);
        wasmtime_config.epoch_interruption(config.epoch_interruption);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);
            wasmtime_config.allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config)
            .map_err(|e| HostError::engine_creation(format!("Failed to create Wasmtime engine: {e}")))?;

        info!(
            fuel_metering = execution.fuel_metering,
            epoch_interruption = config.epoch_interruption,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine,
            config: Arc::new(config.clone()),
            execution: Arc::new(execution.clone()),
        })
    }

    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the per-call limits.
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// A factory creating empty VMs on this engine.
    pub fn vm_factory(&self) -> VmFactory {
        let engine = self.clone();
        Arc::new(move || Some(Box::new(WasmtimeVm::new(engine.clone())) as Box<dyn WasmVm>))
    }

    /// Increment the epoch counter.
    ///
    /// Call this periodically (every millisecond when `timeout_ms` is read
    /// as milliseconds) to bound how long a guest call may run.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmtimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("fuel_metering", &self.execution.fuel_metering)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_pooling() -> EngineConfig {
        EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_engine_creation_no_pooling() {
        let engine = WasmtimeEngine::new(&no_pooling(), &ExecutionConfig::default()).unwrap();
        assert!(!engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_creation_small_pool() {
        let config = EngineConfig {
            max_instances: 4,
            instance_memory_mb: 1,
            ..Default::default()
        };
        let execution = ExecutionConfig {
            max_memory_mb: 1,
            ..Default::default()
        };
        let engine = WasmtimeEngine::new(&config, &execution).unwrap();
        assert!(engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_rejects_invalid_limits() {
        let execution = ExecutionConfig {
            max_fuel: 0,
            ..Default::default()
        };
        let err = WasmtimeEngine::new(&no_pooling(), &execution).unwrap_err();
        assert!(matches!(err, HostError::InvalidConfig { .. }));
    }

    #[test]
    fn test_engine_epoch_increment() {
        let engine = WasmtimeEngine::new(&no_pooling(), &ExecutionConfig::default()).unwrap();

        // Should not panic
        engine.increment_epoch();
        engine.increment_epoch();
    }

    #[test]
    fn test_vm_factory_creates_vms() {
        let engine = WasmtimeEngine::new(&no_pooling(), &ExecutionConfig::default()).unwrap();
        let vm = (engine.vm_factory())().unwrap();
        assert_eq!(vm.engine(), "wasmtime");
    }

    #[test]
    fn test_engine_debug() {
        let engine = WasmtimeEngine::new(&no_pooling(), &ExecutionConfig::default()).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmtimeEngine"));
        assert!(debug_str.contains("pooling_allocator"));
    }
}
