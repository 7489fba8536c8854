//! Configuration structures for the proxy-wasm runtime.
//!
//! This module defines configuration options for the execution engine:
//! - [`HostConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, interruption, precompiled code)
//! - [`ExecutionConfig`]: Per-call limits (fuel, memory, epoch deadline)

use serde::{Deserialize, Serialize};

use crate::HostError;

/// Top-level host configuration.
///
/// This structure contains all engine-level options. It is usually embedded
/// in a [`ConfigFile`](crate::ConfigFile) under the `[host]` table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Wasmtime engine configuration.
///
/// These settings are fixed for the lifetime of an engine and shared by
/// every VM it creates.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator for fast VM cloning.
    ///
    /// Memory for a fixed number of instances is reserved up front, which
    /// makes per-thread clones of a base VM cheap to instantiate.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// The embedder drives the epoch by calling `increment_epoch` on the engine.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Accept engine-specific precompiled code embedded in modules.
    ///
    /// When disabled, `precompiled_*` custom sections are ignored and the
    /// bytecode is always compiled.
    #[serde(default = "defaults::allow_precompiled")]
    pub allow_precompiled: bool,
}

impl EngineConfig {
    /// Check that the engine settings and the per-call limits fit together.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::InvalidConfig`] if:
    /// - The pool has no instance slots or zero-sized slots
    /// - The per-call memory limit does not fit in a pool slot
    /// - A limit that is enabled is zero
    pub fn validate(&self, execution: &ExecutionConfig) -> Result<(), HostError> {
        if self.pooling_allocator {
            if self.max_instances == 0 {
                return Err(HostError::invalid_config("max_instances must be at least 1"));
            }
            if self.instance_memory_mb == 0 {
                return Err(HostError::invalid_config("instance_memory_mb must be at least 1"));
            }
            if execution.max_memory_mb > self.instance_memory_mb {
                return Err(HostError::invalid_config(format!(
                    "max_memory_mb ({}) exceeds the pool slot size instance_memory_mb ({})",
                    execution.max_memory_mb, self.instance_memory_mb
                )));
            }
        }
        if execution.fuel_metering && execution.max_fuel == 0 {
            return Err(HostError::invalid_config("max_fuel must be non-zero with fuel_metering"));
        }
        if self.epoch_interruption && execution.timeout_ms == 0 {
            return Err(HostError::invalid_config(
                "timeout_ms must be non-zero with epoch_interruption",
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            allow_precompiled: defaults::allow_precompiled(),
        }
    }
}

/// Per-call execution configuration.
///
/// Limits are re-armed before every top-level call into the guest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (instructions) per top-level call.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Epoch deadline in ticks; one tick per millisecond when the embedder
    /// increments the epoch every millisecond.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            fuel_metering: defaults::fuel_metering(),
        }
    }
}

impl ExecutionConfig {
    /// Epoch ticks a call may run before it is interrupted.
    pub fn epoch_deadline(&self) -> u64 {
        self.timeout_ms.max(1)
    }

    /// Memory limit in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn allow_precompiled() -> bool {
        true
    }

    pub const fn max_fuel() -> u64 {
        1_000_000_000
    }

    pub const fn timeout_ms() -> u64 {
        1_000
    }

    pub const fn max_memory_mb() -> u32 {
        64
    }

    pub const fn fuel_metering() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();

        assert!(config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert_eq!(config.engine.instance_memory_mb, 64);
        assert!(config.engine.epoch_interruption);
        assert!(config.engine.allow_precompiled);

        assert_eq!(config.execution.max_fuel, 1_000_000_000);
        assert_eq!(config.execution.timeout_ms, 1_000);
        assert_eq!(config.execution.max_memory_mb, 64);
        assert!(config.execution.fuel_metering);
    }

    #[test]
    fn test_config_serialization() {
        let config = HostConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: HostConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.engine.max_instances,
            deserialized.engine.max_instances
        );
        assert_eq!(config.execution.max_fuel, deserialized.execution.max_fuel);
    }

    #[test]
    fn test_execution_limits() {
        let config = ExecutionConfig {
            timeout_ms: 500,
            max_memory_mb: 2,
            ..Default::default()
        };

        assert_eq!(config.epoch_deadline(), 500);
        assert_eq!(config.max_memory_bytes(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = HostConfig::default();
        assert!(config.engine.validate(&config.execution).is_ok());
    }

    #[test]
    fn test_memory_limit_must_fit_pool_slot() {
        let engine = EngineConfig {
            instance_memory_mb: 16,
            ..Default::default()
        };
        let execution = ExecutionConfig {
            max_memory_mb: 32,
            ..Default::default()
        };

        let err = engine.validate(&execution).unwrap_err();
        assert!(matches!(err, HostError::InvalidConfig { .. }));

        let unpooled = EngineConfig {
            pooling_allocator: false,
            ..engine
        };
        assert!(unpooled.validate(&execution).is_ok());
    }

    #[test]
    fn test_enabled_limits_must_be_non_zero() {
        let engine = EngineConfig::default();
        let no_fuel = ExecutionConfig {
            max_fuel: 0,
            ..Default::default()
        };
        let no_deadline = ExecutionConfig {
            timeout_ms: 0,
            ..Default::default()
        };

        assert!(engine.validate(&no_fuel).is_err());
        assert!(engine.validate(&no_deadline).is_err());
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"engine": {"allow_precompiled": false}}"#;
        let config: HostConfig = serde_json::from_str(json).unwrap();

        assert!(!config.engine.allow_precompiled);
        assert!(config.engine.pooling_allocator);
        assert_eq!(config.execution.max_fuel, 1_000_000_000);
    }
}
