//! Common types, errors, and configuration for the proxy-wasm runtime.
//!
//! This crate provides shared functionality used across the workspace:
//! - ABI enumerations exchanged with guest modules (statuses, map and buffer kinds)
//! - Error types using `thiserror`, plus the ABI-level [`WasmResult`] and [`FailState`]
//! - Configuration structures for the engine and for plugin files

pub mod abi;
pub mod config;
pub mod config_file;
pub mod error;

pub use abi::{
    AbiVersion, BufferType, CloseType, FilterDataStatus, FilterHeadersStatus,
    FilterMetadataStatus, FilterStatus, FilterTrailersStatus, GrpcStatus, HeaderMapType,
    LogLevel, MetricType, StreamType,
};
pub use config::{EngineConfig, ExecutionConfig, HostConfig};
pub use config_file::{ConfigFile, ConfigFileError, PluginEntry, VmEntry};
pub use error::{BytecodeError, FailState, HostError, VmError, WasmResult};
