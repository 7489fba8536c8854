//! Wasmtime backend for the proxy-wasm runtime.
//!
//! - [`WasmtimeEngine`]: the process-wide engine, with pooling, fuel and epoch settings
//! - [`WasmtimeVm`]: one store and instance implementing [`proxy_wasm_core::WasmVm`]
//!
//! VMs are obtained through [`WasmtimeEngine::vm_factory`] and handed to
//! [`proxy_wasm_core::create_wasm`].

pub mod engine;
pub mod vm;

pub use engine::WasmtimeEngine;
pub use vm::{WasmtimeVm, precompiled_section_name};
