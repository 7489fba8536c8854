//! Host functions for proxy-wasm guests.
//!
//! This crate implements the imports a guest module links against:
//! - [`abi`]: the `env.proxy_*` functions of ABI 0.1.0 and 0.2.x
//! - [`wasi`]: the WASI preview1 subset needed to start toolchain-built guests
//! - [`logging`]: where guest log lines and stdio go
//!
//! [`host_callbacks`] returns the complete table to pass to
//! [`WasmBaseBuilder::host_callbacks`](proxy_wasm_core::WasmBaseBuilder::host_callbacks).
//! Each function resolves the context it acts on from the thread-local call
//! attribution kept by `proxy_wasm_core::current`.

pub mod abi;
pub mod linker;
pub mod logging;
mod memory;
pub mod wasi;

pub use linker::host_callbacks;
pub use logging::GuestLog;
pub use memory::HostResult;
