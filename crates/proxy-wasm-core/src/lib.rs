//! Engine-agnostic proxy-wasm host runtime.
//!
//! This crate loads proxy-wasm guest modules into a [`WasmVm`], tracks their
//! contexts and drives the guest's `proxy_on_*` hooks:
//! - [`WasmBase`]: one loaded module with its context table and fail state
//! - [`ContextBase`]: the VM, root and stream contexts hooks are called on
//! - [`ContextHandler`]: what the embedding proxy provides per context
//! - [`SharedData`] / [`SharedQueue`]: process-wide state shared between VMs
//! - [`handle`]: base VM cache, per-thread clones and the plugin canary
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Base WasmBase (per vm_key)              │
//! │  (Loaded and linked once per process, never executed    │
//! │   by worker threads)                                    │
//! └─────────────────────────────────────────────────────────┘
//!                            │ clone
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            Thread-local WasmBase clone                  │
//! │  - VM context (id 0)                                    │
//! │  - Root context per plugin ──▶ PluginHandle             │
//! │  - Stream contexts per request / connection             │
//! └─────────────────────────────────────────────────────────┘
//!                            │ host calls
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │   current context ──▶ ContextHandler (embedder)         │
//! │                   ──▶ SharedData / SharedQueue          │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod bytecode;
pub mod capabilities;
pub mod context;
pub mod current;
pub mod exports;
pub mod foreign;
pub mod handle;
pub mod handler;
pub mod pairs;
pub mod plugin;
pub mod shared_data;
pub mod shared_queue;
pub mod signature;
pub mod vm;
pub mod vm_id;
pub mod wasm;
pub mod word;

pub use capabilities::Capabilities;
pub use context::{ContextBase, ContextKind};
pub use exports::GuestExports;
pub use handle::{
    PluginHandle, WasmHandle, WasmHandleCloneFactory, WasmHandleFactory, create_wasm,
    get_or_create_thread_local_plugin, get_or_create_thread_local_wasm, make_vm_key,
};
pub use handler::{
    ContextHandler, DefaultContextHandler, GrpcCallRequest, GrpcStreamRequest, HttpCallRequest,
    LocalResponse,
};
pub use pairs::Pairs;
pub use plugin::PluginBase;
pub use shared_data::SharedData;
pub use shared_queue::{CallOnThread, SharedQueue, call_inline};
pub use vm::{
    Cloneable, Guest, GuestFunction, HostCallback, HostFn, HostFunction, Signature, ValueType,
    VmFactory, WasmVm,
};
pub use wasm::{AfterVmCallAction, FailCallback, RootHandlerFactory, WasmBase, WasmBaseBuilder};
pub use word::Word;
