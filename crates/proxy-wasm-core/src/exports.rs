//! Guest exports the host calls into.

use proxy_wasm_common::AbiVersion;
use tracing::debug;

use crate::capabilities::Capabilities;
use crate::signature;
use crate::vm::{GuestFunction, Signature, WasmVm};

/// Exports resolved once per VM after linking.
///
/// Hooks denied by the capability allow-list resolve to `None` and are
/// treated as absent. Bootstrap functions and `malloc` are never gated.
#[derive(Debug, Clone, Default)]
pub struct GuestExports {
    pub malloc: Option<GuestFunction>,
    pub initialize: Option<GuestFunction>,
    pub main: Option<GuestFunction>,
    pub start: Option<GuestFunction>,

    pub on_context_create: Option<GuestFunction>,
    pub on_vm_start: Option<GuestFunction>,
    pub on_configure: Option<GuestFunction>,
    pub on_tick: Option<GuestFunction>,
    pub on_queue_ready: Option<GuestFunction>,
    pub on_foreign_function: Option<GuestFunction>,
    pub on_done: Option<GuestFunction>,
    pub on_log: Option<GuestFunction>,
    pub on_delete: Option<GuestFunction>,

    pub on_new_connection: Option<GuestFunction>,
    pub on_downstream_data: Option<GuestFunction>,
    pub on_upstream_data: Option<GuestFunction>,
    pub on_downstream_connection_close: Option<GuestFunction>,
    pub on_upstream_connection_close: Option<GuestFunction>,

    pub on_request_headers: Option<GuestFunction>,
    pub on_request_body: Option<GuestFunction>,
    pub on_request_trailers: Option<GuestFunction>,
    pub on_request_metadata: Option<GuestFunction>,
    pub on_response_headers: Option<GuestFunction>,
    pub on_response_body: Option<GuestFunction>,
    pub on_response_trailers: Option<GuestFunction>,
    pub on_response_metadata: Option<GuestFunction>,

    pub on_http_call_response: Option<GuestFunction>,
    pub on_grpc_receive_initial_metadata: Option<GuestFunction>,
    pub on_grpc_receive_trailing_metadata: Option<GuestFunction>,
    pub on_grpc_receive: Option<GuestFunction>,
    pub on_grpc_close: Option<GuestFunction>,
}

impl GuestExports {
    /// Look up every known export for the given ABI version.
    pub fn resolve(vm: &mut dyn WasmVm, abi: AbiVersion, capabilities: &Capabilities) -> Self {
        let malloc = vm
            .get_function("malloc", signature!((i32) -> i32))
            .or_else(|| vm.get_function("proxy_on_memory_allocate", signature!((i32) -> i32)));
        let initialize = vm.get_function("_initialize", signature!(()));
        let main = vm.get_function("main", signature!((i32, i32) -> i32));
        let start = vm.get_function("_start", signature!(()));

        let mut hook = |name: &str, signature: Signature| {
            if capabilities.is_allowed(name) {
                vm.get_function(name, signature)
            } else {
                debug!(export = name, "export not granted, ignoring");
                None
            }
        };

        let headers = if abi.is_v0_2() {
            signature!((i32, i32, i32) -> i32)
        } else {
            signature!((i32, i32) -> i32)
        };
        let on_foreign_function = if abi.is_v0_2() {
            hook("proxy_on_foreign_function", signature!((i32, i32, i32)))
        } else {
            None
        };

        Self {
            malloc,
            initialize,
            main,
            start,
            on_context_create: hook("proxy_on_context_create", signature!((i32, i32))),
            on_vm_start: hook("proxy_on_vm_start", signature!((i32, i32) -> i32)),
            on_configure: hook("proxy_on_configure", signature!((i32, i32) -> i32)),
            on_tick: hook("proxy_on_tick", signature!((i32))),
            on_queue_ready: hook("proxy_on_queue_ready", signature!((i32, i32))),
            on_foreign_function,
            on_done: hook("proxy_on_done", signature!((i32) -> i32)),
            on_log: hook("proxy_on_log", signature!((i32))),
            on_delete: hook("proxy_on_delete", signature!((i32))),
            on_new_connection: hook("proxy_on_new_connection", signature!((i32) -> i32)),
            on_downstream_data: hook("proxy_on_downstream_data", signature!((i32, i32, i32) -> i32)),
            on_upstream_data: hook("proxy_on_upstream_data", signature!((i32, i32, i32) -> i32)),
            on_downstream_connection_close: hook(
                "proxy_on_downstream_connection_close",
                signature!((i32, i32)),
            ),
            on_upstream_connection_close: hook(
                "proxy_on_upstream_connection_close",
                signature!((i32, i32)),
            ),
            on_request_headers: hook("proxy_on_request_headers", headers),
            on_request_body: hook("proxy_on_request_body", signature!((i32, i32, i32) -> i32)),
            on_request_trailers: hook("proxy_on_request_trailers", signature!((i32, i32) -> i32)),
            on_request_metadata: hook("proxy_on_request_metadata", signature!((i32, i32) -> i32)),
            on_response_headers: hook("proxy_on_response_headers", headers),
            on_response_body: hook("proxy_on_response_body", signature!((i32, i32, i32) -> i32)),
            on_response_trailers: hook("proxy_on_response_trailers", signature!((i32, i32) -> i32)),
            on_response_metadata: hook("proxy_on_response_metadata", signature!((i32, i32) -> i32)),
            on_http_call_response: hook(
                "proxy_on_http_call_response",
                signature!((i32, i32, i32, i32, i32)),
            ),
            on_grpc_receive_initial_metadata: hook(
                "proxy_on_grpc_receive_initial_metadata",
                signature!((i32, i32, i32)),
            ),
            on_grpc_receive_trailing_metadata: hook(
                "proxy_on_grpc_receive_trailing_metadata",
                signature!((i32, i32, i32)),
            ),
            on_grpc_receive: hook("proxy_on_grpc_receive", signature!((i32, i32, i32))),
            on_grpc_close: hook("proxy_on_grpc_close", signature!((i32, i32, i32))),
        }
    }
}
