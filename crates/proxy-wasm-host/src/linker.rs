//! The host callback table handed to every VM.

use std::sync::LazyLock;

use proxy_wasm_core::{HostCallback, HostFn, Signature, signature};

use crate::{abi, wasi};

/// Import modules the WASI functions are registered under.
const WASI_MODULES: [&str; 2] = ["wasi_snapshot_preview1", "wasi_unstable"];

const PROXY: &[(&str, Signature, HostFn)] = &[
    ("proxy_log", signature!((i32, i32, i32) -> i32), abi::proxy_log),
    ("proxy_get_log_level", signature!((i32) -> i32), abi::proxy_get_log_level),
    (
        "proxy_get_current_time_nanoseconds",
        signature!((i32) -> i32),
        abi::proxy_get_current_time_nanoseconds,
    ),
    ("proxy_get_status", signature!((i32, i32, i32) -> i32), abi::proxy_get_status),
    (
        "proxy_set_effective_context",
        signature!((i32) -> i32),
        abi::proxy_set_effective_context,
    ),
    ("proxy_done", signature!(() -> i32), abi::proxy_done),
    (
        "proxy_call_foreign_function",
        signature!((i32, i32, i32, i32, i32, i32) -> i32),
        abi::proxy_call_foreign_function,
    ),
    ("proxy_get_property", signature!((i32, i32, i32, i32) -> i32), abi::proxy_get_property),
    ("proxy_set_property", signature!((i32, i32, i32, i32) -> i32), abi::proxy_set_property),
    ("proxy_continue_stream", signature!((i32) -> i32), abi::proxy_continue_stream),
    ("proxy_close_stream", signature!((i32) -> i32), abi::proxy_close_stream),
    ("proxy_continue_request", signature!(() -> i32), abi::proxy_continue_request),
    ("proxy_continue_response", signature!(() -> i32), abi::proxy_continue_response),
    (
        "proxy_send_local_response",
        signature!((i32, i32, i32, i32, i32, i32, i32, i32) -> i32),
        abi::proxy_send_local_response,
    ),
    ("proxy_clear_route_cache", signature!(() -> i32), abi::proxy_clear_route_cache),
    (
        "proxy_get_shared_data",
        signature!((i32, i32, i32, i32, i32) -> i32),
        abi::proxy_get_shared_data,
    ),
    (
        "proxy_set_shared_data",
        signature!((i32, i32, i32, i32, i32) -> i32),
        abi::proxy_set_shared_data,
    ),
    (
        "proxy_get_shared_data_keys",
        signature!((i32, i32) -> i32),
        abi::proxy_get_shared_data_keys,
    ),
    (
        "proxy_remove_shared_data",
        signature!((i32, i32, i32) -> i32),
        abi::proxy_remove_shared_data,
    ),
    (
        "proxy_register_shared_queue",
        signature!((i32, i32, i32) -> i32),
        abi::proxy_register_shared_queue,
    ),
    (
        "proxy_resolve_shared_queue",
        signature!((i32, i32, i32, i32, i32) -> i32),
        abi::proxy_resolve_shared_queue,
    ),
    (
        "proxy_dequeue_shared_queue",
        signature!((i32, i32, i32) -> i32),
        abi::proxy_dequeue_shared_queue,
    ),
    (
        "proxy_enqueue_shared_queue",
        signature!((i32, i32, i32) -> i32),
        abi::proxy_enqueue_shared_queue,
    ),
    (
        "proxy_get_header_map_value",
        signature!((i32, i32, i32, i32, i32) -> i32),
        abi::proxy_get_header_map_value,
    ),
    (
        "proxy_add_header_map_value",
        signature!((i32, i32, i32, i32, i32) -> i32),
        abi::proxy_add_header_map_value,
    ),
    (
        "proxy_replace_header_map_value",
        signature!((i32, i32, i32, i32, i32) -> i32),
        abi::proxy_replace_header_map_value,
    ),
    (
        "proxy_remove_header_map_value",
        signature!((i32, i32, i32) -> i32),
        abi::proxy_remove_header_map_value,
    ),
    (
        "proxy_get_header_map_pairs",
        signature!((i32, i32, i32) -> i32),
        abi::proxy_get_header_map_pairs,
    ),
    (
        "proxy_set_header_map_pairs",
        signature!((i32, i32, i32) -> i32),
        abi::proxy_set_header_map_pairs,
    ),
    (
        "proxy_get_header_map_size",
        signature!((i32, i32) -> i32),
        abi::proxy_get_header_map_size,
    ),
    (
        "proxy_get_buffer_status",
        signature!((i32, i32, i32) -> i32),
        abi::proxy_get_buffer_status,
    ),
    (
        "proxy_get_buffer_bytes",
        signature!((i32, i32, i32, i32, i32) -> i32),
        abi::proxy_get_buffer_bytes,
    ),
    (
        "proxy_set_buffer_bytes",
        signature!((i32, i32, i32, i32, i32) -> i32),
        abi::proxy_set_buffer_bytes,
    ),
    ("proxy_get_configuration", signature!((i32, i32) -> i32), abi::proxy_get_configuration),
    (
        "proxy_http_call",
        signature!((i32, i32, i32, i32, i32, i32, i32, i32, i32, i32) -> i32),
        abi::proxy_http_call,
    ),
    (
        "proxy_grpc_call",
        signature!((i32, i32, i32, i32, i32, i32, i32, i32, i32, i32, i32, i32) -> i32),
        abi::proxy_grpc_call,
    ),
    (
        "proxy_grpc_stream",
        signature!((i32, i32, i32, i32, i32, i32, i32, i32, i32) -> i32),
        abi::proxy_grpc_stream,
    ),
    ("proxy_grpc_send", signature!((i32, i32, i32, i32) -> i32), abi::proxy_grpc_send),
    ("proxy_grpc_cancel", signature!((i32) -> i32), abi::proxy_grpc_cancel),
    ("proxy_grpc_close", signature!((i32) -> i32), abi::proxy_grpc_close),
    (
        "proxy_set_tick_period_milliseconds",
        signature!((i32) -> i32),
        abi::proxy_set_tick_period_milliseconds,
    ),
    ("proxy_define_metric", signature!((i32, i32, i32, i32) -> i32), abi::proxy_define_metric),
    ("proxy_increment_metric", signature!((i32, i64) -> i32), abi::proxy_increment_metric),
    ("proxy_record_metric", signature!((i32, i64) -> i32), abi::proxy_record_metric),
    ("proxy_get_metric", signature!((i32, i32) -> i32), abi::proxy_get_metric),
];

const WASI: &[(&str, Signature, HostFn)] = &[
    ("fd_write", signature!((i32, i32, i32, i32) -> i32), wasi::fd_write),
    ("fd_read", signature!((i32, i32, i32, i32) -> i32), wasi::fd_read),
    ("fd_seek", signature!((i32, i64, i32, i32) -> i32), wasi::fd_seek),
    ("fd_close", signature!((i32) -> i32), wasi::fd_close),
    ("fd_fdstat_get", signature!((i32, i32) -> i32), wasi::fd_fdstat_get),
    ("fd_prestat_get", signature!((i32, i32) -> i32), wasi::fd_prestat_get),
    ("fd_prestat_dir_name", signature!((i32, i32, i32) -> i32), wasi::fd_prestat_dir_name),
    (
        "path_open",
        signature!((i32, i32, i32, i32, i32, i64, i64, i32, i32) -> i32),
        wasi::path_open,
    ),
    ("environ_get", signature!((i32, i32) -> i32), wasi::environ_get),
    ("environ_sizes_get", signature!((i32, i32) -> i32), wasi::environ_sizes_get),
    ("args_get", signature!((i32, i32) -> i32), wasi::args_get),
    ("args_sizes_get", signature!((i32, i32) -> i32), wasi::args_sizes_get),
    ("clock_time_get", signature!((i32, i64, i32) -> i32), wasi::clock_time_get),
    ("random_get", signature!((i32, i32) -> i32), wasi::random_get),
    ("poll_oneoff", signature!((i32, i32, i32, i32) -> i32), wasi::poll_oneoff),
    ("sched_yield", signature!(() -> i32), wasi::sched_yield),
    ("proc_exit", signature!((i32)), wasi::proc_exit),
];

static CALLBACKS: LazyLock<Vec<HostCallback>> = LazyLock::new(|| {
    let proxy = PROXY
        .iter()
        .map(|&(name, signature, function)| HostCallback::new("env", name, signature, function));
    let wasi = WASI_MODULES.iter().flat_map(|&module| {
        WASI.iter()
            .map(move |&(name, signature, function)| HostCallback::new(module, name, signature, function))
    });
    proxy.chain(wasi).collect()
});

/// Every host function this crate implements, ready for
/// [`WasmBaseBuilder::host_callbacks`](proxy_wasm_core::WasmBaseBuilder::host_callbacks).
pub fn host_callbacks() -> &'static [HostCallback] {
    &CALLBACKS
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_table_has_no_duplicates() {
        let mut seen = HashSet::new();
        for callback in host_callbacks() {
            assert!(
                seen.insert((callback.module, callback.name)),
                "duplicate {}.{}",
                callback.module,
                callback.name
            );
        }
        assert_eq!(host_callbacks().len(), PROXY.len() + 2 * WASI.len());
    }

    #[test]
    fn test_wasi_registered_under_both_modules() {
        for module in WASI_MODULES {
            assert!(
                host_callbacks()
                    .iter()
                    .any(|callback| callback.module == module && callback.name == "fd_write")
            );
        }
    }

    #[test]
    fn test_proc_exit_has_no_result() {
        let proc_exit = host_callbacks()
            .iter()
            .find(|callback| callback.name == "proc_exit")
            .unwrap();
        assert_eq!(proc_exit.signature.result, None);
    }
}
