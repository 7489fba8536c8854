//! `env.proxy_*` host functions.
//!
//! Every function resolves the context it acts on through the thread-local
//! attribution set up by the VM, reads its arguments out of guest memory and
//! returns a [`WasmResult`] to the guest. Malformed arguments never trap:
//! they become `BadArgument` or `InvalidMemoryAccess`.
//!
//! # Memory Protocol
//!
//! Values returned to the guest are copied into memory allocated through the
//! guest's own `malloc`; the guest receives the pointer and size through two
//! out-parameters and owns the allocation afterwards.

use std::sync::Arc;
use std::time::Duration;

use proxy_wasm_common::{BufferType, HeaderMapType, MetricType, StreamType, WasmResult};
use proxy_wasm_core::foreign::get_foreign_function;
use proxy_wasm_core::pairs::{decode_pairs, encode_pairs};
use proxy_wasm_core::{
    ContextBase, Guest, GrpcCallRequest, GrpcStreamRequest, HttpCallRequest, LocalResponse,
    SharedData, SharedQueue, Word, current,
};

use tracing::debug;

use crate::logging::{GuestLog, level_from_u32};
use crate::memory::{
    HostResult, active, check, copy_out, expect_args, read_bytes, read_string, run, write_u32,
    write_u64,
};

fn header_map_type(raw: Word) -> Result<HeaderMapType, WasmResult> {
    HeaderMapType::try_from(raw.u64()).map_err(|_| WasmResult::BadArgument)
}

fn buffer_type(raw: Word) -> Result<BufferType, WasmResult> {
    BufferType::try_from(raw.u64()).map_err(|_| WasmResult::BadArgument)
}

fn stream_type(raw: Word) -> Result<StreamType, WasmResult> {
    StreamType::try_from(raw.u64()).map_err(|_| WasmResult::BadArgument)
}

fn root_of(context: &Arc<ContextBase>) -> Result<Arc<ContextBase>, WasmResult> {
    context.root_context().ok_or(WasmResult::NotFound)
}

#[allow(clippy::cast_possible_truncation)]
fn to_usize(word: Word) -> usize {
    word.u64() as usize
}

// ---- logging, time, status ----

pub fn proxy_log(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [level, message, size] = expect_args("proxy_log", args)?;
    let (_, context) = active("proxy_log")?;
    run(|| {
        let message = read_string(guest, message, size)?;
        check(GuestLog::log(&context, level_from_u32(level.u32()), &message))
    })
}

pub fn proxy_get_log_level(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [level_ptr] = expect_args("proxy_get_log_level", args)?;
    let (_, context) = active("proxy_get_log_level")?;
    run(|| write_u32(guest, level_ptr, context.handler().log_level().as_u32()))
}

pub fn proxy_get_current_time_nanoseconds(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [time_ptr] = expect_args("proxy_get_current_time_nanoseconds", args)?;
    let (_, context) = active("proxy_get_current_time_nanoseconds")?;
    run(|| write_u64(guest, time_ptr, context.handler().current_time_nanoseconds()))
}

pub fn proxy_get_status(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [code_ptr, message_ptr, message_size_ptr] = expect_args("proxy_get_status", args)?;
    let (wasm, context) = active("proxy_get_status")?;
    run(|| {
        let (code, message) = context.handler().get_status()?;
        write_u32(guest, code_ptr, code)?;
        copy_out(&wasm, guest, &message, message_ptr, message_size_ptr)
    })
}

// ---- context control ----

pub fn proxy_set_effective_context(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [context_id] = expect_args("proxy_set_effective_context", args)?;
    let (wasm, _) = active("proxy_set_effective_context")?;
    run(|| {
        let context_id = context_id.u32();
        wasm.get_context(context_id).ok_or(WasmResult::BadArgument)?;
        current::set_effective_context(context_id);
        Ok(())
    })
}

pub fn proxy_done(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [] = expect_args("proxy_done", args)?;
    let (wasm, context) = active("proxy_done")?;
    run(|| {
        let root: Arc<ContextBase> = root_of(&context)?;
        check(wasm.done(&root))
    })
}

pub fn proxy_call_foreign_function(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [name, name_size, arguments, arguments_size, results_ptr, results_size_ptr] =
        expect_args("proxy_call_foreign_function", args)?;
    let (wasm, _) = active("proxy_call_foreign_function")?;
    run(|| {
        let name = read_string(guest, name, name_size)?;
        let arguments = read_bytes(guest, arguments, arguments_size)?;
        let function = get_foreign_function(&name).ok_or(WasmResult::NotFound)?;
        let results = function(wasm.as_ref(), arguments.as_slice())?;
        copy_out(&wasm, guest, &results, results_ptr, results_size_ptr)
    })
}

// ---- properties ----

pub fn proxy_get_property(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [path, path_size, value_ptr, value_size_ptr] = expect_args("proxy_get_property", args)?;
    let (wasm, context) = active("proxy_get_property")?;
    run(|| {
        let path = read_bytes(guest, path, path_size)?;
        let value = context.handler().get_property(&path)?;
        copy_out(&wasm, guest, &value, value_ptr, value_size_ptr)
    })
}

pub fn proxy_set_property(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [path, path_size, value, value_size] = expect_args("proxy_set_property", args)?;
    let (_, context) = active("proxy_set_property")?;
    run(|| {
        let path = read_bytes(guest, path, path_size)?;
        let value = read_bytes(guest, value, value_size)?;
        check(context.handler().set_property(&path, &value))
    })
}

// ---- stream control ----

pub fn proxy_continue_stream(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [stream] = expect_args("proxy_continue_stream", args)?;
    let (_, context) = active("proxy_continue_stream")?;
    run(|| check(context.handler().continue_stream(stream_type(stream)?)))
}

pub fn proxy_close_stream(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [stream] = expect_args("proxy_close_stream", args)?;
    let (_, context) = active("proxy_close_stream")?;
    run(|| check(context.handler().close_stream(stream_type(stream)?)))
}

pub fn proxy_continue_request(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [] = expect_args("proxy_continue_request", args)?;
    let (_, context) = active("proxy_continue_request")?;
    run(|| check(context.handler().continue_stream(StreamType::Request)))
}

pub fn proxy_continue_response(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [] = expect_args("proxy_continue_response", args)?;
    let (_, context) = active("proxy_continue_response")?;
    run(|| check(context.handler().continue_stream(StreamType::Response)))
}

/// Also stops iteration of the stream callback currently executing.
pub fn proxy_send_local_response(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [
        status_code,
        details,
        details_size,
        body,
        body_size,
        headers,
        headers_size,
        grpc_status,
    ] = expect_args("proxy_send_local_response", args)?;
    let (wasm, context) = active("proxy_send_local_response")?;
    run(|| {
        let response = LocalResponse {
            status_code: status_code.u32(),
            details: read_string(guest, details, details_size)?,
            body: read_bytes(guest, body, body_size)?,
            headers: decode_pairs(&read_bytes(guest, headers, headers_size)?)?,
            grpc_status: grpc_status.u32(),
        };
        let status = context.handler().send_local_response(response);
        wasm.request_stop_iteration();
        check(status)
    })
}

/// Applied after the current guest call returns.
pub fn proxy_clear_route_cache(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [] = expect_args("proxy_clear_route_cache", args)?;
    let (wasm, context) = active("proxy_clear_route_cache")?;
    let handler = Arc::clone(context.handler());
    wasm.add_after_vm_call_action(Box::new(move || {
        let status = handler.clear_route_cache();
        if status != WasmResult::Ok {
            debug!(?status, "route cache not cleared");
        }
    }));
    Ok(Word::from(WasmResult::Ok))
}

// ---- shared data ----

pub fn proxy_get_shared_data(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [key, key_size, value_ptr, value_size_ptr, cas_ptr] =
        expect_args("proxy_get_shared_data", args)?;
    let (wasm, _) = active("proxy_get_shared_data")?;
    run(|| {
        let key = read_string(guest, key, key_size)?;
        let (value, cas) = SharedData::global().get(wasm.vm_id(), &key)?;
        copy_out(&wasm, guest, &value, value_ptr, value_size_ptr)?;
        write_u32(guest, cas_ptr, cas)
    })
}

pub fn proxy_set_shared_data(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [key, key_size, value, value_size, cas] = expect_args("proxy_set_shared_data", args)?;
    let (wasm, _) = active("proxy_set_shared_data")?;
    run(|| {
        let key = read_string(guest, key, key_size)?;
        let value = read_bytes(guest, value, value_size)?;
        SharedData::global().set(wasm.vm_id(), &key, &value, cas.u32())
    })
}

/// Keys are returned in the header map format, each with an empty value.
pub fn proxy_get_shared_data_keys(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [keys_ptr, keys_size_ptr] = expect_args("proxy_get_shared_data_keys", args)?;
    let (wasm, _) = active("proxy_get_shared_data_keys")?;
    run(|| {
        let keys: Vec<(String, String)> = SharedData::global()
            .keys(wasm.vm_id())
            .into_iter()
            .map(|key| (key, String::new()))
            .collect();
        copy_out(&wasm, guest, &encode_pairs(&keys), keys_ptr, keys_size_ptr)
    })
}

pub fn proxy_remove_shared_data(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [key, key_size, cas] = expect_args("proxy_remove_shared_data", args)?;
    let (wasm, _) = active("proxy_remove_shared_data")?;
    run(|| {
        let key = read_string(guest, key, key_size)?;
        SharedData::global()
            .remove(wasm.vm_id(), &key, cas.u32())
            .map(|_| ())
    })
}

// ---- shared queues ----

/// Queues are owned by the root context, which receives `proxy_on_queue_ready`.
pub fn proxy_register_shared_queue(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [name, name_size, token_ptr] = expect_args("proxy_register_shared_queue", args)?;
    let (wasm, context) = active("proxy_register_shared_queue")?;
    run(|| {
        let name = read_string(guest, name, name_size)?;
        let root = root_of(&context)?;
        let token = SharedQueue::global().register(
            wasm.vm_id(),
            &name,
            root.id(),
            Arc::clone(wasm.call_on_thread()),
            wasm.vm_key(),
        );
        write_u32(guest, token_ptr, token)
    })
}

pub fn proxy_resolve_shared_queue(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [vm_id, vm_id_size, name, name_size, token_ptr] =
        expect_args("proxy_resolve_shared_queue", args)?;
    let (wasm, _) = active("proxy_resolve_shared_queue")?;
    run(|| {
        let vm_id = read_string(guest, vm_id, vm_id_size)?;
        let vm_id = if vm_id.is_empty() { wasm.vm_id().to_string() } else { vm_id };
        let name = read_string(guest, name, name_size)?;
        let token = SharedQueue::global()
            .resolve(&vm_id, &name)
            .ok_or(WasmResult::NotFound)?;
        write_u32(guest, token_ptr, token)
    })
}

pub fn proxy_dequeue_shared_queue(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [token, value_ptr, value_size_ptr] = expect_args("proxy_dequeue_shared_queue", args)?;
    let (wasm, _) = active("proxy_dequeue_shared_queue")?;
    run(|| {
        let value = SharedQueue::global().dequeue(token.u32())?;
        copy_out(&wasm, guest, &value, value_ptr, value_size_ptr)
    })
}

pub fn proxy_enqueue_shared_queue(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [token, value, value_size] = expect_args("proxy_enqueue_shared_queue", args)?;
    active("proxy_enqueue_shared_queue")?;
    run(|| {
        let value = read_bytes(guest, value, value_size)?;
        SharedQueue::global().enqueue(token.u32(), &value)
    })
}

// ---- header maps ----

pub fn proxy_get_header_map_value(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [map, key, key_size, value_ptr, value_size_ptr] =
        expect_args("proxy_get_header_map_value", args)?;
    let (wasm, context) = active("proxy_get_header_map_value")?;
    run(|| {
        let map = header_map_type(map)?;
        let key = read_string(guest, key, key_size)?;
        let value = context.handler().get_header_map_value(map, &key)?;
        copy_out(&wasm, guest, value.as_bytes(), value_ptr, value_size_ptr)
    })
}

pub fn proxy_add_header_map_value(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [map, key, key_size, value, value_size] = expect_args("proxy_add_header_map_value", args)?;
    let (_, context) = active("proxy_add_header_map_value")?;
    run(|| {
        let map = header_map_type(map)?;
        let key = read_string(guest, key, key_size)?;
        let value = read_string(guest, value, value_size)?;
        check(context.handler().add_header_map_value(map, &key, &value))
    })
}

pub fn proxy_replace_header_map_value(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [map, key, key_size, value, value_size] =
        expect_args("proxy_replace_header_map_value", args)?;
    let (_, context) = active("proxy_replace_header_map_value")?;
    run(|| {
        let map = header_map_type(map)?;
        let key = read_string(guest, key, key_size)?;
        let value = read_string(guest, value, value_size)?;
        check(context.handler().replace_header_map_value(map, &key, &value))
    })
}

pub fn proxy_remove_header_map_value(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [map, key, key_size] = expect_args("proxy_remove_header_map_value", args)?;
    let (_, context) = active("proxy_remove_header_map_value")?;
    run(|| {
        let map = header_map_type(map)?;
        let key = read_string(guest, key, key_size)?;
        check(context.handler().remove_header_map_value(map, &key))
    })
}

pub fn proxy_get_header_map_pairs(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [map, pairs_ptr, pairs_size_ptr] = expect_args("proxy_get_header_map_pairs", args)?;
    let (wasm, context) = active("proxy_get_header_map_pairs")?;
    run(|| {
        let pairs = context.handler().get_header_map_pairs(header_map_type(map)?)?;
        copy_out(&wasm, guest, &encode_pairs(&pairs), pairs_ptr, pairs_size_ptr)
    })
}

pub fn proxy_set_header_map_pairs(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [map, pairs, pairs_size] = expect_args("proxy_set_header_map_pairs", args)?;
    let (_, context) = active("proxy_set_header_map_pairs")?;
    run(|| {
        let map = header_map_type(map)?;
        let pairs = decode_pairs(&read_bytes(guest, pairs, pairs_size)?)?;
        check(context.handler().set_header_map_pairs(map, pairs))
    })
}

pub fn proxy_get_header_map_size(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [map, size_ptr] = expect_args("proxy_get_header_map_size", args)?;
    let (_, context) = active("proxy_get_header_map_size")?;
    run(|| {
        let size = context.handler().get_header_map_size(header_map_type(map)?)?;
        write_u32(guest, size_ptr, size)
    })
}

// ---- buffers ----

pub fn proxy_get_buffer_status(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [buffer, size_ptr, flags_ptr] = expect_args("proxy_get_buffer_status", args)?;
    let (_, context) = active("proxy_get_buffer_status")?;
    run(|| {
        let size = context.buffer_size(buffer_type(buffer)?)?;
        write_u32(guest, size_ptr, u32::try_from(size).unwrap_or(u32::MAX))?;
        write_u32(guest, flags_ptr, 0)
    })
}

/// `max_size` is clamped to the bytes available after `start`.
pub fn proxy_get_buffer_bytes(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [buffer, start, max_size, data_ptr, size_ptr] = expect_args("proxy_get_buffer_bytes", args)?;
    let (wasm, context) = active("proxy_get_buffer_bytes")?;
    run(|| {
        let bytes = context.buffer_bytes(buffer_type(buffer)?, to_usize(start), to_usize(max_size))?;
        copy_out(&wasm, guest, &bytes, data_ptr, size_ptr)
    })
}

pub fn proxy_set_buffer_bytes(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [buffer, start, length, data, data_size] = expect_args("proxy_set_buffer_bytes", args)?;
    let (_, context) = active("proxy_set_buffer_bytes")?;
    run(|| {
        let buffer = buffer_type(buffer)?;
        let data = read_bytes(guest, data, data_size)?;
        check(
            context
                .handler()
                .set_buffer_bytes(buffer, to_usize(start), to_usize(length), &data),
        )
    })
}

/// ABI 0.1.0: the plugin configuration as a buffer.
pub fn proxy_get_configuration(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [data_ptr, size_ptr] = expect_args("proxy_get_configuration", args)?;
    let (wasm, context) = active("proxy_get_configuration")?;
    run(|| {
        let configuration = context.plugin_configuration().ok_or(WasmResult::NotFound)?;
        copy_out(&wasm, guest, configuration.as_bytes(), data_ptr, size_ptr)
    })
}

// ---- outbound calls ----

pub fn proxy_http_call(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [
        upstream,
        upstream_size,
        headers,
        headers_size,
        body,
        body_size,
        trailers,
        trailers_size,
        timeout_ms,
        token_ptr,
    ] = expect_args("proxy_http_call", args)?;
    let (_, context) = active("proxy_http_call")?;
    run(|| {
        let request = HttpCallRequest {
            upstream: read_string(guest, upstream, upstream_size)?,
            headers: decode_pairs(&read_bytes(guest, headers, headers_size)?)?,
            body: read_bytes(guest, body, body_size)?,
            trailers: decode_pairs(&read_bytes(guest, trailers, trailers_size)?)?,
            timeout: Duration::from_millis(u64::from(timeout_ms.u32())),
        };
        let token = root_of(&context)?.handler().http_call(request)?;
        write_u32(guest, token_ptr, token)
    })
}

pub fn proxy_grpc_call(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [
        service,
        service_size,
        service_name,
        service_name_size,
        method_name,
        method_name_size,
        metadata,
        metadata_size,
        message,
        message_size,
        timeout_ms,
        token_ptr,
    ] = expect_args("proxy_grpc_call", args)?;
    let (_, context) = active("proxy_grpc_call")?;
    run(|| {
        let request = GrpcCallRequest {
            service: read_bytes(guest, service, service_size)?,
            service_name: read_string(guest, service_name, service_name_size)?,
            method_name: read_string(guest, method_name, method_name_size)?,
            initial_metadata: decode_pairs(&read_bytes(guest, metadata, metadata_size)?)?,
            message: read_bytes(guest, message, message_size)?,
            timeout: Duration::from_millis(u64::from(timeout_ms.u32())),
        };
        let token = root_of(&context)?.handler().grpc_call(request)?;
        write_u32(guest, token_ptr, token)
    })
}

pub fn proxy_grpc_stream(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [
        service,
        service_size,
        service_name,
        service_name_size,
        method_name,
        method_name_size,
        metadata,
        metadata_size,
        token_ptr,
    ] = expect_args("proxy_grpc_stream", args)?;
    let (_, context) = active("proxy_grpc_stream")?;
    run(|| {
        let request = GrpcStreamRequest {
            service: read_bytes(guest, service, service_size)?,
            service_name: read_string(guest, service_name, service_name_size)?,
            method_name: read_string(guest, method_name, method_name_size)?,
            initial_metadata: decode_pairs(&read_bytes(guest, metadata, metadata_size)?)?,
        };
        let token = root_of(&context)?.handler().grpc_stream(request)?;
        write_u32(guest, token_ptr, token)
    })
}

pub fn proxy_grpc_send(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [token, message, message_size, end_stream] = expect_args("proxy_grpc_send", args)?;
    let (_, context) = active("proxy_grpc_send")?;
    run(|| {
        let message = read_bytes(guest, message, message_size)?;
        let root = root_of(&context)?;
        check(root.handler().grpc_send(token.u32(), &message, end_stream.is_true()))
    })
}

pub fn proxy_grpc_cancel(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [token] = expect_args("proxy_grpc_cancel", args)?;
    let (_, context) = active("proxy_grpc_cancel")?;
    run(|| check(root_of(&context)?.handler().grpc_cancel(token.u32())))
}

pub fn proxy_grpc_close(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [token] = expect_args("proxy_grpc_close", args)?;
    let (_, context) = active("proxy_grpc_close")?;
    run(|| check(root_of(&context)?.handler().grpc_close(token.u32())))
}

// ---- timers and metrics ----

pub fn proxy_set_tick_period_milliseconds(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [period_ms] = expect_args("proxy_set_tick_period_milliseconds", args)?;
    let (_, context) = active("proxy_set_tick_period_milliseconds")?;
    run(|| {
        let period = Duration::from_millis(u64::from(period_ms.u32()));
        check(root_of(&context)?.handler().set_tick_period(period))
    })
}

pub fn proxy_define_metric(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [metric_type, name, name_size, id_ptr] = expect_args("proxy_define_metric", args)?;
    let (_, context) = active("proxy_define_metric")?;
    run(|| {
        let metric_type = MetricType::try_from(metric_type.u64()).map_err(|_| WasmResult::BadArgument)?;
        let name = read_string(guest, name, name_size)?;
        let id = context.handler().define_metric(metric_type, &name)?;
        write_u32(guest, id_ptr, id)
    })
}

#[allow(clippy::cast_possible_wrap)]
pub fn proxy_increment_metric(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [metric_id, offset] = expect_args("proxy_increment_metric", args)?;
    let (_, context) = active("proxy_increment_metric")?;
    run(|| check(context.handler().increment_metric(metric_id.u32(), offset.u64() as i64)))
}

pub fn proxy_record_metric(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [metric_id, value] = expect_args("proxy_record_metric", args)?;
    let (_, context) = active("proxy_record_metric")?;
    run(|| check(context.handler().record_metric(metric_id.u32(), value.u64())))
}

pub fn proxy_get_metric(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [metric_id, value_ptr] = expect_args("proxy_get_metric", args)?;
    let (_, context) = active("proxy_get_metric")?;
    run(|| {
        let value = context.handler().get_metric(metric_id.u32())?;
        write_u64(guest, value_ptr, value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_arguments_out_of_range() {
        assert_eq!(header_map_type(Word(7)), Ok(HeaderMapType::HttpCallResponseTrailers));
        assert_eq!(header_map_type(Word(8)), Err(WasmResult::BadArgument));
        assert_eq!(buffer_type(Word(8)), Ok(BufferType::CallData));
        assert_eq!(buffer_type(Word(9)), Err(WasmResult::BadArgument));
        assert_eq!(stream_type(Word(4)), Err(WasmResult::BadArgument));
    }
}
