//! Embedder hooks behind each context.
//!
//! Host functions that touch the outside world (headers, bodies, outbound
//! calls, metrics, properties) are answered by the [`ContextHandler`] of the
//! context the call is attributed to. Every method has a default, mostly
//! [`WasmResult::Unimplemented`], so an embedder implements only what its
//! proxy supports.

use std::sync::LazyLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use proxy_wasm_common::{BufferType, HeaderMapType, LogLevel, MetricType, StreamType, WasmResult};
use tracing::level_filters::LevelFilter;

use crate::pairs::Pairs;

static PROCESS_START: LazyLock<Instant> = LazyLock::new(Instant::now);

/// A local response requested by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResponse {
    pub status_code: u32,
    pub body: Vec<u8>,
    pub headers: Pairs,
    /// gRPC status, or `u32::MAX` when not a gRPC response.
    pub grpc_status: u32,
    pub details: String,
}

/// An outbound HTTP call requested by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCallRequest {
    /// Upstream (cluster) name.
    pub upstream: String,
    pub headers: Pairs,
    pub body: Vec<u8>,
    pub trailers: Pairs,
    pub timeout: Duration,
}

/// An outbound unary gRPC call requested by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcCallRequest {
    /// Serialized service (cluster) description.
    pub service: Vec<u8>,
    pub service_name: String,
    pub method_name: String,
    pub initial_metadata: Pairs,
    pub message: Vec<u8>,
    pub timeout: Duration,
}

/// An outbound streaming gRPC call requested by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcStreamRequest {
    pub service: Vec<u8>,
    pub service_name: String,
    pub method_name: String,
    pub initial_metadata: Pairs,
}

/// Embedder integration for one context.
///
/// Implementations must be cheap to call and must not call back into the
/// VM that invoked them.
#[allow(unused_variables)]
pub trait ContextHandler: Send + Sync {
    /// A guest log line (already emitted through `tracing`).
    fn log(&self, level: LogLevel, message: &str) -> WasmResult {
        WasmResult::Ok
    }

    /// Minimum level the guest should bother logging at.
    fn log_level(&self) -> LogLevel {
        LogLevel::from_level_filter(LevelFilter::current())
    }

    /// Wall clock time in nanoseconds since the Unix epoch.
    fn current_time_nanoseconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Monotonic time in nanoseconds.
    fn monotonic_time_nanoseconds(&self) -> u64 {
        u64::try_from(PROCESS_START.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Status of the last gRPC or HTTP callback, as `(code, message)`.
    fn get_status(&self) -> Result<(u32, Vec<u8>), WasmResult> {
        Err(WasmResult::Unimplemented)
    }

    /// Property lookup; `path` segments are separated by `\0`.
    fn get_property(&self, path: &[u8]) -> Result<Vec<u8>, WasmResult> {
        Err(WasmResult::Unimplemented)
    }

    fn set_property(&self, path: &[u8], value: &[u8]) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn send_local_response(&self, response: LocalResponse) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn continue_stream(&self, stream: StreamType) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn close_stream(&self, stream: StreamType) -> WasmResult {
        WasmResult::Unimplemented
    }

    /// Abort a stream half because the VM failed and the plugin is fail-closed.
    fn fail_stream(&self, stream: StreamType) {
        let _ = self.close_stream(stream);
    }

    /// Runs after the guest call that requested it has returned.
    fn clear_route_cache(&self) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn get_header_map_value(&self, map: HeaderMapType, key: &str) -> Result<String, WasmResult> {
        Err(WasmResult::Unimplemented)
    }

    fn add_header_map_value(&self, map: HeaderMapType, key: &str, value: &str) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn replace_header_map_value(&self, map: HeaderMapType, key: &str, value: &str) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn remove_header_map_value(&self, map: HeaderMapType, key: &str) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn get_header_map_pairs(&self, map: HeaderMapType) -> Result<Pairs, WasmResult> {
        Err(WasmResult::Unimplemented)
    }

    fn set_header_map_pairs(&self, map: HeaderMapType, pairs: Pairs) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn get_header_map_size(&self, map: HeaderMapType) -> Result<u32, WasmResult> {
        Err(WasmResult::Unimplemented)
    }

    /// Size of a buffer; `NotFound` when the buffer does not exist.
    fn get_buffer_size(&self, buffer: BufferType) -> Result<usize, WasmResult> {
        Err(WasmResult::NotFound)
    }

    /// Bytes `start..start + length` of a buffer, already clamped to its size.
    fn get_buffer_bytes(
        &self,
        buffer: BufferType,
        start: usize,
        length: usize,
    ) -> Result<Vec<u8>, WasmResult> {
        Err(WasmResult::NotFound)
    }

    /// Replace bytes `start..start + length` of a buffer with `data`.
    fn set_buffer_bytes(
        &self,
        buffer: BufferType,
        start: usize,
        length: usize,
        data: &[u8],
    ) -> WasmResult {
        WasmResult::NotFound
    }

    /// Start an HTTP call and return its token.
    fn http_call(&self, request: HttpCallRequest) -> Result<u32, WasmResult> {
        Err(WasmResult::Unimplemented)
    }

    fn grpc_call(&self, request: GrpcCallRequest) -> Result<u32, WasmResult> {
        Err(WasmResult::Unimplemented)
    }

    fn grpc_stream(&self, request: GrpcStreamRequest) -> Result<u32, WasmResult> {
        Err(WasmResult::Unimplemented)
    }

    fn grpc_send(&self, token: u32, message: &[u8], end_stream: bool) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn grpc_cancel(&self, token: u32) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn grpc_close(&self, token: u32) -> WasmResult {
        WasmResult::Unimplemented
    }

    /// Schedule `proxy_on_tick`; a zero period disables the timer.
    fn set_tick_period(&self, period: Duration) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn define_metric(&self, metric_type: MetricType, name: &str) -> Result<u32, WasmResult> {
        Err(WasmResult::Unimplemented)
    }

    fn increment_metric(&self, metric_id: u32, offset: i64) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn record_metric(&self, metric_id: u32, value: u64) -> WasmResult {
        WasmResult::Unimplemented
    }

    fn get_metric(&self, metric_id: u32) -> Result<u64, WasmResult> {
        Err(WasmResult::Unimplemented)
    }
}

/// Handler with every default: logs go to `tracing` only, everything
/// proxy-specific is unimplemented.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultContextHandler;

impl ContextHandler for DefaultContextHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let handler = DefaultContextHandler;
        assert_eq!(handler.log(LogLevel::Info, "x"), WasmResult::Ok);
        assert_eq!(handler.get_property(b"plugin_name"), Err(WasmResult::Unimplemented));
        assert_eq!(
            handler.get_buffer_size(BufferType::HttpRequestBody),
            Err(WasmResult::NotFound)
        );
        assert!(handler.current_time_nanoseconds() > 0);
    }

    #[test]
    fn test_monotonic_time_advances() {
        let handler = DefaultContextHandler;
        let first = handler.monotonic_time_nanoseconds();
        std::thread::sleep(Duration::from_millis(1));
        assert!(handler.monotonic_time_nanoseconds() > first);
    }
}
