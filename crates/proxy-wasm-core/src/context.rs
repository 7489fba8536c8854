//! Contexts: the VM context, root contexts and stream contexts.
//!
//! Every entry point into the guest goes through a [`ContextBase`]. The
//! context checks the VM's sticky fail state, calls the hook if the guest
//! exports it, and turns the raw return value into a filter status.
//!
//! Contexts never own their VM: they hold a weak reference and an id, and
//! parents are found by chasing ids through the VM's context table.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use proxy_wasm_common::{
    BufferType, CloseType, FilterDataStatus, FilterHeadersStatus, FilterMetadataStatus,
    FilterStatus, FilterTrailersStatus, GrpcStatus, StreamType, WasmResult,
};
use tracing::{debug, warn};

use crate::exports::GuestExports;
use crate::handle::PluginHandle;
use crate::handler::ContextHandler;
use crate::plugin::PluginBase;
use crate::vm::GuestFunction;
use crate::wasm::WasmBase;
use crate::word::Word;

/// What a context stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// The per-VM context, id 0. Bootstrap and `malloc` run on it.
    Vm,
    /// One per plugin; owns the plugin configuration.
    Root,
    /// One per HTTP stream or network connection.
    Stream,
}

#[derive(Default)]
struct ContextState {
    created_in_vm: bool,
    deleted: bool,
    stream_failed: bool,
    temp_plugin: Option<Arc<PluginBase>>,
}

/// Result of calling a stream hook, before conversion to a status.
enum HookOutcome {
    Failed,
    Missing,
    Returned { raw: u64, stop: bool },
}

const HTTP_HALVES: [StreamType; 2] = [StreamType::Request, StreamType::Response];
const NETWORK_HALVES: [StreamType; 2] = [StreamType::Downstream, StreamType::Upstream];

pub struct ContextBase {
    wasm: Weak<WasmBase>,
    id: u32,
    parent_id: u32,
    kind: ContextKind,
    plugin: Option<Arc<PluginBase>>,
    plugin_handle: Option<Arc<PluginHandle>>,
    handler: Arc<dyn ContextHandler>,
    state: Mutex<ContextState>,
}

impl ContextBase {
    pub(crate) fn new(
        wasm: Weak<WasmBase>,
        id: u32,
        parent_id: u32,
        kind: ContextKind,
        plugin: Option<Arc<PluginBase>>,
        plugin_handle: Option<Arc<PluginHandle>>,
        handler: Arc<dyn ContextHandler>,
    ) -> Self {
        Self {
            wasm,
            id,
            parent_id,
            kind,
            plugin,
            plugin_handle,
            handler,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Id of the root context, 0 for roots and the VM context.
    pub fn parent_id(&self) -> u32 {
        self.parent_id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn is_root_context(&self) -> bool {
        self.kind == ContextKind::Root
    }

    /// The VM this context belongs to, if it is still alive.
    pub fn wasm(&self) -> Option<Arc<WasmBase>> {
        self.wasm.upgrade()
    }

    /// The plugin of a root or stream context.
    pub fn plugin(&self) -> Option<&Arc<PluginBase>> {
        self.plugin.as_ref()
    }

    /// The plugin handle a stream context keeps alive, if any.
    pub fn plugin_handle(&self) -> Option<&Arc<PluginHandle>> {
        self.plugin_handle.as_ref()
    }

    pub fn handler(&self) -> &Arc<dyn ContextHandler> {
        &self.handler
    }

    /// The root context a stream belongs to; roots and the VM context return
    /// themselves.
    pub fn root_context(self: &Arc<Self>) -> Option<Arc<ContextBase>> {
        let mut context = Arc::clone(self);
        while context.kind == ContextKind::Stream {
            context = self.wasm()?.get_context(context.parent_id)?;
        }
        Some(context)
    }

    /// Whether the VM has failed (or is gone).
    pub fn is_failed(&self) -> bool {
        self.wasm().is_none_or(|wasm| wasm.is_failed())
    }

    pub fn log_prefix(&self) -> &str {
        self.plugin.as_ref().map_or("", |plugin| plugin.log_prefix())
    }

    /// Whether the guest was told about this context.
    pub fn is_created_in_vm(&self) -> bool {
        self.state.lock().created_in_vm
    }

    /// Size of a buffer visible to the guest.
    ///
    /// VM and plugin configuration are answered here; everything else by the
    /// handler.
    pub fn buffer_size(&self, buffer: BufferType) -> Result<usize, WasmResult> {
        match self.configuration_buffer(buffer) {
            Some(bytes) => Ok(bytes?.len()),
            None => self.handler.get_buffer_size(buffer),
        }
    }

    /// Bytes of a buffer, with `length` clamped to what is available.
    pub fn buffer_bytes(
        &self,
        buffer: BufferType,
        start: usize,
        length: usize,
    ) -> Result<Vec<u8>, WasmResult> {
        start.checked_add(length).ok_or(WasmResult::BadArgument)?;
        if let Some(bytes) = self.configuration_buffer(buffer) {
            let bytes = bytes?;
            let slice = bytes.get(start..).ok_or(WasmResult::BadArgument)?;
            return Ok(slice[..length.min(slice.len())].to_vec());
        }
        let size = self.handler.get_buffer_size(buffer)?;
        if start > size {
            return Err(WasmResult::BadArgument);
        }
        let length = length.min(size - start);
        if length == 0 {
            return Ok(Vec::new());
        }
        self.handler.get_buffer_bytes(buffer, start, length)
    }

    fn configuration_buffer(&self, buffer: BufferType) -> Option<Result<Vec<u8>, WasmResult>> {
        match buffer {
            BufferType::VmConfiguration => Some(
                self.wasm()
                    .map(|wasm| wasm.vm_configuration().as_bytes().to_vec())
                    .ok_or(WasmResult::NotFound),
            ),
            BufferType::PluginConfiguration => Some(
                self.plugin_configuration()
                    .map(String::into_bytes)
                    .ok_or(WasmResult::NotFound),
            ),
            _ => None,
        }
    }

    /// Plugin configuration being delivered, or the plugin's own.
    pub fn plugin_configuration(&self) -> Option<String> {
        if let Some(plugin) = &self.state.lock().temp_plugin {
            return Some(plugin.plugin_configuration().to_string());
        }
        self.plugin
            .as_ref()
            .map(|plugin| plugin.plugin_configuration().to_string())
    }

    // ---- calls into the guest ----

    fn call(
        self: &Arc<Self>,
        wasm: &Arc<WasmBase>,
        function: &GuestFunction,
        args: &[Word],
    ) -> Option<Word> {
        wasm.call_guest(self, function, args).ok().flatten()
    }

    /// Call a hook that returns nothing, skipping it when the VM has failed.
    fn notify(
        self: &Arc<Self>,
        select: fn(&GuestExports) -> Option<&GuestFunction>,
        args: &[Word],
    ) {
        let Some(wasm) = self.wasm() else {
            return;
        };
        if wasm.is_failed() {
            return;
        }
        let exports = wasm.exports();
        if let Some(function) = select(&exports) {
            self.call(&wasm, function, args);
        }
    }

    fn invoke_stream_hook(
        self: &Arc<Self>,
        select: fn(&GuestExports) -> Option<&GuestFunction>,
        args: &[Word],
    ) -> HookOutcome {
        let Some(wasm) = self.wasm() else {
            return HookOutcome::Failed;
        };
        if wasm.is_failed() {
            return HookOutcome::Failed;
        }
        let exports = wasm.exports();
        let Some(function) = select(&exports) else {
            return HookOutcome::Missing;
        };
        let result = wasm.call_guest(self, function, args);
        let stop = wasm.take_stop_iteration();
        if wasm.is_failed() {
            return HookOutcome::Failed;
        }
        match result {
            Ok(value) => HookOutcome::Returned {
                raw: value.map_or(0, Word::u64),
                stop,
            },
            Err(e) => {
                warn!(context_id = self.id, plugin = self.log_prefix(), "hook call refused: {e}");
                HookOutcome::Failed
            }
        }
    }

    /// Fail-open returns `open`; fail-closed aborts both halves of the
    /// stream the first time and returns `closed`.
    fn resolve_failure<T>(&self, open: T, closed: T, halves: [StreamType; 2]) -> T {
        if self.plugin.as_ref().is_some_and(|plugin| plugin.fail_open()) {
            return open;
        }
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.stream_failed, true)
        };
        if first {
            warn!(context_id = self.id, plugin = self.log_prefix(), "hook failed, closing stream");
            for half in halves {
                self.handler.fail_stream(half);
            }
        }
        closed
    }

    // ---- lifecycle ----

    /// Tell the guest about this context. Runs at most once.
    pub fn on_create(self: &Arc<Self>) {
        if self.state.lock().created_in_vm {
            return;
        }
        if let Some(wasm) = self.wasm().filter(|wasm| !wasm.is_failed()) {
            let exports = wasm.exports();
            if let Some(function) = &exports.on_context_create {
                self.call(
                    &wasm,
                    function,
                    &[Word::from(self.id), Word::from(self.parent_id)],
                );
            }
        }
        self.state.lock().created_in_vm = true;
    }

    fn with_temp_plugin<T>(&self, plugin: &Arc<PluginBase>, f: impl FnOnce() -> T) -> T {
        self.state.lock().temp_plugin = Some(Arc::clone(plugin));
        let result = f();
        self.state.lock().temp_plugin = None;
        result
    }

    /// Start a root context. Absence of `proxy_on_vm_start` is success.
    pub fn on_start(self: &Arc<Self>, plugin: &Arc<PluginBase>) -> bool {
        let Some(wasm) = self.wasm().filter(|wasm| !wasm.is_failed()) else {
            return false;
        };
        self.with_temp_plugin(plugin, || self.on_create());
        let exports = wasm.exports();
        let Some(function) = &exports.on_vm_start else {
            return true;
        };
        let config_size = wasm.vm_configuration().len();
        let result = self.with_temp_plugin(plugin, || {
            self.call(&wasm, function, &[Word::from(self.id), Word::from(config_size)])
        });
        let started = result.is_some_and(Word::is_true) && !wasm.is_failed();
        if !started {
            warn!(context_id = self.id, plugin = plugin.log_prefix(), "proxy_on_vm_start failed");
        }
        started
    }

    /// Deliver the plugin configuration. Absence of `proxy_on_configure` is
    /// success.
    pub fn on_configure(self: &Arc<Self>, plugin: &Arc<PluginBase>) -> bool {
        let Some(wasm) = self.wasm().filter(|wasm| !wasm.is_failed()) else {
            return false;
        };
        self.with_temp_plugin(plugin, || self.on_create());
        let exports = wasm.exports();
        let Some(function) = &exports.on_configure else {
            return true;
        };
        let config_size = plugin.plugin_configuration().len();
        let result = self.with_temp_plugin(plugin, || {
            self.call(&wasm, function, &[Word::from(self.id), Word::from(config_size)])
        });
        let configured = result.is_some_and(Word::is_true) && !wasm.is_failed();
        if !configured {
            warn!(context_id = self.id, plugin = plugin.log_prefix(), "proxy_on_configure failed");
        }
        configured
    }

    pub fn on_tick(self: &Arc<Self>) {
        self.notify(|e| e.on_tick.as_ref(), &[Word::from(self.id)]);
    }

    /// Deliver a queue notification; deferred while the VM is executing.
    pub fn on_queue_ready(self: &Arc<Self>, token: u32) {
        let Some(wasm) = self.wasm() else {
            return;
        };
        if wasm.in_vm_call() {
            let context = Arc::clone(self);
            wasm.add_after_vm_call_action(Box::new(move || context.on_queue_ready(token)));
            return;
        }
        self.notify(|e| e.on_queue_ready.as_ref(), &[Word::from(self.id), Word::from(token)]);
    }

    /// ABI 0.2.x only.
    pub fn on_foreign_function(self: &Arc<Self>, function_id: u32, data_size: u32) {
        self.notify(
            |e| e.on_foreign_function.as_ref(),
            &[Word::from(self.id), Word::from(function_id), Word::from(data_size)],
        );
    }

    /// `false` means the guest needs more time and will call `proxy_done`.
    pub fn on_done(self: &Arc<Self>) -> bool {
        let Some(wasm) = self.wasm().filter(|wasm| !wasm.is_failed()) else {
            return true;
        };
        let exports = wasm.exports();
        match &exports.on_done {
            Some(function) => self
                .call(&wasm, function, &[Word::from(self.id)])
                .is_none_or(Word::is_true),
            None => true,
        }
    }

    pub fn on_log(self: &Arc<Self>) {
        self.notify(|e| e.on_log.as_ref(), &[Word::from(self.id)]);
    }

    /// Runs at most once, and only for contexts the guest was told about.
    pub fn on_delete(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.deleted || !state.created_in_vm {
                state.deleted = true;
                return;
            }
            state.deleted = true;
        }
        debug!(context_id = self.id, plugin = self.log_prefix(), "deleting context");
        self.notify(|e| e.on_delete.as_ref(), &[Word::from(self.id)]);
    }

    // ---- network ----

    pub fn on_new_connection(self: &Arc<Self>) -> FilterStatus {
        let outcome = self.invoke_stream_hook(|e| e.on_new_connection.as_ref(), &[Word::from(self.id)]);
        self.network_status(outcome)
    }

    pub fn on_downstream_data(self: &Arc<Self>, data_size: u32, end_of_stream: bool) -> FilterStatus {
        let outcome = self.invoke_stream_hook(
            |e| e.on_downstream_data.as_ref(),
            &[Word::from(self.id), Word::from(data_size), Word::from(end_of_stream)],
        );
        self.network_status(outcome)
    }

    pub fn on_upstream_data(self: &Arc<Self>, data_size: u32, end_of_stream: bool) -> FilterStatus {
        let outcome = self.invoke_stream_hook(
            |e| e.on_upstream_data.as_ref(),
            &[Word::from(self.id), Word::from(data_size), Word::from(end_of_stream)],
        );
        self.network_status(outcome)
    }

    pub fn on_downstream_connection_close(self: &Arc<Self>, close_type: CloseType) {
        self.notify(
            |e| e.on_downstream_connection_close.as_ref(),
            &[Word::from(self.id), Word::from(close_type.as_u32())],
        );
    }

    pub fn on_upstream_connection_close(self: &Arc<Self>, close_type: CloseType) {
        self.notify(
            |e| e.on_upstream_connection_close.as_ref(),
            &[Word::from(self.id), Word::from(close_type.as_u32())],
        );
    }

    fn network_status(&self, outcome: HookOutcome) -> FilterStatus {
        match outcome {
            HookOutcome::Failed => {
                self.resolve_failure(FilterStatus::Continue, FilterStatus::StopIteration, NETWORK_HALVES)
            }
            HookOutcome::Missing => FilterStatus::Continue,
            HookOutcome::Returned { raw: 0, .. } => FilterStatus::Continue,
            HookOutcome::Returned { .. } => FilterStatus::StopIteration,
        }
    }

    // ---- HTTP ----

    fn header_args(&self, headers: u32, end_of_stream: bool) -> Vec<Word> {
        let abi_v0_2 = self
            .wasm()
            .is_some_and(|wasm| wasm.abi_version().is_v0_2());
        let mut args = vec![Word::from(self.id), Word::from(headers)];
        if abi_v0_2 {
            args.push(Word::from(end_of_stream));
        }
        args
    }

    pub fn on_request_headers(self: &Arc<Self>, headers: u32, end_of_stream: bool) -> FilterHeadersStatus {
        let args = self.header_args(headers, end_of_stream);
        let outcome = self.invoke_stream_hook(|e| e.on_request_headers.as_ref(), &args);
        self.headers_status(outcome)
    }

    pub fn on_request_body(self: &Arc<Self>, body_size: u32, end_of_stream: bool) -> FilterDataStatus {
        let outcome = self.invoke_stream_hook(
            |e| e.on_request_body.as_ref(),
            &[Word::from(self.id), Word::from(body_size), Word::from(end_of_stream)],
        );
        self.data_status(outcome)
    }

    pub fn on_request_trailers(self: &Arc<Self>, trailers: u32) -> FilterTrailersStatus {
        let outcome = self.invoke_stream_hook(
            |e| e.on_request_trailers.as_ref(),
            &[Word::from(self.id), Word::from(trailers)],
        );
        self.trailers_status(outcome)
    }

    pub fn on_request_metadata(self: &Arc<Self>, elements: u32) -> FilterMetadataStatus {
        let outcome = self.invoke_stream_hook(
            |e| e.on_request_metadata.as_ref(),
            &[Word::from(self.id), Word::from(elements)],
        );
        self.metadata_status(outcome)
    }

    pub fn on_response_headers(self: &Arc<Self>, headers: u32, end_of_stream: bool) -> FilterHeadersStatus {
        let args = self.header_args(headers, end_of_stream);
        let outcome = self.invoke_stream_hook(|e| e.on_response_headers.as_ref(), &args);
        self.headers_status(outcome)
    }

    pub fn on_response_body(self: &Arc<Self>, body_size: u32, end_of_stream: bool) -> FilterDataStatus {
        let outcome = self.invoke_stream_hook(
            |e| e.on_response_body.as_ref(),
            &[Word::from(self.id), Word::from(body_size), Word::from(end_of_stream)],
        );
        self.data_status(outcome)
    }

    pub fn on_response_trailers(self: &Arc<Self>, trailers: u32) -> FilterTrailersStatus {
        let outcome = self.invoke_stream_hook(
            |e| e.on_response_trailers.as_ref(),
            &[Word::from(self.id), Word::from(trailers)],
        );
        self.trailers_status(outcome)
    }

    pub fn on_response_metadata(self: &Arc<Self>, elements: u32) -> FilterMetadataStatus {
        let outcome = self.invoke_stream_hook(
            |e| e.on_response_metadata.as_ref(),
            &[Word::from(self.id), Word::from(elements)],
        );
        self.metadata_status(outcome)
    }

    fn headers_status(&self, outcome: HookOutcome) -> FilterHeadersStatus {
        match outcome {
            HookOutcome::Failed => self.resolve_failure(
                FilterHeadersStatus::Continue,
                FilterHeadersStatus::StopAllIterationAndWatermark,
                HTTP_HALVES,
            ),
            HookOutcome::Missing => FilterHeadersStatus::Continue,
            HookOutcome::Returned { raw, stop } => convert_headers_status(raw, stop),
        }
    }

    fn data_status(&self, outcome: HookOutcome) -> FilterDataStatus {
        match outcome {
            HookOutcome::Failed => self.resolve_failure(
                FilterDataStatus::Continue,
                FilterDataStatus::StopIterationNoBuffer,
                HTTP_HALVES,
            ),
            HookOutcome::Missing => FilterDataStatus::Continue,
            HookOutcome::Returned { raw, stop } => convert_data_status(raw, stop),
        }
    }

    fn trailers_status(&self, outcome: HookOutcome) -> FilterTrailersStatus {
        match outcome {
            HookOutcome::Failed => self.resolve_failure(
                FilterTrailersStatus::Continue,
                FilterTrailersStatus::StopIteration,
                HTTP_HALVES,
            ),
            HookOutcome::Missing => FilterTrailersStatus::Continue,
            HookOutcome::Returned { raw, stop } => convert_trailers_status(raw, stop),
        }
    }

    fn metadata_status(&self, outcome: HookOutcome) -> FilterMetadataStatus {
        if let HookOutcome::Failed = outcome {
            return self.resolve_failure(
                FilterMetadataStatus::Continue,
                FilterMetadataStatus::Continue,
                HTTP_HALVES,
            );
        }
        FilterMetadataStatus::Continue
    }

    // ---- asynchronous callbacks ----

    pub fn on_http_call_response(self: &Arc<Self>, token: u32, headers: u32, body_size: u32, trailers: u32) {
        self.notify(
            |e| e.on_http_call_response.as_ref(),
            &[
                Word::from(self.id),
                Word::from(token),
                Word::from(headers),
                Word::from(body_size),
                Word::from(trailers),
            ],
        );
    }

    pub fn on_grpc_receive_initial_metadata(self: &Arc<Self>, token: u32, elements: u32) {
        self.notify(
            |e| e.on_grpc_receive_initial_metadata.as_ref(),
            &[Word::from(self.id), Word::from(token), Word::from(elements)],
        );
    }

    pub fn on_grpc_receive_trailing_metadata(self: &Arc<Self>, token: u32, elements: u32) {
        self.notify(
            |e| e.on_grpc_receive_trailing_metadata.as_ref(),
            &[Word::from(self.id), Word::from(token), Word::from(elements)],
        );
    }

    pub fn on_grpc_receive(self: &Arc<Self>, token: u32, response_size: u32) {
        self.notify(
            |e| e.on_grpc_receive.as_ref(),
            &[Word::from(self.id), Word::from(token), Word::from(response_size)],
        );
    }

    pub fn on_grpc_close(self: &Arc<Self>, token: u32, status: GrpcStatus) {
        self.notify(
            |e| e.on_grpc_close.as_ref(),
            &[Word::from(self.id), Word::from(token), Word::from(status)],
        );
    }
}

impl fmt::Debug for ContextBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBase")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("kind", &self.kind)
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

/// Partial suspension is not supported, so a bare `StopIteration` is
/// upgraded to stopping everything.
fn convert_headers_status(raw: u64, stop: bool) -> FilterHeadersStatus {
    if stop || raw > u64::from(FilterHeadersStatus::MAX) {
        return FilterHeadersStatus::StopAllIterationAndWatermark;
    }
    match FilterHeadersStatus::try_from(raw) {
        Ok(FilterHeadersStatus::StopIteration) | Err(_) => {
            FilterHeadersStatus::StopAllIterationAndWatermark
        }
        Ok(status) => status,
    }
}

fn convert_data_status(raw: u64, stop: bool) -> FilterDataStatus {
    if stop {
        return FilterDataStatus::StopIterationNoBuffer;
    }
    FilterDataStatus::try_from(raw).unwrap_or(FilterDataStatus::StopIterationNoBuffer)
}

fn convert_trailers_status(raw: u64, stop: bool) -> FilterTrailersStatus {
    if stop {
        return FilterTrailersStatus::StopIteration;
    }
    FilterTrailersStatus::try_from(raw).unwrap_or(FilterTrailersStatus::StopIteration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DefaultContextHandler;

    fn detached(kind: ContextKind, plugin: Option<Arc<PluginBase>>) -> Arc<ContextBase> {
        Arc::new(ContextBase::new(
            Weak::new(),
            7,
            1,
            kind,
            plugin,
            None,
            Arc::new(DefaultContextHandler),
        ))
    }

    #[test]
    fn test_headers_status_conversion() {
        assert_eq!(convert_headers_status(0, false), FilterHeadersStatus::Continue);
        assert_eq!(
            convert_headers_status(1, false),
            FilterHeadersStatus::StopAllIterationAndWatermark
        );
        assert_eq!(
            convert_headers_status(2, false),
            FilterHeadersStatus::ContinueAndEndStream
        );
        assert_eq!(
            convert_headers_status(999, false),
            FilterHeadersStatus::StopAllIterationAndWatermark
        );
        assert_eq!(
            convert_headers_status(0, true),
            FilterHeadersStatus::StopAllIterationAndWatermark
        );
    }

    #[test]
    fn test_data_and_trailers_conversion() {
        assert_eq!(convert_data_status(0, false), FilterDataStatus::Continue);
        assert_eq!(convert_data_status(1, false), FilterDataStatus::StopIterationAndBuffer);
        assert_eq!(convert_data_status(4, false), FilterDataStatus::StopIterationNoBuffer);
        assert_eq!(convert_data_status(0, true), FilterDataStatus::StopIterationNoBuffer);
        assert_eq!(convert_trailers_status(0, false), FilterTrailersStatus::Continue);
        assert_eq!(convert_trailers_status(2, false), FilterTrailersStatus::StopIteration);
        assert_eq!(convert_trailers_status(0, true), FilterTrailersStatus::StopIteration);
    }

    #[test]
    fn test_detached_context_is_failed() {
        let plugin = Arc::new(PluginBase::new("p", "root", "vm", "wasmtime", "", true, ""));
        let context = detached(ContextKind::Stream, Some(plugin));

        assert!(context.is_failed());
        // Fail-open keeps traffic flowing.
        assert_eq!(context.on_request_headers(3, false), FilterHeadersStatus::Continue);
        assert_eq!(context.on_response_body(10, true), FilterDataStatus::Continue);
    }

    #[test]
    fn test_detached_fail_closed() {
        let plugin = Arc::new(PluginBase::new("p", "root", "vm", "wasmtime", "", false, ""));
        let context = detached(ContextKind::Stream, Some(plugin));

        assert_eq!(
            context.on_request_headers(3, false),
            FilterHeadersStatus::StopAllIterationAndWatermark
        );
        assert_eq!(context.on_request_trailers(1), FilterTrailersStatus::StopIteration);
        assert_eq!(context.on_request_metadata(1), FilterMetadataStatus::Continue);
        assert_eq!(context.on_new_connection(), FilterStatus::StopIteration);
    }

    #[test]
    fn test_plugin_configuration_buffer() {
        let plugin = Arc::new(PluginBase::new("p", "root", "vm", "wasmtime", "{\"a\":1}", false, ""));
        let context = detached(ContextKind::Root, Some(plugin));

        assert_eq!(context.buffer_size(BufferType::PluginConfiguration), Ok(7));
        assert_eq!(
            context.buffer_bytes(BufferType::PluginConfiguration, 1, 100),
            Ok(b"\"a\":1}".to_vec())
        );
        assert_eq!(
            context.buffer_bytes(BufferType::PluginConfiguration, 8, 1),
            Err(WasmResult::BadArgument)
        );
        assert_eq!(
            context.buffer_size(BufferType::HttpRequestBody),
            Err(WasmResult::NotFound)
        );
    }

    #[test]
    fn test_on_delete_requires_create() {
        let context = detached(ContextKind::Root, None);
        context.on_delete();
        assert!(!context.is_created_in_vm());
    }
}
