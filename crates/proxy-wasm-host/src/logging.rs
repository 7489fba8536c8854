//! Guest log routing.
//!
//! Everything a guest writes through `proxy_log` or WASI stdout/stderr ends
//! up here. Lines are:
//! 1. Emitted via the `tracing` crate, marked `guest_log = true`
//! 2. Forwarded to the [`ContextHandler`](proxy_wasm_core::ContextHandler)
//!    of the context the call is attributed to

use proxy_wasm_common::{LogLevel, WasmResult};
use proxy_wasm_core::ContextBase;
use tracing::{debug, error, info, trace, warn};

/// Host implementation of guest logging.
pub struct GuestLog;

impl GuestLog {
    /// Log a guest message at `level` on behalf of `context`.
    pub fn log(context: &ContextBase, level: LogLevel, message: &str) -> WasmResult {
        let context_id = context.id();
        let plugin = context.log_prefix();
        match level {
            LogLevel::Trace => trace!(context_id, plugin, guest_log = true, "{}", message),
            LogLevel::Debug => debug!(context_id, plugin, guest_log = true, "{}", message),
            LogLevel::Info => info!(context_id, plugin, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(context_id, plugin, guest_log = true, "{}", message),
            LogLevel::Error | LogLevel::Critical => {
                error!(context_id, plugin, guest_log = true, "{}", message);
            }
        }
        context.handler().log(level, message)
    }

    /// Log a line the guest wrote to stdout (`fd` 1) or stderr (`fd` 2).
    pub fn log_stdio(context: &ContextBase, fd: u32, bytes: &[u8]) -> WasmResult {
        let level = if fd == 2 { LogLevel::Error } else { LogLevel::Info };
        let text = String::from_utf8_lossy(bytes);
        Self::log(context, level, trim_newline(&text))
    }
}

/// Convert a raw ABI log level, treating unknown values as `Info`.
pub fn level_from_u32(level: u32) -> LogLevel {
    LogLevel::try_from(u64::from(level)).unwrap_or(LogLevel::Info)
}

fn trim_newline(text: &str) -> &str {
    let text = text.strip_suffix('\n').unwrap_or(text);
    text.strip_suffix('\r').unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_u32() {
        assert_eq!(level_from_u32(0), LogLevel::Trace);
        assert_eq!(level_from_u32(3), LogLevel::Warn);
        assert_eq!(level_from_u32(5), LogLevel::Critical);
        assert_eq!(level_from_u32(99), LogLevel::Info); // Unknown defaults to Info
    }

    #[test]
    fn test_trim_newline() {
        assert_eq!(trim_newline("hello\n"), "hello");
        assert_eq!(trim_newline("hello\r\n"), "hello");
        assert_eq!(trim_newline("hello"), "hello");
        assert_eq!(trim_newline("a\n\n"), "a\n");
    }
}
