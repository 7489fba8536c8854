//! Minimal WASI preview1 surface.
//!
//! Enough for guests built with standard toolchains to start: stdout and
//! stderr are routed into the guest log, environment variables come from the
//! VM configuration, clocks and randomness come from the host. There is no
//! filesystem; everything else reports an errno instead of trapping.

use proxy_wasm_common::{VmError, WasmResult};
use proxy_wasm_core::{Guest, Word};
use rand::RngCore;
use tracing::debug;

use crate::logging::GuestLog;
use crate::memory::{HostResult, active, expect_args, read_bytes};

/// WASI errno values.
mod errno {
    pub const SUCCESS: u32 = 0;
    pub const BADF: u32 = 8;
    pub const INVAL: u32 = 28;
    pub const NOSYS: u32 = 52;
    pub const NOTSUP: u32 = 58;
    pub const NOTCAPABLE: u32 = 76;
}

const STDOUT: u32 = 1;
const STDERR: u32 = 2;

const CLOCK_REALTIME: u32 = 0;
const CLOCK_MONOTONIC: u32 = 1;

/// Largest buffer `random_get` fills in one call.
const MAX_RANDOM_BYTES: u64 = 64 * 1024;

fn reply(code: u32) -> HostResult {
    Ok(Word::from(code))
}

fn put_u32(guest: &mut dyn Guest, pointer: Word, value: u32) -> HostResult {
    if guest.set_word(pointer.u64(), Word::from(value)) {
        reply(errno::SUCCESS)
    } else {
        reply(errno::INVAL)
    }
}

/// Gather `iovs_len` `(buf, len)` records starting at `iovs`.
fn gather(guest: &dyn Guest, iovs: Word, iovs_len: Word) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    for i in 0..iovs_len.u64() {
        let record = iovs.u64().checked_add(i.checked_mul(8)?)?;
        let buf = guest.get_word(record)?;
        let len = guest.get_word(record.checked_add(4)?)?;
        out.extend_from_slice(&read_bytes(guest, buf, len).ok()?);
    }
    Some(out)
}

/// `NUL`-terminated `KEY=VALUE` entries.
fn environ_entries(envs: &[(String, String)]) -> Vec<Vec<u8>> {
    envs.iter()
        .map(|(key, value)| {
            let mut entry = Vec::with_capacity(key.len() + value.len() + 2);
            entry.extend_from_slice(key.as_bytes());
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            entry.push(0);
            entry
        })
        .collect()
}

pub fn fd_write(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [fd, iovs, iovs_len, nwritten_ptr] = expect_args("fd_write", args)?;
    let (_, context) = active("fd_write")?;
    let fd = fd.u32();
    if fd != STDOUT && fd != STDERR {
        return reply(errno::BADF);
    }
    let Some(bytes) = gather(guest, iovs, iovs_len) else {
        return reply(errno::INVAL);
    };
    let status = GuestLog::log_stdio(&context, fd, &bytes);
    if status != WasmResult::Ok {
        debug!(fd, ?status, "guest output not delivered");
    }
    put_u32(guest, nwritten_ptr, u32::try_from(bytes.len()).unwrap_or(u32::MAX))
}

pub fn fd_read(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [_, _, _, _] = expect_args("fd_read", args)?;
    reply(errno::NOSYS)
}

pub fn fd_seek(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [_, _, _, _] = expect_args("fd_seek", args)?;
    reply(errno::NOSYS)
}

pub fn fd_close(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [_] = expect_args("fd_close", args)?;
    reply(errno::NOSYS)
}

/// Describes stdout and stderr as character devices.
pub fn fd_fdstat_get(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [fd, stat_ptr] = expect_args("fd_fdstat_get", args)?;
    let fd = fd.u32();
    if fd != STDOUT && fd != STDERR {
        return reply(errno::BADF);
    }
    // fdstat: u8 filetype, u16 flags, u64 rights_base, u64 rights_inheriting.
    let mut stat = [0u8; 24];
    stat[0] = 2;
    stat[8..16].copy_from_slice(&64u64.to_le_bytes());
    if guest.set_memory(stat_ptr.u64(), &stat) {
        reply(errno::SUCCESS)
    } else {
        reply(errno::INVAL)
    }
}

pub fn fd_prestat_get(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [_, _] = expect_args("fd_prestat_get", args)?;
    reply(errno::BADF)
}

pub fn fd_prestat_dir_name(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [_, _, _] = expect_args("fd_prestat_dir_name", args)?;
    reply(errno::NOSYS)
}

pub fn path_open(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [_, _, _, _, _, _, _, _, _] = expect_args("path_open", args)?;
    reply(errno::NOTCAPABLE)
}

pub fn environ_sizes_get(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [count_ptr, size_ptr] = expect_args("environ_sizes_get", args)?;
    let (wasm, _) = active("environ_sizes_get")?;
    let entries = environ_entries(wasm.envs());
    let size: usize = entries.iter().map(Vec::len).sum();
    if !guest.set_word(count_ptr.u64(), Word::from(entries.len())) {
        return reply(errno::INVAL);
    }
    put_u32(guest, size_ptr, u32::try_from(size).unwrap_or(u32::MAX))
}

/// Writes one pointer per entry at `environ` and the entries themselves,
/// back to back, at `environ_buf`.
pub fn environ_get(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [environ, environ_buf] = expect_args("environ_get", args)?;
    let (wasm, _) = active("environ_get")?;
    let mut pointer = environ.u64();
    let mut buf = environ_buf.u64();
    for entry in environ_entries(wasm.envs()) {
        if !guest.set_word(pointer, Word(buf)) || !guest.set_memory(buf, &entry) {
            return reply(errno::INVAL);
        }
        pointer += 4;
        buf += entry.len() as u64;
    }
    reply(errno::SUCCESS)
}

pub fn args_sizes_get(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [count_ptr, size_ptr] = expect_args("args_sizes_get", args)?;
    if !guest.set_word(count_ptr.u64(), Word(0)) {
        return reply(errno::INVAL);
    }
    put_u32(guest, size_ptr, 0)
}

pub fn args_get(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [_, _] = expect_args("args_get", args)?;
    reply(errno::SUCCESS)
}

pub fn clock_time_get(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [clock_id, _precision, time_ptr] = expect_args("clock_time_get", args)?;
    let (_, context) = active("clock_time_get")?;
    let now = match clock_id.u32() {
        CLOCK_REALTIME => context.handler().current_time_nanoseconds(),
        CLOCK_MONOTONIC => context.handler().monotonic_time_nanoseconds(),
        _ => return reply(errno::NOTSUP),
    };
    if guest.set_u64(time_ptr.u64(), now) {
        reply(errno::SUCCESS)
    } else {
        reply(errno::INVAL)
    }
}

pub fn random_get(guest: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [buf, buf_len] = expect_args("random_get", args)?;
    if buf_len.u64() > MAX_RANDOM_BYTES {
        return reply(errno::INVAL);
    }
    #[allow(clippy::cast_possible_truncation)]
    let mut bytes = vec![0u8; buf_len.u64() as usize];
    rand::thread_rng().fill_bytes(&mut bytes);
    if guest.set_memory(buf.u64(), &bytes) {
        reply(errno::SUCCESS)
    } else {
        reply(errno::INVAL)
    }
}

pub fn poll_oneoff(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [_, _, _, _] = expect_args("poll_oneoff", args)?;
    reply(errno::NOSYS)
}

pub fn sched_yield(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [] = expect_args("sched_yield", args)?;
    reply(errno::SUCCESS)
}

/// Aborts the current guest call.
pub fn proc_exit(_: &mut dyn Guest, args: &[Word]) -> HostResult {
    let [code] = expect_args("proc_exit", args)?;
    debug!(code = code.u32(), "guest called proc_exit");
    Err(VmError::Exit { code: code.u32() })
}

#[cfg(test)]
mod tests {
    use proxy_wasm_core::GuestFunction;
    use proxy_wasm_core::word::memory_range;

    use super::*;

    /// A page of guest memory and nothing else.
    struct Memory(Vec<u8>);

    impl Memory {
        fn new() -> Self {
            Self(vec![0; 4096])
        }
    }

    impl Guest for Memory {
        fn memory_size(&self) -> u64 {
            self.0.len() as u64
        }

        fn get_memory(&self, pointer: u64, size: u64) -> Option<&[u8]> {
            let range = memory_range(pointer, size, self.0.len())?;
            Some(&self.0[range])
        }

        fn set_memory(&mut self, pointer: u64, data: &[u8]) -> bool {
            let Some(range) = memory_range(pointer, data.len() as u64, self.0.len()) else {
                return false;
            };
            self.0[range].copy_from_slice(data);
            true
        }

        fn call(&mut self, _: &GuestFunction, _: &[Word]) -> Result<Option<Word>, VmError> {
            Err(VmError::Terminated)
        }
    }

    fn errno_of(result: HostResult) -> u32 {
        result.unwrap().u32()
    }

    #[test]
    fn test_gather_iovecs() {
        let mut memory = Memory::new();
        memory.set_memory(100, b"hello world");
        // Two records: (100, 5) and (105, 6).
        memory.set_word(0, Word(100));
        memory.set_word(4, Word(5));
        memory.set_word(8, Word(105));
        memory.set_word(12, Word(6));

        assert_eq!(gather(&memory, Word(0), Word(2)).unwrap(), b"hello world");
        assert_eq!(gather(&memory, Word(0), Word(0)).unwrap(), b"");
        // A record pointing past the end of memory.
        memory.set_word(16, Word(4090));
        memory.set_word(20, Word(100));
        assert!(gather(&memory, Word(16), Word(1)).is_none());
    }

    #[test]
    fn test_fd_write_requires_active_context() {
        let mut memory = Memory::new();
        let err = fd_write(&mut memory, &[Word(1), Word(0), Word(0), Word(8)]).unwrap_err();
        assert!(matches!(err, VmError::NoActiveContext { name: "fd_write" }));
    }

    #[test]
    fn test_fd_fdstat_get() {
        let mut memory = Memory::new();
        assert_eq!(errno_of(fd_fdstat_get(&mut memory, &[Word(1), Word(64)])), errno::SUCCESS);
        assert_eq!(memory.0[64], 2);
        assert_eq!(errno_of(fd_fdstat_get(&mut memory, &[Word(3), Word(64)])), errno::BADF);
        assert_eq!(errno_of(fd_fdstat_get(&mut memory, &[Word(2), Word(4090)])), errno::INVAL);
    }

    #[test]
    fn test_random_get_bounds() {
        let mut memory = Memory::new();
        assert_eq!(errno_of(random_get(&mut memory, &[Word(0), Word(32)])), errno::SUCCESS);
        assert_eq!(errno_of(random_get(&mut memory, &[Word(0), Word(0)])), errno::SUCCESS);
        assert_eq!(
            errno_of(random_get(&mut memory, &[Word(0), Word(MAX_RANDOM_BYTES + 1)])),
            errno::INVAL
        );
        // Fits the limit but not the memory.
        assert_eq!(errno_of(random_get(&mut memory, &[Word(4000), Word(200)])), errno::INVAL);
    }

    #[test]
    fn test_no_filesystem() {
        let mut memory = Memory::new();
        let args = [Word(3); 9];
        assert_eq!(errno_of(path_open(&mut memory, &args)), errno::NOTCAPABLE);
        assert_eq!(errno_of(fd_prestat_get(&mut memory, &[Word(3), Word(0)])), errno::BADF);
        assert_eq!(
            errno_of(fd_read(&mut memory, &[Word(0), Word(0), Word(0), Word(0)])),
            errno::NOSYS
        );
    }

    #[test]
    fn test_args_are_empty() {
        let mut memory = Memory::new();
        memory.set_word(0, Word(9));
        memory.set_word(4, Word(9));
        assert_eq!(errno_of(args_sizes_get(&mut memory, &[Word(0), Word(4)])), errno::SUCCESS);
        assert_eq!(memory.get_word(0), Some(Word(0)));
        assert_eq!(memory.get_word(4), Some(Word(0)));
    }

    #[test]
    fn test_proc_exit_aborts_call() {
        let mut memory = Memory::new();
        let err = proc_exit(&mut memory, &[Word(3)]).unwrap_err();
        assert!(matches!(err, VmError::Exit { code: 3 }));
    }

    #[test]
    fn test_wrong_argument_count_traps() {
        let mut memory = Memory::new();
        assert!(random_get(&mut memory, &[Word(0)]).is_err());
    }

    #[test]
    fn test_environ_entries() {
        let envs = vec![
            ("A".to_string(), "1".to_string()),
            ("EMPTY".to_string(), String::new()),
        ];
        let entries = environ_entries(&envs);
        assert_eq!(entries, vec![b"A=1\0".to_vec(), b"EMPTY=\0".to_vec()]);
        assert!(environ_entries(&[]).is_empty());
    }
}
