//! Host/guest scalars and the guest memory bounds check.

use std::fmt;
use std::ops::Range;

use proxy_wasm_common::WasmResult;

/// Size in bytes of a guest pointer or `size_t` on wasm32.
pub const WORD_SIZE: u64 = 4;

/// A value crossing the host/guest boundary.
///
/// Always carried as 64 bits; [`Word::u32`] truncates to the wasm32 word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Word(pub u64);

impl Word {
    /// Truncate to the 32-bit guest word.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn u32(self) -> u32 {
        self.0 as u32
    }

    /// Full 64-bit value.
    pub const fn u64(self) -> u64 {
        self.0
    }

    /// Interpret a boolean argument.
    pub const fn is_true(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for Word {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u32> for Word {
    fn from(value: u32) -> Self {
        Self(u64::from(value))
    }
}

impl From<usize> for Word {
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl From<bool> for Word {
    fn from(value: bool) -> Self {
        Self(u64::from(value))
    }
}

impl From<WasmResult> for Word {
    fn from(value: WasmResult) -> Self {
        Self(u64::from(value.as_u32()))
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate a guest memory access of `size` bytes at `pointer`.
///
/// Returns the byte range inside a linear memory of `memory_len` bytes, or
/// `None` when `pointer + size` overflows or runs past the end of memory.
/// Every backend funnels its memory accessors through this check.
pub fn memory_range(pointer: u64, size: u64, memory_len: usize) -> Option<Range<usize>> {
    let end = pointer.checked_add(size)?;
    if end > memory_len as u64 {
        return None;
    }
    let start = usize::try_from(pointer).ok()?;
    let end = usize::try_from(end).ok()?;
    Some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_truncation() {
        let word = Word(0x1_0000_0002);
        assert_eq!(word.u32(), 2);
        assert_eq!(word.u64(), 0x1_0000_0002);
    }

    #[test]
    fn test_word_conversions() {
        assert_eq!(Word::from(true), Word(1));
        assert_eq!(Word::from(WasmResult::NotFound), Word(1));
        assert_eq!(Word::from(7_u32), Word(7));
        assert!(Word(3).is_true());
        assert!(!Word(0).is_true());
    }

    #[test]
    fn test_memory_range_in_bounds() {
        assert_eq!(memory_range(0, 4, 16), Some(0..4));
        assert_eq!(memory_range(12, 4, 16), Some(12..16));
        assert_eq!(memory_range(16, 0, 16), Some(16..16));
    }

    #[test]
    fn test_memory_range_out_of_bounds() {
        assert_eq!(memory_range(13, 4, 16), None);
        assert_eq!(memory_range(17, 0, 16), None);
    }

    #[test]
    fn test_memory_range_overflow() {
        assert_eq!(memory_range(u64::MAX, 1, 16), None);
        assert_eq!(memory_range(1, u64::MAX, usize::MAX), None);
    }
}
