//! Read-only introspection of WebAssembly binaries.
//!
//! These helpers walk the section layout of a module without compiling it:
//! - header validation
//! - ABI version detection from `proxy_abi_version_*` exports
//! - custom section lookup and the `"name"` function-name index
//! - removal of engine-specific `precompiled_*` sections
//!
//! Every helper returns a [`BytecodeError`] on malformed input; callers treat
//! any error as "refuse to load".

use std::collections::HashMap;
use std::ops::Range;

use proxy_wasm_common::{AbiVersion, BytecodeError};

const WASM_HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

const CUSTOM_SECTION: u8 = 0;
const EXPORT_SECTION: u8 = 7;
const EXPORT_KIND_FUNCTION: u8 = 0;
const NAME_SUBSECTION_FUNCTIONS: u8 = 1;

/// Substring marking an engine-specific precompiled section.
pub const PRECOMPILED_MARKER: &str = "precompiled_";

/// One top-level section of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section<'a> {
    /// Section id (0 for custom sections).
    pub id: u8,
    /// Name of a custom section.
    pub name: Option<&'a str>,
    /// Bytes of the whole section, header included.
    pub range: Range<usize>,
    /// Section contents; for custom sections, the bytes after the name.
    pub payload: &'a [u8],
}

/// Check the `\0asm` magic and version 1.
pub fn check_wasm_header(bytecode: &[u8]) -> Result<(), BytecodeError> {
    if bytecode.len() < WASM_HEADER.len() || bytecode[..WASM_HEADER.len()] != WASM_HEADER {
        return Err(BytecodeError::InvalidHeader);
    }
    Ok(())
}

/// Decode an unsigned LEB128 value starting at `pos`.
///
/// Returns the value and the position just past it. Fails when the input
/// ends first, or when the fifth byte would push the value past 32 bits.
pub fn parse_varint(bytes: &[u8], pos: usize) -> Result<(u32, usize), BytecodeError> {
    let start = pos;
    let mut pos = pos;
    let mut shift = 0_u32;
    let mut total = 0_u32;
    loop {
        let byte = *bytes
            .get(pos)
            .ok_or(BytecodeError::Truncated { offset: pos })?;
        pos += 1;
        let value = u32::from(byte & 0x7f);
        if shift == 28 && value > 3 {
            return Err(BytecodeError::VarintOverflow { offset: start });
        }
        total |= value << shift;
        if byte & 0x80 == 0 {
            return Ok((total, pos));
        }
        shift += 7;
        if shift > 28 {
            return Err(BytecodeError::VarintOverflow { offset: start });
        }
    }
}

/// Cursor over a byte slice with absolute offsets for error reporting.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], base: usize) -> Self {
        Self { bytes, pos: 0, base }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn byte(&mut self) -> Result<u8, BytecodeError> {
        let byte = *self.bytes.get(self.pos).ok_or(BytecodeError::Truncated {
            offset: self.offset(),
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn varint(&mut self) -> Result<u32, BytecodeError> {
        let (value, next) = parse_varint(self.bytes, self.pos).map_err(|e| match e {
            BytecodeError::Truncated { .. } => BytecodeError::Truncated {
                offset: self.offset(),
            },
            _ => BytecodeError::VarintOverflow {
                offset: self.offset(),
            },
        })?;
        self.pos = next;
        Ok(value)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BytecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(BytecodeError::MalformedSection {
                offset: self.offset(),
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn name(&mut self) -> Result<&'a str, BytecodeError> {
        let offset = self.offset();
        let len = self.varint()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw).map_err(|_| BytecodeError::MalformedSection { offset })
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        rest
    }
}

/// List every top-level section in file order.
pub fn sections(bytecode: &[u8]) -> Result<Vec<Section<'_>>, BytecodeError> {
    check_wasm_header(bytecode)?;
    let mut reader = Reader::new(&bytecode[WASM_HEADER.len()..], WASM_HEADER.len());
    let mut sections = Vec::new();
    while !reader.is_empty() {
        let start = reader.offset();
        let id = reader.byte()?;
        let size = reader.varint()? as usize;
        let payload_offset = reader.offset();
        let payload = reader.take(size)?;
        let end = reader.offset();

        let (name, payload) = if id == CUSTOM_SECTION {
            let mut inner = Reader::new(payload, payload_offset);
            let name = inner.name()?;
            (Some(name), inner.rest())
        } else {
            (None, payload)
        };

        sections.push(Section {
            id,
            name,
            range: start..end,
            payload,
        });
    }
    Ok(sections)
}

/// Detect the ABI version from the first `proxy_abi_version_*` function export.
pub fn get_abi_version(bytecode: &[u8]) -> Result<AbiVersion, BytecodeError> {
    for section in sections(bytecode)? {
        if section.id != EXPORT_SECTION {
            continue;
        }
        let mut reader = Reader::new(section.payload, section.range.start);
        let count = reader.varint()?;
        for _ in 0..count {
            let name = reader.name()?;
            let kind = reader.byte()?;
            reader.varint()?;
            if kind == EXPORT_KIND_FUNCTION {
                if let Some(version) = AbiVersion::from_export_name(name) {
                    return Ok(version);
                }
            }
        }
    }
    Ok(AbiVersion::Unknown)
}

/// Return the payload of the first custom section named exactly `name`.
pub fn get_custom_section<'a>(
    bytecode: &'a [u8],
    name: &str,
) -> Result<Option<&'a [u8]>, BytecodeError> {
    Ok(sections(bytecode)?
        .into_iter()
        .find(|section| section.name == Some(name))
        .map(|section| section.payload))
}

/// List the names and payloads of all custom sections.
pub fn custom_sections(bytecode: &[u8]) -> Result<Vec<(&str, &[u8])>, BytecodeError> {
    Ok(sections(bytecode)?
        .into_iter()
        .filter_map(|section| section.name.map(|name| (name, section.payload)))
        .collect())
}

/// Parse the function-name subsection of the `"name"` custom section.
///
/// A module without a `"name"` section yields an empty index.
pub fn get_function_name_index(bytecode: &[u8]) -> Result<HashMap<u32, String>, BytecodeError> {
    let mut index = HashMap::new();
    let Some(section) = sections(bytecode)?
        .into_iter()
        .find(|section| section.name == Some("name"))
    else {
        return Ok(index);
    };

    let base = section.range.end - section.payload.len();
    let mut reader = Reader::new(section.payload, base);
    while !reader.is_empty() {
        let subsection_id = reader.byte()?;
        let size = reader.varint()? as usize;
        let subsection_offset = reader.offset();
        let payload = reader.take(size)?;
        if subsection_id != NAME_SUBSECTION_FUNCTIONS {
            continue;
        }
        let mut names = Reader::new(payload, subsection_offset);
        let count = names.varint()?;
        for _ in 0..count {
            let function_index = names.varint()?;
            let name = names.name()?;
            index.insert(function_index, name.to_string());
        }
    }
    Ok(index)
}

/// Drop everything from the first `precompiled_*` custom section onward.
///
/// Returns the input unchanged when no such section exists.
pub fn get_stripped_source(bytecode: &[u8]) -> Result<&[u8], BytecodeError> {
    let cut = sections(bytecode)?.into_iter().find(|section| {
        section
            .name
            .is_some_and(|name| name.contains(PRECOMPILED_MARKER))
    });
    Ok(match cut {
        Some(section) => &bytecode[..section.range.start],
        None => bytecode,
    })
}

/// Encode an unsigned LEB128 value.
pub fn encode_varint(mut value: u32, out: &mut Vec<u8>) {
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Encode a custom section with the given name and payload.
pub fn encode_custom_section(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(name.len() + payload.len() + 5);
    encode_length(name.len(), &mut body);
    body.extend_from_slice(name.as_bytes());
    body.extend_from_slice(payload);

    let mut section = vec![CUSTOM_SECTION];
    encode_length(body.len(), &mut section);
    section.extend_from_slice(&body);
    section
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    encode_varint(u32::try_from(len).unwrap_or(u32::MAX), out);
}
