//! Serialization of header maps exchanged with the guest.
//!
//! Layout (all integers little-endian `u32`):
//!
//! ```text
//! count | (key_len, value_len) * count | key_0 \0 value_0 \0 ... key_n \0 value_n \0
//! ```

use proxy_wasm_common::WasmResult;

/// Ordered list of header name/value pairs.
pub type Pairs = Vec<(String, String)>;

/// Size in bytes of the serialized form of `pairs`.
pub fn pairs_size(pairs: &[(String, String)]) -> usize {
    pairs.iter().fold(4, |size, (key, value)| {
        size + 8 + key.len() + 1 + value.len() + 1
    })
}

/// Serialize `pairs` into the guest wire format.
pub fn encode_pairs(pairs: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pairs_size(pairs));
    out.extend_from_slice(&len_u32(pairs.len()).to_le_bytes());
    for (key, value) in pairs {
        out.extend_from_slice(&len_u32(key.len()).to_le_bytes());
        out.extend_from_slice(&len_u32(value.len()).to_le_bytes());
    }
    for (key, value) in pairs {
        out.extend_from_slice(key.as_bytes());
        out.push(0);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

/// Parse the guest wire format.
///
/// Empty input decodes to no pairs. Truncated or inconsistent input is a
/// `ParseFailure`. Non UTF-8 bytes are replaced.
pub fn decode_pairs(bytes: &[u8]) -> Result<Pairs, WasmResult> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let count = read_u32(bytes, 0)? as usize;
    let header_end = count
        .checked_mul(8)
        .and_then(|len| len.checked_add(4))
        .ok_or(WasmResult::ParseFailure)?;
    if header_end > bytes.len() {
        return Err(WasmResult::ParseFailure);
    }

    let mut pairs = Vec::with_capacity(count);
    let mut data = header_end;
    for i in 0..count {
        let key_len = read_u32(bytes, 4 + i * 8)? as usize;
        let value_len = read_u32(bytes, 8 + i * 8)? as usize;
        let key = take_terminated(bytes, &mut data, key_len)?;
        let value = take_terminated(bytes, &mut data, value_len)?;
        pairs.push((
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    Ok(pairs)
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, WasmResult> {
    let raw = bytes.get(at..at + 4).ok_or(WasmResult::ParseFailure)?;
    let raw: [u8; 4] = raw.try_into().map_err(|_| WasmResult::ParseFailure)?;
    Ok(u32::from_le_bytes(raw))
}

fn take_terminated<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], WasmResult> {
    let end = pos.checked_add(len).ok_or(WasmResult::ParseFailure)?;
    if bytes.get(end) != Some(&0) {
        return Err(WasmResult::ParseFailure);
    }
    let slice = &bytes[*pos..end];
    *pos = end + 1;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Pairs {
        vec![
            (":path".to_string(), "/index".to_string()),
            ("x-empty".to_string(), String::new()),
        ]
    }

    #[test]
    fn test_encode_layout() {
        let encoded = encode_pairs(&[("a".to_string(), "bc".to_string())]);
        assert_eq!(
            encoded,
            [1, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, b'a', 0, b'b', b'c', 0]
        );
        assert_eq!(encoded.len(), pairs_size(&[("a".to_string(), "bc".to_string())]));
    }

    #[test]
    fn test_decode_encoded() {
        assert_eq!(decode_pairs(&encode_pairs(&sample())), Ok(sample()));
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode_pairs(&[]), Ok(Vec::new()));
        assert_eq!(decode_pairs(&[0, 0, 0, 0]), Ok(Vec::new()));
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = encode_pairs(&sample());
        assert_eq!(
            decode_pairs(&encoded[..encoded.len() - 1]),
            Err(WasmResult::ParseFailure)
        );
        assert_eq!(decode_pairs(&[5, 0, 0, 0]), Err(WasmResult::ParseFailure));
    }

    #[test]
    fn test_decode_missing_terminator() {
        let mut encoded = encode_pairs(&[("k".to_string(), "v".to_string())]);
        let last = encoded.len() - 1;
        encoded[last] = b'x';
        assert_eq!(decode_pairs(&encoded), Err(WasmResult::ParseFailure));
    }
}
