//! UTF-16LE string helpers.
//!
//! Strings on the wire are UTF-16LE; decoded text is kept as `String`.

use ironkms_core::{invalid_field_err, DecodeResult};

/// Number of UTF-16 code units needed to encode `s` (terminator excluded).
pub fn utf16le_units(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Encodes `s` as UTF-16LE bytes, without a terminator.
pub fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decodes UTF-16LE `bytes` into a `String`.
///
/// Odd byte lengths and unpaired surrogates are rejected.
pub fn decode_utf16le(bytes: &[u8]) -> DecodeResult<String> {
    if bytes.len() % 2 != 0 {
        return Err(invalid_field_err!("UTF-16 string", "length", "odd byte length"));
    }

    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    String::from_utf16(&units)
        .map_err(|e| invalid_field_err!("UTF-16 string", "data", "unpaired surrogate").with_source(e))
}
