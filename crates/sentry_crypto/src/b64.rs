//! Byte-buffer ↔ base64 conversions.
//!
//! Everything this core emits is base64; what it accepts is the admitted
//! alphabet `[0-9A-Za-z+/=_-]` — standard and url-safe interleave in the
//! wild (older clients used standard base64 for at-rest blobs). Decoding
//! normalises to url-safe, strips trailing padding, then decodes strictly.
//! Any byte outside the admitted alphabet is a tagged failure, never a
//! lossy fallback.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};

use crate::error::CryptoError;

/// Encode as base64url without padding (wire fields).
pub fn encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Encode as standard padded base64 (at-rest envelope fields).
pub fn encode_std(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode any admitted-alphabet base64 string.
pub fn decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    let trimmed = s.trim_end_matches('=');
    let mut norm = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' => norm.push(c),
            '+' => norm.push('-'),
            '/' => norm.push('_'),
            other => {
                return Err(CryptoError::Base64(format!(
                    "character {other:?} outside admitted alphabet"
                )))
            }
        }
    }
    URL_SAFE_NO_PAD
        .decode(norm.as_bytes())
        .map_err(|e| CryptoError::Base64(e.to_string()))
}

/// Decode and require an exact length (keys, salts, IVs).
pub fn decode_exact<const N: usize>(s: &str) -> Result<[u8; N], CryptoError> {
    let bytes = decode(s)?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| CryptoError::Base64(format!("expected {N} bytes, got {}", bytes.len())))
}
