//! Binary column encoding
//!
//! Relational stores hand binary columns back as text. Two forms show up in
//! the same tables, depending on which code path wrote the row:
//!   - hex with marker: `\x` followed by hex digits (bytea output format)
//!   - plain standard base64
//!
//! Reads accept either; writes use the configured form. The backslash never
//! occurs in the base64 alphabet, so the marker is unambiguous.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use fv_core::config::StorageEncoding;
use fv_core::{FvError, FvResult};

/// Marker prefix of the hex form
pub const HEX_MARKER: &str = "\\x";

/// Decode a stored column value into raw bytes.
pub fn to_cipher_bytes(stored: &str) -> FvResult<Vec<u8>> {
    let stored = stored.trim();
    match stored.strip_prefix(HEX_MARKER) {
        Some(hex_digits) => hex::decode(hex_digits)
            .map_err(|e| FvError::corruption(format!("hex column value: {e}"))),
        None => B64
            .decode(stored)
            .map_err(|e| FvError::corruption(format!("base64 column value: {e}"))),
    }
}

/// Encode raw bytes into the stored column form.
pub fn from_cipher_bytes(bytes: &[u8], encoding: StorageEncoding) -> String {
    match encoding {
        StorageEncoding::Hex => format!("{HEX_MARKER}{}", hex::encode(bytes)),
        StorageEncoding::Base64 => B64.encode(bytes),
    }
}
