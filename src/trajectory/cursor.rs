//! Opaque pagination cursors.
//!
//! A cursor is URL-safe base64 (no padding) over `{"offset": N}`. Callers
//! echo it back unchanged; anything that does not decode to exactly that
//! shape is a validation error, never a silent reset to the first page.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CursorToken {
    offset: u64,
}

/// Encode a result-set offset as a cursor.
pub fn encode_cursor(offset: u64) -> String {
    // Serializing a struct with one integer field cannot fail.
    let json = serde_json::to_vec(&CursorToken { offset }).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode a cursor back into a result-set offset.
///
/// # Errors
///
/// Returns [`LedgerError::Validation`] if the token is not valid base64 or
/// does not wrap a `{"offset": N}` object.
pub fn decode_cursor(cursor: &str) -> Result<u64> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|e| LedgerError::validation(format!("malformed cursor: {e}")))?;
    let token: CursorToken = serde_json::from_slice(&bytes)
        .map_err(|e| LedgerError::validation(format!("malformed cursor: {e}")))?;
    Ok(token.offset)
}
