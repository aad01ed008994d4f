//! Binary to text transport encoding for ciphertext.
//!
//! Buffers are processed in bounded slices so that multi-megabyte snapshots
//! never go through a single call over the whole input.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{CacheError, CacheResult};

/// Slice size used while encoding. A multiple of 3 so that every slice
/// encodes to whole base64 quanta without padding.
const ENCODE_SLICE: usize = 8190;

/// Slice size used while decoding (8 KiB of text, a multiple of 4).
const DECODE_SLICE: usize = 8192;

/// Encode bytes as standard padded base64.
pub fn encode(bytes: &[u8]) -> String {
  let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
  for slice in bytes.chunks(ENCODE_SLICE) {
    STANDARD.encode_string(slice, &mut out);
  }
  out
}

/// Decode standard padded base64 text.
///
/// Truncated or otherwise malformed text fails with [`CacheError::Format`].
pub fn decode(text: &str) -> CacheResult<Vec<u8>> {
  let input = text.as_bytes();
  if input.len() % 4 != 0 {
    return Err(CacheError::Format(format!(
      "encoded length {} is not a multiple of 4",
      input.len()
    )));
  }

  let mut out = Vec::with_capacity(input.len() / 4 * 3);
  for (i, slice) in input.chunks(DECODE_SLICE).enumerate() {
    STANDARD
      .decode_vec(slice, &mut out)
      .map_err(|e| CacheError::Format(format!("invalid base64 near offset {}: {}", i * DECODE_SLICE, e)))?;
  }
  Ok(out)
}
