//! Byte-level text checks shared by the WebSocket and SSE carriers
//!
//! The hot path here is [`is_ascii_fast`]: outgoing WebSocket text frames
//! are overwhelmingly plain-ASCII JSON, and an 8-byte-stride scan lets the
//! send path skip full UTF-8 validation for them. Full validation runs only
//! when a high bit is seen, which is the only case where it can fail.

/// Mask with the high bit of every byte in a `u64` lane set.
const HIGH_BITS: u64 = 0x8080_8080_8080_8080;

/// Returns `true` when `data` contains only 7-bit ASCII bytes.
///
/// Scans eight bytes per step by masking a `u64` lane against the high
/// bits, then falls back to a plain byte scan for the unaligned tail.
pub fn is_ascii_fast(data: &[u8]) -> bool {
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let lane = u64::from_ne_bytes(chunk.try_into().unwrap());
        if lane & HIGH_BITS != 0 {
            return false;
        }
    }
    chunks.remainder().iter().all(|b| b & 0x80 == 0)
}

/// Validates that `data` is well-formed UTF-8, taking the ASCII fast path
/// first.
///
/// Returns `false` only for byte sequences that are not valid UTF-8.
pub fn is_valid_utf8(data: &[u8]) -> bool {
    if is_ascii_fast(data) {
        return true;
    }
    std::str::from_utf8(data).is_ok()
}

/// Returns `true` when `text` is legal inside an SSE field value.
///
/// SSE fields may not contain ASCII control characters; `\n`, `\r` and
/// `\t` are the permitted exceptions (newlines are re-framed by the
/// writer, never emitted raw).
pub fn is_valid_sse_text(text: &str) -> bool {
    text.bytes()
        .all(|b| b >= 0x20 || b == b'\n' || b == b'\r' || b == b'\t')
}

/// Returns `true` when every byte of `id` is visible ASCII (0x21..=0x7E).
///
/// Session identifiers must satisfy this in addition to the SSE text rule;
/// spaces are not allowed.
pub fn is_visible_ascii(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| (0x21..=0x7E).contains(&b))
}

/// Returns `true` when `id` is acceptable as a `Last-Event-ID` value.
///
/// Only `[A-Za-z0-9_-]` is accepted; anything else (including empty
/// strings) is ignored by the caller rather than rejected with an error.
pub fn is_valid_event_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
