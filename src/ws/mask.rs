//! XOR payload masking (RFC 6455 Section 5.3).
//!
//! Client-to-server payloads are masked with a 4-byte key XORed cyclically
//! over the payload. Masking is its own inverse, so the same routine
//! unmasks. Long payloads go through a wide-chunk fast path that XORs
//! register-width blocks against a broadcast copy of the key; the remainder
//! falls back to the byte-wise loop. Both paths must produce identical
//! output for every input.

/// Payloads shorter than this skip the wide path; the setup cost would
/// exceed the win.
const WIDE_THRESHOLD: usize = 32;

const WIDE: usize = std::mem::size_of::<u64>();

/// Apply the 4-byte mask to `payload` in place.
///
/// Used for both masking (client encode) and unmasking (server decode).
pub fn apply_mask(key: [u8; 4], payload: &mut [u8]) {
    if payload.len() < WIDE_THRESHOLD {
        apply_mask_scalar(key, payload);
        return;
    }

    // Broadcast the key across a full word. The chunk width is a multiple
    // of 4, so the key phase stays aligned across chunks.
    let mut wide_key = [0u8; WIDE];
    for (i, byte) in wide_key.iter_mut().enumerate() {
        *byte = key[i % 4];
    }
    let wide_key = u64::from_ne_bytes(wide_key);

    let mut chunks = payload.chunks_exact_mut(WIDE);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().expect("chunk is WIDE bytes"));
        chunk.copy_from_slice(&(word ^ wide_key).to_ne_bytes());
    }
    apply_mask_scalar(key, chunks.into_remainder());
}

/// Byte-wise reference loop: `payload[i] ^= key[i % 4]`.
///
/// Also used directly for the tail left over by the wide path; the tail
/// starts at a multiple of the chunk width, so its key phase is zero.
fn apply_mask_scalar(key: [u8; 4], payload: &mut [u8]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}
