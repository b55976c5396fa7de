//! Payload masking (RFC 6455 Section 5.3).
//!
//! Masking XORs every payload byte with `key[i % 4]`, so applying the same key
//! twice restores the original bytes.

/// Generates a fresh masking key for an outgoing client frame.
#[inline]
pub(crate) fn generate_key() -> [u8; 4] {
    rand::random()
}

/// Masks or unmasks `buf` in place with `key`.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    // Word-at-a-time for the bulk of the buffer, bytewise for the tail.
    let mut chunks = buf.chunks_exact_mut(8);
    let wide = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ wide;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // 8 is a multiple of 4, so the tail starts at a key boundary.
    apply_mask_bytewise(chunks.into_remainder(), key);
}

#[inline]
fn apply_mask_bytewise(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
