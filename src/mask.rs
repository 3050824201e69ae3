//! WebSocket frame masking utilities
//!
//! Every client-originated frame is masked with a fresh 4-byte key.
//! Supports two RNG backends via feature flags:
//! - `fastrand`: fast PRNG (default)
//! - `getrandom`: cryptographically secure RNG

/// XOR `data` in place with the repeating 4-byte `mask`
///
/// Masking and unmasking are the same operation.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    if data.is_empty() {
        return;
    }

    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Generate a random mask for a client frame
///
/// If both RNG features are enabled, `getrandom` wins.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    generate_mask_inner()
}

#[cfg(feature = "getrandom")]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        // An all-zero key is still a valid mask.
        return [0; 4];
    }
    buf
}

#[cfg(all(feature = "fastrand", not(feature = "getrandom")))]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom")))]
fn generate_mask_inner() -> [u8; 4] {
    compile_error!("At least one RNG feature must be enabled: fastrand or getrandom");
}
