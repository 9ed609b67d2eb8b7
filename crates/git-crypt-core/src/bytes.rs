//! Byte-level helpers shared by the key-file codec and the crypto pipeline.
//!
//! The two security-sensitive pieces live here so they exist exactly once:
//! a comparison whose timing does not depend on where two buffers differ,
//! and a wipe that the optimizer cannot drop.

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Store a 32-bit integer big-endian into the first four bytes of `buf`.
///
/// Panics if `buf` is shorter than four bytes; callers size their buffers.
pub fn store_be32(buf: &mut [u8], value: u32) {
    buf[..4].copy_from_slice(&value.to_be_bytes());
}

/// Load a 32-bit big-endian integer from the first four bytes of `buf`.
pub fn load_be32(buf: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[..4]);
    u32::from_be_bytes(raw)
}

/// Compare two byte strings in time dependent only on their length.
///
/// Differing lengths compare unequal immediately; that leaks only the
/// lengths, which are public in every use here (nonces, digests).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Overwrite a secret buffer with zeroes, resisting dead-store elimination.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}
