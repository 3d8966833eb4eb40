//! BLAKE3 hashing, MACs and key derivation.
//!
//! Derivation is extract-then-expand in the shape of RFC 5869, with keyed
//! BLAKE3 as the PRF and its XOF for expansion.

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// 32-byte digest
pub type Digest = [u8; 32];

/// Plain BLAKE3.
#[must_use]
pub fn hash(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

/// Keyed BLAKE3 MAC.
#[must_use]
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> Digest {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// Compare a received MAC against the expected one in constant time.
#[must_use]
pub fn verify_mac(expected: &[u8], received: &[u8]) -> bool {
    expected.len() == received.len() && bool::from(expected.ct_eq(received))
}

/// Fill `out` with key material derived from `ikm`.
///
/// An empty `salt` extracts with an unkeyed hash.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) {
    let mut prk = if salt.is_empty() {
        hash(ikm)
    } else {
        keyed_hash(&hash(salt), ikm)
    };
    blake3::Hasher::new_keyed(&prk)
        .update(info)
        .finalize_xof()
        .fill(out);
    prk.zeroize();
}

/// Two independent keys from one derivation, as used by every ratchet step.
#[must_use]
pub fn hkdf2(salt: &[u8], ikm: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut okm = [0u8; 64];
    hkdf(salt, ikm, info, &mut okm);

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (first, second)
}
