//! `XChaCha20-Poly1305` sealing for transport frames and ratchet messages.
//!
//! Every key in Courier is used under exactly one [`NonceDomain`]; the
//! domain salt fills the upper 16 nonce bytes and a per-key counter the
//! lower 8, so the same counter under two domains never shares a nonce.
//!
//! ```
//! use courier_crypto::aead::{AeadKey, Nonce, NonceDomain};
//!
//! let key = AeadKey::new([7u8; 32]);
//! let nonce = Nonce::new(NonceDomain::Frame, 0);
//! let sealed = key.seal(&nonce, b"stanza", b"header").unwrap();
//! assert_eq!(key.open(&nonce, &sealed, b"header").unwrap(), b"stanza");
//! ```

use crate::CryptoError;
use chacha20poly1305::XChaCha20Poly1305;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use zeroize::ZeroizeOnDrop;

/// Poly1305 tag appended to every sealed body
pub const TAG_SIZE: usize = 16;

const NONCE_SIZE: usize = 24;

/// Where a key is used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceDomain {
    /// Transport frames, counter per direction
    Frame,
    /// Ratchet message keys, used once
    Message,
}

impl NonceDomain {
    fn salt(self) -> &'static [u8; 16] {
        match self {
            Self::Frame => b"courier-frame-v1",
            Self::Message => b"courier-msg-key\0",
        }
    }
}

/// 192-bit nonce
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Nonce for the `counter`-th use of a key in `domain`.
    #[must_use]
    pub fn new(domain: NonceDomain, counter: u64) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..8].copy_from_slice(&counter.to_le_bytes());
        bytes[8..].copy_from_slice(domain.salt());
        Self(bytes)
    }
}

/// 256-bit symmetric key, wiped on drop
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; 32]);

impl AeadKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }

    /// Encrypt `plaintext`, binding `aad`. The tag is appended.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the cipher rejects the input.
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .encrypt(
                (&nonce.0).into(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Authenticate and decrypt `sealed`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] for a short body, a wrong
    /// key, nonce or `aad`, or any tampering.
    pub fn open(&self, nonce: &Nonce, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        self.cipher()
            .decrypt((&nonce.0).into(), Payload { msg: sealed, aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = AeadKey::new([3u8; 32]);
        let nonce = Nonce::new(NonceDomain::Frame, 7);

        let sealed = key.seal(&nonce, b"hello", b"aad").unwrap();
        assert_eq!(sealed.len(), 5 + TAG_SIZE);
        assert_eq!(key.open(&nonce, &sealed, b"aad").unwrap(), b"hello");
        assert_eq!(
            key.open(&nonce, &sealed, b"other"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_domains_do_not_share_nonces() {
        let key = AeadKey::new([3u8; 32]);
        let frame = key.seal(&Nonce::new(NonceDomain::Frame, 0), b"x", b"").unwrap();
        let message = key.seal(&Nonce::new(NonceDomain::Message, 0), b"x", b"").unwrap();
        assert_ne!(frame, message);
        assert!(key.open(&Nonce::new(NonceDomain::Message, 0), &frame, b"").is_err());
    }

    #[test]
    fn test_short_body_rejected() {
        let key = AeadKey::new([1u8; 32]);
        let nonce = Nonce::new(NonceDomain::Frame, 0);
        assert!(key.open(&nonce, &[0u8; TAG_SIZE - 1], b"").is_err());
    }
}
