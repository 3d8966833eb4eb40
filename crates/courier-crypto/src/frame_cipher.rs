//! Post-handshake frame encryption.
//!
//! Every frame body is `counter (u64 BE) || ciphertext || tag`. The counter
//! feeds the nonce and is bound as associated data. Counters start at zero
//! after each handshake and must arrive strictly in sequence: the opener
//! rejects anything other than the next expected value.
//!
//! The sealing and opening halves are separate values so the read loop and
//! the write path can own them independently.

use crate::CryptoError;
use crate::aead::{AeadKey, Nonce, NonceDomain, TAG_SIZE};
use crate::handshake::TransportKeys;

/// Size of the clear counter prefix on every sealed frame
pub const COUNTER_SIZE: usize = 8;

/// Minimum size of a sealed frame body
pub const MIN_SEALED_LEN: usize = COUNTER_SIZE + TAG_SIZE;

/// Sending half of the transport cipher.
pub struct FrameSealer {
    key: AeadKey,
    counter: u64,
}

/// Receiving half of the transport cipher.
pub struct FrameOpener {
    key: AeadKey,
    expected: u64,
}

impl TransportKeys {
    /// Split the transport keys into independent sealing and opening halves.
    #[must_use]
    pub fn into_ciphers(self) -> (FrameSealer, FrameOpener) {
        (
            FrameSealer {
                key: self.send,
                counter: 0,
            },
            FrameOpener {
                key: self.recv,
                expected: 0,
            },
        )
    }
}

impl FrameSealer {
    /// Create a sealer starting at counter zero.
    #[must_use]
    pub fn new(key: AeadKey) -> Self {
        Self { key, counter: 0 }
    }

    /// Counter the next sealed frame will carry.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Encrypt one frame body.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] once the counter space is exhausted.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }

        let counter_bytes = self.counter.to_be_bytes();
        let nonce = Nonce::new(NonceDomain::Frame, self.counter);
        let ciphertext = self.key.seal(&nonce, plaintext, &counter_bytes)?;

        let mut out = Vec::with_capacity(COUNTER_SIZE + ciphertext.len());
        out.extend_from_slice(&counter_bytes);
        out.extend_from_slice(&ciphertext);

        self.counter += 1;
        Ok(out)
    }
}

impl FrameOpener {
    /// Create an opener expecting counter zero.
    #[must_use]
    pub fn new(key: AeadKey) -> Self {
        Self { key, expected: 0 }
    }

    /// Counter the next accepted frame must carry.
    #[must_use]
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Decrypt one frame body.
    ///
    /// The expected counter only advances on success.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidMessage`] if the body is shorter than counter plus tag
    /// - [`CryptoError::FrameOrder`] if the counter is not the next expected value
    /// - [`CryptoError::DecryptionFailed`] on authentication failure
    pub fn open(&mut self, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if body.len() < MIN_SEALED_LEN {
            return Err(CryptoError::InvalidMessage(format!(
                "sealed frame too short: {} bytes",
                body.len()
            )));
        }

        let mut counter_bytes = [0u8; COUNTER_SIZE];
        counter_bytes.copy_from_slice(&body[..COUNTER_SIZE]);
        let received = u64::from_be_bytes(counter_bytes);

        if received != self.expected {
            return Err(CryptoError::FrameOrder {
                expected: self.expected,
                received,
            });
        }

        let nonce = Nonce::new(NonceDomain::Frame, received);
        let plaintext = self
            .key
            .open(&nonce, &body[COUNTER_SIZE..], &counter_bytes)?;

        self.expected += 1;
        Ok(plaintext)
    }
}
