//! Errors raised by the Courier cryptographic layer.

use thiserror::Error;

/// Cryptographic failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    // Primitives
    /// Cipher refused to seal
    #[error("encryption failed")]
    EncryptionFailed,

    /// Tag mismatch, wrong key or truncated ciphertext
    #[error("decryption failed")]
    DecryptionFailed,

    /// Signature did not verify or was malformed
    #[error("bad signature")]
    InvalidSignature,

    /// Key bytes are not a usable point
    #[error("bad public key")]
    InvalidPublicKey,

    /// OS randomness unavailable
    #[error("os random source failed")]
    RandomFailed,

    // Transport
    /// Noise exchange could not complete
    #[error("noise handshake: {0}")]
    HandshakeFailed(String),

    /// Relay certificate rejected
    #[error("server certificate: {0}")]
    InvalidCertificate(String),

    /// Send counter reached its limit
    #[error("frame counter exhausted")]
    NonceOverflow,

    /// Frame carried a counter other than the next one
    #[error("frame counter {received}, expected {expected}")]
    FrameOrder {
        /// Next counter the opener accepts
        expected: u64,
        /// Counter on the wire
        received: u64,
    },

    // Sessions
    /// Operation not valid in the current session state
    #[error("session not in a state for this operation")]
    InvalidState,

    /// Wire message could not be parsed
    #[error("malformed message: {0}")]
    InvalidMessage(String),

    /// Message lies beyond the skipped-key window
    #[error("{requested} skipped keys exceeds limit {limit}")]
    TooManySkipped {
        /// Keys that would need caching
        requested: u32,
        /// Configured window
        limit: u32,
    },

    /// Message key was already used
    #[error("duplicate message")]
    ReplayDetected,

    /// One-time prekey is not held locally
    #[error("unknown prekey {0}")]
    UnknownPreKey(u32),

    /// Group message names another sender key
    #[error("sender key {received} does not match stored key {expected}")]
    SenderKeyMismatch {
        /// Stored key id
        expected: u32,
        /// Key id in the message
        received: u32,
    },
}
