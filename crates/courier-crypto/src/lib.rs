//! # Courier Crypto
//!
//! Key agreement, sealing and session state for the Courier engine.
//!
//! Two layers live here. The transport layer authenticates the relay with
//! a `Noise_XX` handshake ([`handshake`]), checks its certificate
//! ([`certificate`]) and then seals every frame with a per-direction
//! counter ([`frame_cipher`]). The end-to-end layer agrees pairwise
//! sessions over published prekey bundles ([`x3dh`]), advances them with
//! the double ratchet ([`ratchet`]) and fans group messages out under
//! per-sender chains ([`sender_key`]).
//!
//! | Primitive | Choice |
//! |-----------|--------|
//! | Relay handshake | `Noise_XX_25519_ChaChaPoly_BLAKE2s` via `snow` |
//! | Agreement | X25519 |
//! | AEAD | XChaCha20-Poly1305 |
//! | Hash, MAC, KDF | BLAKE3 |
//! | Signatures | Ed25519 |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod certificate;
pub mod error;
pub mod frame_cipher;
pub mod handshake;
pub mod hash;
pub mod identity;
pub mod random;
pub mod ratchet;
pub mod sender_key;
pub mod signatures;
pub mod x25519;
pub mod x3dh;

mod serde_hex;

pub use error::CryptoError;

/// Leading version byte of pairwise, prekey and sender-key messages
pub const MESSAGE_VERSION: u8 = 3;
