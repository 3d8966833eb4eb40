//! Long-term device identity.
//!
//! An identity is an X25519 agreement key used in X3DH together with an
//! Ed25519 key that signs prekeys. The public half is published as a
//! 64-byte `agreement || signing` encoding.

use crate::CryptoError;
use crate::signatures::{Signature, SigningKey, VerifyingKey};
use crate::x25519::{KeyPair, PublicKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

/// Encoded size of a public identity
pub const IDENTITY_KEY_SIZE: usize = 64;

/// Public identity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKey {
    /// X25519 agreement key
    pub agreement: PublicKey,
    /// Ed25519 signing key
    pub signing: VerifyingKey,
}

impl IdentityKey {
    /// Encode as `agreement || signing`.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_SIZE] {
        let mut out = [0u8; IDENTITY_KEY_SIZE];
        out[..32].copy_from_slice(self.agreement.as_bytes());
        out[32..].copy_from_slice(&self.signing.to_bytes());
        out
    }

    /// Decode from the 64-byte encoding.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] on a wrong length or an invalid signing key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != IDENTITY_KEY_SIZE {
            return Err(CryptoError::InvalidPublicKey);
        }
        let agreement = PublicKey::from_slice(&bytes[..32]).ok_or(CryptoError::InvalidPublicKey)?;
        let signing = VerifyingKey::from_slice(&bytes[32..])?;
        Ok(Self { agreement, signing })
    }

    /// Short fingerprint for logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(&crate::hash::hash(&self.to_bytes())[..8])
    }
}

/// Private identity of the local device.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    /// X25519 agreement key pair
    pub agreement: KeyPair,
    /// Ed25519 signing key
    pub signing: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            agreement: KeyPair::generate(),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Public half.
    #[must_use]
    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            agreement: self.agreement.public,
            signing: self.signing.verifying_key(),
        }
    }

    /// Sign with the identity's Ed25519 key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.public().fingerprint())
            .finish_non_exhaustive()
    }
}
