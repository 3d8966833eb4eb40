//! Curve25519 agreement keys.
//!
//! Noise static and ephemeral keys, ratchet keys, prekeys and the
//! agreement half of identity keys are all [`KeyPair`]s. Agreement with a
//! low-order point is refused rather than yielding the all-zero secret.

use crate::CryptoError;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Agreement key pair
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    /// Secret scalar
    pub private: PrivateKey,
    /// Public point
    pub public: PublicKey,
}

impl KeyPair {
    /// Fresh pair from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_private(PrivateKey(x25519_dalek::StaticSecret::random_from_rng(OsRng)))
    }

    /// Pair for an existing secret.
    #[must_use]
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", hex::encode(self.public.as_bytes()))
    }
}

/// Secret scalar, clamped on use
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

impl PrivateKey {
    /// Restore a stored scalar.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes.into())
    }

    /// Raw scalar bytes for persistence.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Matching public point.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey((&self.0).into())
    }

    /// X25519 agreement with `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] when `remote` is a
    /// low-order point.
    pub fn diffie_hellman(&self, remote: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&remote.0);
        if shared.was_contributory() {
            Ok(SharedSecret(shared))
        } else {
            Err(CryptoError::InvalidPublicKey)
        }
    }
}

/// Public point
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    /// Wrap raw point bytes. Every 32-byte string is a valid encoding.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes.into())
    }

    /// Wrap a slice, `None` unless it is exactly 32 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(slice).ok().map(Self::from_bytes)
    }

    /// Point bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Owned copy of the point bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

/// Raw agreement output. Always fed through a KDF before use.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl SharedSecret {
    /// Secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

crate::serde_hex::hex_serde!(PublicKey, 32, |bytes| Ok(PublicKey::from_bytes(bytes)), |key| key.to_bytes());
crate::serde_hex::hex_serde!(PrivateKey, 32, |bytes| Ok(PrivateKey::from_bytes(bytes)), |key| key.to_bytes());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let ab = alice.private.diffie_hellman(&bob.public).unwrap();
        let ba = bob.private.diffie_hellman(&alice.public).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_low_order_point_refused() {
        let pair = KeyPair::generate();
        assert!(matches!(
            pair.private.diffie_hellman(&PublicKey::from_bytes([0u8; 32])),
            Err(CryptoError::InvalidPublicKey)
        ));
    }

    #[test]
    fn test_from_slice_length() {
        assert!(PublicKey::from_slice(&[1u8; 31]).is_none());
        assert!(PublicKey::from_slice(&[1u8; 32]).is_some());
    }

    #[test]
    fn test_keypair_json_is_hex() {
        let pair = KeyPair::generate();
        let json = serde_json::to_string(&pair).unwrap();
        assert!(json.contains(&hex::encode(pair.public.as_bytes())));

        let restored: KeyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.public, pair.public);
        assert_eq!(restored.private.public_key(), pair.public);
    }

    // RFC 7748 section 5.2, first vector
    #[test]
    fn test_rfc7748_vector() {
        let scalar =
            hex::decode("a546e36bf0527c9d3b16154b82465edd62144c0ac1fc5a18506a2244ba449ac4").unwrap();
        let point =
            hex::decode("e6db6867583030db3594c1a424b15f7c726624ec26b3353b10a903a6d0ab1c4c").unwrap();

        let private = PrivateKey::from_bytes(scalar.try_into().unwrap());
        let shared = private
            .diffie_hellman(&PublicKey::from_slice(&point).unwrap())
            .unwrap();
        assert_eq!(
            hex::encode(shared.as_bytes()),
            "c3da55379de9c6908e94ea4df28d084f32eccf03491c71f754b4075577a28552"
        );
    }
}
