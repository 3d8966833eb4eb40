//! Ed25519 signing.
//!
//! Identity keys sign prekeys and pairing details, sender keys sign every
//! group message, and the relay's root key signs its certificates.
//! Verification is strict: small-order keys and non-canonical signatures
//! are rejected.

use crate::CryptoError;
use ed25519_dalek::Signer;
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Detached 64-byte signature
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Parse a wire signature.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidSignature`] unless `slice` is 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        <[u8; 64]>::try_from(slice)
            .map(Self)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Wire bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

/// Secret signing key
#[derive(Clone, ZeroizeOnDrop)]
pub struct SigningKey(ed25519_dalek::SigningKey);

impl SigningKey {
    /// New key from `rng`.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(ed25519_dalek::SigningKey::generate(rng))
    }

    /// Public half.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }

    /// Deterministic signature over `message`.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message).to_bytes())
    }

    fn seed(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    fn from_seed(seed: [u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&seed))
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey({})", hex::encode(self.verifying_key().to_bytes()))
    }
}

/// Public verification key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey(ed25519_dalek::VerifyingKey);

impl VerifyingKey {
    /// Decode a compressed point.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidPublicKey`] if the bytes do not decompress.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Decode a point carried in a variable-length field.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidPublicKey`] on a wrong length or bad point.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes = <[u8; 32]>::try_from(slice).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Compressed point bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Check `signature` over `message`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidSignature`] on any mismatch.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0
            .verify_strict(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

crate::serde_hex::hex_serde!(Signature, 64, |bytes| Ok(Signature(bytes)), |sig| sig.0);
crate::serde_hex::hex_serde!(SigningKey, 32, |seed| Ok(SigningKey::from_seed(seed)), SigningKey::seed);
crate::serde_hex::hex_serde!(VerifyingKey, 32, |bytes| VerifyingKey::from_bytes(&bytes), |key| key.to_bytes());
