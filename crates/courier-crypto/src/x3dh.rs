//! X3DH session agreement.
//!
//! The initiator combines its identity and a fresh base key with the
//! responder's published bundle:
//!
//! ```text
//! DH1 = DH(IK_a, SPK_b)
//! DH2 = DH(EK_a, IK_b)
//! DH3 = DH(EK_a, SPK_b)
//! DH4 = DH(EK_a, OPK_b)   (only when a one-time prekey was available)
//! SK  = HKDF(0xFF * 32 || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! Until the responder replies, every outbound message is wrapped in a
//! [`PreKeyMessage`] carrying the parameters the responder needs to derive
//! the same secret.

use crate::hash::hkdf;
use crate::identity::{IDENTITY_KEY_SIZE, IdentityKey, IdentityKeyPair};
use crate::signatures::Signature;
use crate::x25519::{KeyPair, PrivateKey, PublicKey};
use crate::{CryptoError, MESSAGE_VERSION};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

const X3DH_INFO: &[u8] = b"courier-x3dh";

/// A signed prekey held by the local device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Prekey id
    pub id: u32,
    /// Key pair
    pub key_pair: KeyPair,
    /// Identity signature over the public key
    pub signature: Signature,
    /// Creation time, seconds since the Unix epoch
    pub created_at: u64,
}

impl SignedPreKey {
    /// Generate and sign a new prekey.
    #[must_use]
    pub fn generate(identity: &IdentityKeyPair, id: u32, created_at: u64) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(key_pair.public.as_bytes());
        Self {
            id,
            key_pair,
            signature,
            created_at,
        }
    }
}

/// A one-time prekey held by the local device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Prekey id
    pub id: u32,
    /// Key pair
    pub key_pair: KeyPair,
}

impl OneTimePreKey {
    /// Generate a batch of one-time prekeys with consecutive ids.
    #[must_use]
    pub fn generate_batch(first_id: u32, count: u32) -> Vec<Self> {
        (0..count)
            .map(|i| Self {
                id: first_id.wrapping_add(i),
                key_pair: KeyPair::generate(),
            })
            .collect()
    }
}

/// Published key material of a remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Registration id of the remote device
    pub registration_id: u32,
    /// Remote identity
    pub identity: IdentityKey,
    /// Signed prekey id
    pub signed_prekey_id: u32,
    /// Signed prekey public key
    pub signed_prekey: PublicKey,
    /// Identity signature over the signed prekey
    pub signed_prekey_signature: Signature,
    /// One-time prekey, if the server had one left
    pub one_time_prekey: Option<(u32, PublicKey)>,
}

impl PreKeyBundle {
    /// Check the signed prekey signature against the bundle identity.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not verify.
    pub fn verify(&self) -> Result<(), CryptoError> {
        self.identity
            .signing
            .verify(self.signed_prekey.as_bytes(), &self.signed_prekey_signature)
    }
}

/// Result of the initiator side of X3DH.
pub struct InitiatorAgreement {
    /// Shared secret seeding the Double Ratchet
    pub shared_secret: [u8; 32],
    /// Public base key to send to the responder
    pub base_key: PublicKey,
}

impl Drop for InitiatorAgreement {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// Run X3DH as the initiator against a verified bundle.
///
/// # Errors
///
/// - [`CryptoError::InvalidSignature`] if the bundle signature does not verify
/// - [`CryptoError::InvalidPublicKey`] if any DH yields a low-order result
pub fn initiate(
    local: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<InitiatorAgreement, CryptoError> {
    bundle.verify()?;

    let base = KeyPair::generate();
    let mut secrets = vec![
        dh(&local.agreement.private, &bundle.signed_prekey)?,
        dh(&base.private, &bundle.identity.agreement)?,
        dh(&base.private, &bundle.signed_prekey)?,
    ];
    if let Some((_, one_time)) = &bundle.one_time_prekey {
        secrets.push(dh(&base.private, one_time)?);
    }

    Ok(InitiatorAgreement {
        shared_secret: derive_secret(&mut secrets),
        base_key: base.public,
    })
}

/// Run X3DH as the responder.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if any DH yields a low-order result.
pub fn respond(
    local: &IdentityKeyPair,
    signed_prekey: &KeyPair,
    one_time_prekey: Option<&PrivateKey>,
    remote_identity: &IdentityKey,
    base_key: &PublicKey,
) -> Result<[u8; 32], CryptoError> {
    let mut secrets = vec![
        dh(&signed_prekey.private, &remote_identity.agreement)?,
        dh(&local.agreement.private, base_key)?,
        dh(&signed_prekey.private, base_key)?,
    ];
    if let Some(one_time) = one_time_prekey {
        secrets.push(dh(one_time, base_key)?);
    }

    Ok(derive_secret(&mut secrets))
}

fn dh(private: &PrivateKey, public: &PublicKey) -> Result<[u8; 32], CryptoError> {
    private.diffie_hellman(public).map(|s| *s.as_bytes())
}

fn derive_secret(secrets: &mut [[u8; 32]]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(32 * (secrets.len() + 1));
    ikm.extend_from_slice(&[0xFF; 32]);
    for secret in secrets.iter() {
        ikm.extend_from_slice(secret);
    }

    let mut out = [0u8; 32];
    hkdf(&[0u8; 32], &ikm, X3DH_INFO, &mut out);

    ikm.zeroize();
    for secret in secrets.iter_mut() {
        secret.zeroize();
    }
    out
}

/// First message(s) of a new session, carrying the X3DH parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    /// Initiator registration id
    pub registration_id: u32,
    /// One-time prekey consumed, if any
    pub one_time_prekey_id: Option<u32>,
    /// Signed prekey used
    pub signed_prekey_id: u32,
    /// Initiator base key
    pub base_key: PublicKey,
    /// Initiator identity
    pub identity: IdentityKey,
    /// Encoded inner [`crate::ratchet::RatchetMessage`]
    pub message: Vec<u8>,
}

const PREKEY_FIXED_LEN: usize = 1 + 4 + 1 + 4 + 4 + 32 + IDENTITY_KEY_SIZE;

impl PreKeyMessage {
    /// Serialize the message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREKEY_FIXED_LEN + self.message.len());
        out.push(MESSAGE_VERSION);
        out.extend_from_slice(&self.registration_id.to_be_bytes());
        match self.one_time_prekey_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&[0u8; 4]);
            }
        }
        out.extend_from_slice(&self.signed_prekey_id.to_be_bytes());
        out.extend_from_slice(self.base_key.as_bytes());
        out.extend_from_slice(&self.identity.to_bytes());
        out.extend_from_slice(&self.message);
        out
    }

    /// Parse a serialized message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] on truncation or a bad version,
    /// and [`CryptoError::InvalidPublicKey`] on a malformed identity.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() <= PREKEY_FIXED_LEN {
            return Err(CryptoError::InvalidMessage("prekey message too short".into()));
        }
        if bytes[0] != MESSAGE_VERSION {
            return Err(CryptoError::InvalidMessage(format!(
                "unsupported message version {}",
                bytes[0]
            )));
        }

        let u32_at = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let registration_id = u32_at(1);
        let one_time_prekey_id = match bytes[5] {
            0 => None,
            1 => Some(u32_at(6)),
            flag => {
                return Err(CryptoError::InvalidMessage(format!(
                    "bad one-time prekey flag {flag}"
                )));
            }
        };
        let signed_prekey_id = u32_at(10);
        let base_key = PublicKey::from_slice(&bytes[14..46]).ok_or(CryptoError::InvalidPublicKey)?;
        let identity = IdentityKey::from_slice(&bytes[46..46 + IDENTITY_KEY_SIZE])?;

        Ok(Self {
            registration_id,
            one_time_prekey_id,
            signed_prekey_id,
            base_key,
            identity,
            message: bytes[PREKEY_FIXED_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob_bundle(
        bob: &IdentityKeyPair,
        spk: &SignedPreKey,
        opk: Option<&OneTimePreKey>,
    ) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: 42,
            identity: bob.public(),
            signed_prekey_id: spk.id,
            signed_prekey: spk.key_pair.public,
            signed_prekey_signature: spk.signature,
            one_time_prekey: opk.map(|k| (k.id, k.key_pair.public)),
        }
    }

    #[test]
    fn test_agreement_with_one_time_prekey() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(&bob, 1, 0);
        let opk = OneTimePreKey::generate_batch(100, 1).remove(0);

        let agreement = initiate(&alice, &bob_bundle(&bob, &spk, Some(&opk))).unwrap();
        let secret = respond(
            &bob,
            &spk.key_pair,
            Some(&opk.key_pair.private),
            &alice.public(),
            &agreement.base_key,
        )
        .unwrap();

        assert_eq!(agreement.shared_secret, secret);
    }

    #[test]
    fn test_agreement_without_one_time_prekey() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(&bob, 1, 0);

        let agreement = initiate(&alice, &bob_bundle(&bob, &spk, None)).unwrap();
        let secret = respond(&bob, &spk.key_pair, None, &alice.public(), &agreement.base_key).unwrap();

        assert_eq!(agreement.shared_secret, secret);
    }

    #[test]
    fn test_forged_bundle_rejected() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(&mallory, 1, 0);

        let bundle = bob_bundle(&bob, &spk, None);
        assert!(matches!(initiate(&alice, &bundle), Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn test_prekey_message_encoding() {
        let alice = IdentityKeyPair::generate();
        let message = PreKeyMessage {
            registration_id: 1234,
            one_time_prekey_id: Some(7),
            signed_prekey_id: 3,
            base_key: KeyPair::generate().public,
            identity: alice.public(),
            message: vec![1, 2, 3],
        };

        let decoded = PreKeyMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);

        let without = PreKeyMessage {
            one_time_prekey_id: None,
            ..message
        };
        assert_eq!(PreKeyMessage::decode(&without.encode()).unwrap(), without);
    }

    #[test]
    fn test_prekey_message_truncated() {
        let alice = IdentityKeyPair::generate();
        let encoded = PreKeyMessage {
            registration_id: 1,
            one_time_prekey_id: None,
            signed_prekey_id: 1,
            base_key: KeyPair::generate().public,
            identity: alice.public(),
            message: vec![9],
        }
        .encode();

        for len in 0..encoded.len() {
            assert!(PreKeyMessage::decode(&encoded[..len]).is_err());
        }
    }
}
