//! Forward secrecy key ratcheting.
//!
//! Implements the symmetric chain ratchet and the Double Ratchet used by
//! pairwise sessions. Each message advances a chain key and derives a
//! one-time message key; each change of the peer's ratchet key performs a
//! DH step through the root key.
//!
//! Out-of-order delivery is handled with a bounded cache of skipped message
//! keys. A message further ahead than `max_skip` is rejected with
//! [`CryptoError::TooManySkipped`], and a failed decryption leaves the
//! ratchet exactly as it was before the call.

use crate::aead::{AeadKey, Nonce, NonceDomain, TAG_SIZE};
use crate::hash::hkdf2;
use crate::x25519::{KeyPair, PublicKey};
use crate::{CryptoError, MESSAGE_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use zeroize::{Zeroize, ZeroizeOnDrop};

const ROOT_INFO: &[u8] = b"courier-ratchet-root";

/// Encoded ratchet header size (`dh || previous_chain_length || counter`)
pub const HEADER_SIZE: usize = 32 + 4 + 4;

/// Chain key for symmetric ratcheting
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct ChainKey(#[serde(with = "crate::serde_hex")] [u8; 32]);

impl ChainKey {
    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw chain key bytes, needed when distributing a sender key
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Ratchet forward and derive message key
    pub fn ratchet(&mut self) -> MessageKey {
        let old_key = self.0;

        // chain_key[n+1] = BLAKE3(chain_key[n] || 0x01)
        let mut hasher = blake3::Hasher::new();
        hasher.update(&old_key);
        hasher.update(&[0x01]);
        self.0.copy_from_slice(hasher.finalize().as_bytes());

        // message_key[n] = BLAKE3(chain_key[n] || 0x02)
        let mut hasher = blake3::Hasher::new();
        hasher.update(&old_key);
        hasher.update(&[0x02]);
        let mut msg_key = [0u8; 32];
        msg_key.copy_from_slice(hasher.finalize().as_bytes());

        MessageKey(msg_key)
    }
}

/// Message key derived from chain key
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct MessageKey(#[serde(with = "crate::serde_hex")] [u8; 32]);

impl MessageKey {
    /// Get the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encrypt a single message under this key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if AEAD encryption fails.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        AeadKey::new(self.0).seal(&Nonce::new(NonceDomain::Message, 0), plaintext, aad)
    }

    /// Decrypt a single message under this key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on authentication failure.
    pub fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        AeadKey::new(self.0).open(&Nonce::new(NonceDomain::Message, 0), ciphertext, aad)
    }
}

/// Header carried in the clear with every ratchet message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key
    pub dh: PublicKey,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Index of this message in the current sending chain
    pub counter: u32,
}

impl RatchetHeader {
    /// Encode the header.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..32].copy_from_slice(self.dh.as_bytes());
        out[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out[36..].copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        let dh = PublicKey::from_slice(bytes.get(..32)?)?;
        let previous_chain_length = u32::from_be_bytes(bytes.get(32..36)?.try_into().ok()?);
        let counter = u32::from_be_bytes(bytes.get(36..40)?.try_into().ok()?);
        Some(Self {
            dh,
            previous_chain_length,
            counter,
        })
    }
}

/// An encrypted pairwise message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Clear header
    pub header: RatchetHeader,
    /// AEAD ciphertext with tag
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Serialize as `version || header || ciphertext`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + HEADER_SIZE + self.ciphertext.len());
        out.push(MESSAGE_VERSION);
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse a serialized message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] on a bad version or truncated input.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < 1 + HEADER_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidMessage("ratchet message too short".into()));
        }
        if bytes[0] != MESSAGE_VERSION {
            return Err(CryptoError::InvalidMessage(format!(
                "unsupported message version {}",
                bytes[0]
            )));
        }
        let header = RatchetHeader::from_slice(&bytes[1..1 + HEADER_SIZE])
            .ok_or_else(|| CryptoError::InvalidMessage("bad ratchet header".into()))?;
        Ok(Self {
            header,
            ciphertext: bytes[1 + HEADER_SIZE..].to_vec(),
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh: PublicKey,
    counter: u32,
    key: MessageKey,
}

/// Double Ratchet state for one pairwise session.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct DoubleRatchet {
    #[serde(with = "crate::serde_hex")]
    root_key: [u8; 32],
    #[zeroize(skip)]
    dh_self: KeyPair,
    #[zeroize(skip)]
    dh_remote: Option<PublicKey>,
    sending: Option<ChainKey>,
    receiving: Option<ChainKey>,
    #[zeroize(skip)]
    send_count: u32,
    #[zeroize(skip)]
    recv_count: u32,
    #[zeroize(skip)]
    previous_send_count: u32,
    #[zeroize(skip)]
    skipped: VecDeque<SkippedKey>,
    #[zeroize(skip)]
    max_skip: u32,
}

impl DoubleRatchet {
    /// Initialize the side that sends first (the X3DH initiator).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if `remote_ratchet` is a low-order point.
    pub fn init_initiator(
        shared_secret: [u8; 32],
        remote_ratchet: PublicKey,
        max_skip: u32,
    ) -> Result<Self, CryptoError> {
        let dh_self = KeyPair::generate();
        let dh = dh_self
            .private
            .diffie_hellman(&remote_ratchet)?;
        let (root_key, chain) = hkdf2(&shared_secret, dh.as_bytes(), ROOT_INFO);

        Ok(Self {
            root_key,
            dh_self,
            dh_remote: Some(remote_ratchet),
            sending: Some(ChainKey(chain)),
            receiving: None,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped: VecDeque::new(),
            max_skip,
        })
    }

    /// Initialize the side that receives first, using the signed prekey as
    /// its initial ratchet key.
    #[must_use]
    pub fn init_responder(shared_secret: [u8; 32], own_ratchet: KeyPair, max_skip: u32) -> Self {
        Self {
            root_key: shared_secret,
            dh_self: own_ratchet,
            dh_remote: None,
            sending: None,
            receiving: None,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped: VecDeque::new(),
            max_skip,
        }
    }

    /// Whether this side can encrypt yet.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.sending.is_some()
    }

    /// Number of skipped message keys currently held.
    #[must_use]
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Configured skip window.
    #[must_use]
    pub fn max_skip(&self) -> u32 {
        self.max_skip
    }

    /// Encrypt a message, advancing the sending chain.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] before the first inbound message
    /// on the responder side.
    pub fn encrypt(&mut self, plaintext: &[u8], ad: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let chain = self.sending.as_mut().ok_or(CryptoError::InvalidState)?;
        let key = chain.ratchet();

        let header = RatchetHeader {
            dh: self.dh_self.public,
            previous_chain_length: self.previous_send_count,
            counter: self.send_count,
        };
        let ciphertext = key.encrypt(plaintext, &associated_data(ad, &header))?;
        self.send_count += 1;

        Ok(RatchetMessage { header, ciphertext })
    }

    /// Decrypt a message.
    ///
    /// On any error the ratchet is restored to its state before the call.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::TooManySkipped`] if the message is beyond the skip window
    /// - [`CryptoError::ReplayDetected`] if the message key was already used
    /// - [`CryptoError::DecryptionFailed`] on authentication failure
    pub fn decrypt(&mut self, message: &RatchetMessage, ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let snapshot = self.clone();
        match self.try_decrypt(message, ad) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                *self = snapshot;
                Err(e)
            }
        }
    }

    fn try_decrypt(&mut self, message: &RatchetMessage, ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let header = &message.header;
        let aad = associated_data(ad, header);

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|k| k.dh == header.dh && k.counter == header.counter)
        {
            let skipped = self.skipped.remove(pos).ok_or(CryptoError::InvalidState)?;
            return skipped.key.decrypt(&message.ciphertext, &aad);
        }

        if self.dh_remote != Some(header.dh) {
            self.skip_to(header.previous_chain_length)?;
            self.dh_ratchet(header.dh)?;
        }

        if header.counter < self.recv_count {
            return Err(CryptoError::ReplayDetected);
        }
        self.skip_to(header.counter)?;

        let chain = self.receiving.as_mut().ok_or(CryptoError::InvalidState)?;
        let key = chain.ratchet();
        self.recv_count += 1;

        key.decrypt(&message.ciphertext, &aad)
    }

    fn skip_to(&mut self, until: u32) -> Result<(), CryptoError> {
        let Some(chain) = self.receiving.as_mut() else {
            return Ok(());
        };
        if until <= self.recv_count {
            return Ok(());
        }

        let gap = until - self.recv_count;
        if gap > self.max_skip {
            return Err(CryptoError::TooManySkipped {
                requested: gap,
                limit: self.max_skip,
            });
        }

        let dh = self.dh_remote.ok_or(CryptoError::InvalidState)?;
        while self.recv_count < until {
            self.skipped.push_back(SkippedKey {
                dh,
                counter: self.recv_count,
                key: chain.ratchet(),
            });
            if self.skipped.len() > self.max_skip as usize {
                self.skipped.pop_front();
            }
            self.recv_count += 1;
        }
        Ok(())
    }

    fn dh_ratchet(&mut self, remote: PublicKey) -> Result<(), CryptoError> {
        self.previous_send_count = self.send_count;
        self.send_count = 0;
        self.recv_count = 0;
        self.dh_remote = Some(remote);

        let dh = self
            .dh_self
            .private
            .diffie_hellman(&remote)?;
        let (root_key, chain) = hkdf2(&self.root_key, dh.as_bytes(), ROOT_INFO);
        self.root_key = root_key;
        self.receiving = Some(ChainKey(chain));

        self.dh_self = KeyPair::generate();
        let dh = self
            .dh_self
            .private
            .diffie_hellman(&remote)?;
        let (root_key, chain) = hkdf2(&self.root_key, dh.as_bytes(), ROOT_INFO);
        self.root_key = root_key;
        self.sending = Some(ChainKey(chain));

        tracing::trace!("DH ratchet step, previous chain length {}", self.previous_send_count);
        Ok(())
    }
}

fn associated_data(ad: &[u8], header: &RatchetHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(ad.len() + HEADER_SIZE);
    out.extend_from_slice(ad);
    out.extend_from_slice(&header.to_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const AD: &[u8] = b"alice-identity||bob-identity";

    fn pair(max_skip: u32) -> (DoubleRatchet, DoubleRatchet) {
        let shared = [0x5Au8; 32];
        let bob_ratchet = KeyPair::generate();
        let alice = DoubleRatchet::init_initiator(shared, bob_ratchet.public, max_skip).unwrap();
        let bob = DoubleRatchet::init_responder(shared, bob_ratchet, max_skip);
        (alice, bob)
    }

    #[test]
    fn test_ratchet_produces_different_keys() {
        let mut chain = ChainKey::from_bytes([0x42u8; 32]);

        let key1 = chain.ratchet();
        let key2 = chain.ratchet();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_roundtrip_both_directions() {
        let (mut alice, mut bob) = pair(10);
        assert!(!bob.can_send());

        let m1 = alice.encrypt(b"hello bob", AD).unwrap();
        assert_eq!(bob.decrypt(&m1, AD).unwrap(), b"hello bob");
        assert!(bob.can_send());

        let reply = bob.encrypt(b"hello alice", AD).unwrap();
        assert_eq!(alice.decrypt(&reply, AD).unwrap(), b"hello alice");

        let m2 = alice.encrypt(b"again", AD).unwrap();
        assert_ne!(m1.header.dh, m2.header.dh);
        assert_eq!(bob.decrypt(&m2, AD).unwrap(), b"again");
    }

    #[test]
    fn test_one_behind_recovers_via_skipped_key() {
        let (mut alice, mut bob) = pair(10);

        let first = alice.encrypt(b"first", AD).unwrap();
        let second = alice.encrypt(b"second", AD).unwrap();

        assert_eq!(bob.decrypt(&second, AD).unwrap(), b"second");
        assert_eq!(bob.skipped_len(), 1);
        assert_eq!(bob.decrypt(&first, AD).unwrap(), b"first");
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn test_far_out_of_range_fails_and_keeps_state() {
        let (mut alice, mut bob) = pair(3);

        let first = alice.encrypt(b"first", AD).unwrap();
        bob.decrypt(&first, AD).unwrap();

        let mut far = None;
        for i in 0..6 {
            far = Some(alice.encrypt(format!("m{i}").as_bytes(), AD).unwrap());
        }
        let far = far.unwrap();

        assert!(matches!(
            bob.decrypt(&far, AD),
            Err(CryptoError::TooManySkipped { limit: 3, .. })
        ));
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn test_failed_decrypt_leaves_session_usable() {
        let (mut alice, mut bob) = pair(10);

        let good = alice.encrypt(b"good", AD).unwrap();
        let mut bad = good.clone();
        bad.ciphertext[0] ^= 0x01;

        assert_eq!(bob.decrypt(&bad, AD), Err(CryptoError::DecryptionFailed));
        assert_eq!(bob.decrypt(&good, AD).unwrap(), b"good");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = pair(10);

        let m = alice.encrypt(b"once", AD).unwrap();
        bob.decrypt(&m, AD).unwrap();
        assert_eq!(bob.decrypt(&m, AD), Err(CryptoError::ReplayDetected));
    }

    #[test]
    fn test_wrong_associated_data_fails() {
        let (mut alice, mut bob) = pair(10);
        let m = alice.encrypt(b"bound", AD).unwrap();
        assert!(bob.decrypt(&m, b"other").is_err());
    }

    #[test]
    fn test_message_encoding() {
        let (mut alice, _) = pair(10);
        let m = alice.encrypt(b"wire", AD).unwrap();
        let decoded = RatchetMessage::decode(&m.encode()).unwrap();
        assert_eq!(decoded, m);

        let mut bad_version = m.encode();
        bad_version[0] = 2;
        assert!(RatchetMessage::decode(&bad_version).is_err());
        assert!(RatchetMessage::decode(&m.encode()[..HEADER_SIZE]).is_err());
    }

    #[test]
    fn test_state_survives_serialization() {
        let (mut alice, mut bob) = pair(10);
        bob.decrypt(&alice.encrypt(b"one", AD).unwrap(), AD).unwrap();

        let json = serde_json::to_string(&bob).unwrap();
        let mut restored: DoubleRatchet = serde_json::from_str(&json).unwrap();

        let m = alice.encrypt(b"two", AD).unwrap();
        assert_eq!(restored.decrypt(&m, AD).unwrap(), b"two");
    }
}
