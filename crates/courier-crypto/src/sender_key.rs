//! Sender keys for group messaging.
//!
//! A group sender owns one chain key and one Ed25519 signing key per group.
//! It hands both (public half only for the signature key) to every member
//! once through their pairwise sessions as a [`SenderKeyDistribution`], then
//! encrypts each group message once. Members decrypt with their copy of the
//! chain, tolerating bounded reordering through skipped message keys.

use crate::ratchet::{ChainKey, MessageKey};
use crate::signatures::{Signature, SigningKey, VerifyingKey};
use crate::{CryptoError, MESSAGE_VERSION};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const DISTRIBUTION_LEN: usize = 1 + 4 + 4 + 32 + 32;
const MESSAGE_MIN_LEN: usize = 1 + 4 + 4 + crate::aead::TAG_SIZE + 64;

/// Sender key handed to group members.
#[derive(Clone, PartialEq, Eq)]
pub struct SenderKeyDistribution {
    /// Key id
    pub key_id: u32,
    /// Chain iteration the key starts at
    pub iteration: u32,
    /// Chain key at `iteration`
    pub chain_key: [u8; 32],
    /// Public signing key
    pub signing_key: VerifyingKey,
}

impl std::fmt::Debug for SenderKeyDistribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeyDistribution")
            .field("key_id", &self.key_id)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl SenderKeyDistribution {
    /// Serialize the distribution message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DISTRIBUTION_LEN);
        out.push(MESSAGE_VERSION);
        out.extend_from_slice(&self.key_id.to_be_bytes());
        out.extend_from_slice(&self.iteration.to_be_bytes());
        out.extend_from_slice(&self.chain_key);
        out.extend_from_slice(&self.signing_key.to_bytes());
        out
    }

    /// Parse a distribution message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] on a wrong length or version.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != DISTRIBUTION_LEN || bytes[0] != MESSAGE_VERSION {
            return Err(CryptoError::InvalidMessage("bad sender key distribution".into()));
        }
        let mut chain_key = [0u8; 32];
        chain_key.copy_from_slice(&bytes[9..41]);
        Ok(Self {
            key_id: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            iteration: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
            chain_key,
            signing_key: VerifyingKey::from_slice(&bytes[41..])?,
        })
    }
}

/// One encrypted group message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyMessage {
    /// Key id the message was encrypted under
    pub key_id: u32,
    /// Chain iteration
    pub iteration: u32,
    /// AEAD ciphertext with tag
    pub ciphertext: Vec<u8>,
    /// Signature over everything before it
    pub signature: Signature,
}

impl SenderKeyMessage {
    fn signed_part(key_id: u32, iteration: u32, ciphertext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + ciphertext.len());
        out.push(MESSAGE_VERSION);
        out.extend_from_slice(&key_id.to_be_bytes());
        out.extend_from_slice(&iteration.to_be_bytes());
        out.extend_from_slice(ciphertext);
        out
    }

    /// Serialize the message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Self::signed_part(self.key_id, self.iteration, &self.ciphertext);
        out.extend_from_slice(self.signature.as_bytes());
        out
    }

    /// Parse a message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] on truncation or a bad version.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < MESSAGE_MIN_LEN || bytes[0] != MESSAGE_VERSION {
            return Err(CryptoError::InvalidMessage("bad sender key message".into()));
        }
        let sig_at = bytes.len() - 64;
        Ok(Self {
            key_id: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            iteration: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
            ciphertext: bytes[9..sig_at].to_vec(),
            signature: Signature::from_slice(&bytes[sig_at..])?,
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedSenderKey {
    iteration: u32,
    key: MessageKey,
}

/// Sender key state for one (group, sender) pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    key_id: u32,
    iteration: u32,
    chain: ChainKey,
    signing_public: VerifyingKey,
    signing_private: Option<SigningKey>,
    skipped: VecDeque<SkippedSenderKey>,
    max_skip: u32,
}

impl std::fmt::Debug for SenderKeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeyState")
            .field("key_id", &self.key_id)
            .field("iteration", &self.iteration)
            .field("own", &self.signing_private.is_some())
            .finish_non_exhaustive()
    }
}

impl SenderKeyState {
    /// Create a fresh sender key owned by the local device.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate(max_skip: u32) -> Result<Self, CryptoError> {
        let signing = SigningKey::generate(&mut OsRng);
        Ok(Self {
            key_id: crate::random::random_u32()? >> 1,
            iteration: 0,
            chain: ChainKey::from_bytes(crate::random::random_32()?),
            signing_public: signing.verifying_key(),
            signing_private: Some(signing),
            skipped: VecDeque::new(),
            max_skip,
        })
    }

    /// Build the receiving state from a member's distribution message.
    #[must_use]
    pub fn from_distribution(distribution: &SenderKeyDistribution, max_skip: u32) -> Self {
        Self {
            key_id: distribution.key_id,
            iteration: distribution.iteration,
            chain: ChainKey::from_bytes(distribution.chain_key),
            signing_public: distribution.signing_key,
            signing_private: None,
            skipped: VecDeque::new(),
            max_skip,
        }
    }

    /// Key id.
    #[must_use]
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Next iteration of the chain.
    #[must_use]
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Whether this state can encrypt (the local device owns it).
    #[must_use]
    pub fn is_own(&self) -> bool {
        self.signing_private.is_some()
    }

    /// Distribution message for the current chain position.
    #[must_use]
    pub fn distribution(&self) -> SenderKeyDistribution {
        SenderKeyDistribution {
            key_id: self.key_id,
            iteration: self.iteration,
            chain_key: *self.chain.as_bytes(),
            signing_key: self.signing_public,
        }
    }

    /// Encrypt one group message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if the state was received from
    /// another member and holds no signing key.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SenderKeyMessage, CryptoError> {
        let signing = self
            .signing_private
            .as_ref()
            .ok_or(CryptoError::InvalidState)?;

        let iteration = self.iteration;
        let key = self.chain.ratchet();
        let aad = aad(self.key_id, iteration);
        let ciphertext = key.encrypt(plaintext, &aad)?;
        let signature = signing.sign(&SenderKeyMessage::signed_part(
            self.key_id,
            iteration,
            &ciphertext,
        ));

        self.iteration += 1;
        Ok(SenderKeyMessage {
            key_id: self.key_id,
            iteration,
            ciphertext,
            signature,
        })
    }

    /// Verify and decrypt one group message.
    ///
    /// On any error the state is restored to what it was before the call.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::SenderKeyMismatch`] if the key id differs
    /// - [`CryptoError::InvalidSignature`] if the signature does not verify
    /// - [`CryptoError::TooManySkipped`] if the message is beyond the skip window
    /// - [`CryptoError::ReplayDetected`] if the iteration was already consumed
    /// - [`CryptoError::DecryptionFailed`] on authentication failure
    pub fn decrypt(&mut self, message: &SenderKeyMessage) -> Result<Vec<u8>, CryptoError> {
        if message.key_id != self.key_id {
            return Err(CryptoError::SenderKeyMismatch {
                expected: self.key_id,
                received: message.key_id,
            });
        }
        self.signing_public.verify(
            &SenderKeyMessage::signed_part(message.key_id, message.iteration, &message.ciphertext),
            &message.signature,
        )?;

        let snapshot = self.clone();
        let result = self
            .message_key(message.iteration)
            .and_then(|key| key.decrypt(&message.ciphertext, &aad(message.key_id, message.iteration)));
        if result.is_err() {
            *self = snapshot;
        }
        result
    }

    fn message_key(&mut self, iteration: u32) -> Result<MessageKey, CryptoError> {
        if iteration < self.iteration {
            let pos = self
                .skipped
                .iter()
                .position(|k| k.iteration == iteration)
                .ok_or(CryptoError::ReplayDetected)?;
            return self
                .skipped
                .remove(pos)
                .map(|k| k.key)
                .ok_or(CryptoError::InvalidState);
        }

        let gap = iteration - self.iteration;
        if gap > self.max_skip {
            return Err(CryptoError::TooManySkipped {
                requested: gap,
                limit: self.max_skip,
            });
        }

        while self.iteration < iteration {
            self.skipped.push_back(SkippedSenderKey {
                iteration: self.iteration,
                key: self.chain.ratchet(),
            });
            if self.skipped.len() > self.max_skip as usize {
                self.skipped.pop_front();
            }
            self.iteration += 1;
        }

        self.iteration += 1;
        Ok(self.chain.ratchet())
    }
}

fn aad(key_id: u32, iteration: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&key_id.to_be_bytes());
    out[4..].copy_from_slice(&iteration.to_be_bytes());
    out
}
