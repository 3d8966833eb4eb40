//! End-to-end session table.
//!
//! Pairwise sessions are keyed by [`ProtocolAddress`], sender keys by
//! [`SenderKeyName`]. Each key owns an async mutex held for the whole
//! operation, so concurrent encrypt/decrypt calls against one device (or
//! one group sender) are linearized while different keys proceed in
//! parallel.
//!
//! # Session Establishment
//!
//! ```text
//! Alice                                   Bob
//!   | fetch bundle (IK, SPK+sig, OPK?)     |
//!   | X3DH -> root key, ratchet on SPK     |
//!   |------ pkmsg (base key, IK, msg) ---->| X3DH -> same root key
//!   |------ pkmsg ... until Bob replies -->|
//!   |<--------------- msg -----------------|
//!   |---------------- msg ---------------->|
//! ```

use super::address::{ProtocolAddress, SenderKeyName};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use courier_crypto::CryptoError;
use courier_crypto::identity::{IdentityKey, IdentityKeyPair};
use courier_crypto::ratchet::{DoubleRatchet, RatchetMessage};
use courier_crypto::sender_key::{SenderKeyDistribution, SenderKeyMessage, SenderKeyState};
use courier_crypto::x25519::{KeyPair, PublicKey};
use courier_crypto::x3dh::{self, OneTimePreKey, PreKeyBundle, PreKeyMessage, SignedPreKey};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type Slot<T> = Arc<Mutex<Option<T>>>;

/// Wire type of an end-to-end ciphertext
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CiphertextKind {
    /// Ratchet message on an established session (`msg`)
    Whisper,
    /// Ratchet message carrying X3DH parameters (`pkmsg`)
    PreKey,
    /// Sender-key group message (`skmsg`)
    SenderKey,
}

impl CiphertextKind {
    /// Value of the `type` attribute on `<enc>`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whisper => "msg",
            Self::PreKey => "pkmsg",
            Self::SenderKey => "skmsg",
        }
    }

    /// Parse the `type` attribute of `<enc>`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "msg" => Some(Self::Whisper),
            "pkmsg" => Some(Self::PreKey),
            "skmsg" => Some(Self::SenderKey),
            _ => None,
        }
    }
}

/// Output of a pairwise encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Wire type
    pub kind: CiphertextKind,
    /// Serialized message
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
struct PendingPreKey {
    one_time_prekey_id: Option<u32>,
    signed_prekey_id: u32,
    base_key: PublicKey,
}

/// Pairwise session with one remote device.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    ratchet: DoubleRatchet,
    remote_identity: IdentityKey,
    remote_registration_id: u32,
    associated_data: Vec<u8>,
    base_key: PublicKey,
    pending_prekey: Option<PendingPreKey>,
}

impl SessionRecord {
    /// Identity of the remote device.
    #[must_use]
    pub fn remote_identity(&self) -> &IdentityKey {
        &self.remote_identity
    }

    /// Registration id of the remote device.
    #[must_use]
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// Whether outbound messages still carry the X3DH parameters.
    #[must_use]
    pub fn has_pending_prekey(&self) -> bool {
        self.pending_prekey.is_some()
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("remote_identity", &self.remote_identity.fingerprint())
            .field("pending_prekey", &self.pending_prekey.is_some())
            .field("skipped_keys", &self.ratchet.skipped_len())
            .finish_non_exhaustive()
    }
}

/// Serializable export of the session table.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Pairwise sessions
    pub sessions: Vec<(ProtocolAddress, SessionRecord)>,
    /// Sender keys, own and received
    pub sender_keys: Vec<(SenderKeyName, SenderKeyState)>,
    /// Unconsumed local one-time prekeys
    pub one_time_prekeys: Vec<OneTimePreKey>,
}

impl fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("sessions", &self.sessions.len())
            .field("sender_keys", &self.sender_keys.len())
            .field("one_time_prekeys", &self.one_time_prekeys.len())
            .finish()
    }
}

struct SignedPreKeys {
    current: SignedPreKey,
    previous: Option<SignedPreKey>,
}

/// Encrypted session manager
///
/// Owns the pairwise session table, the sender-key table and the local
/// one-time prekeys. Thread-safe; share it behind an `Arc`.
pub struct SessionManager {
    identity: IdentityKeyPair,
    registration_id: u32,
    signed_prekeys: RwLock<SignedPreKeys>,
    one_time_prekeys: DashMap<u32, OneTimePreKey>,
    sessions: DashMap<ProtocolAddress, Slot<SessionRecord>>,
    sender_keys: DashMap<SenderKeyName, Slot<SenderKeyState>>,
    max_skipped_keys: u32,
}

impl SessionManager {
    /// Create an empty session table for the local device.
    pub fn new(
        identity: IdentityKeyPair,
        registration_id: u32,
        signed_prekey: SignedPreKey,
        previous_signed_prekey: Option<SignedPreKey>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            identity,
            registration_id,
            signed_prekeys: RwLock::new(SignedPreKeys {
                current: signed_prekey,
                previous: previous_signed_prekey,
            }),
            one_time_prekeys: DashMap::new(),
            sessions: DashMap::new(),
            sender_keys: DashMap::new(),
            max_skipped_keys: config.max_skipped_keys,
        }
    }

    /// Local identity.
    #[must_use]
    pub fn identity(&self) -> IdentityKey {
        self.identity.public()
    }

    /// Local registration id.
    #[must_use]
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    fn session_slot(&self, addr: &ProtocolAddress) -> Slot<SessionRecord> {
        Arc::clone(&self.sessions.entry(addr.clone()).or_default())
    }

    fn sender_key_slot(&self, name: &SenderKeyName) -> Slot<SenderKeyState> {
        Arc::clone(&self.sender_keys.entry(name.clone()).or_default())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pairwise sessions
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether a session with `addr` exists.
    pub async fn has_session(&self, addr: &ProtocolAddress) -> bool {
        let Some(slot) = self.sessions.get(addr).map(|s| Arc::clone(&s)) else {
            return false;
        };
        let guard = slot.lock().await;
        guard.is_some()
    }

    /// Establish (or replace) the session with `addr` from its prekey bundle.
    ///
    /// # Errors
    ///
    /// Fails if the bundle signature does not verify or a DH is degenerate.
    pub async fn process_bundle(&self, addr: &ProtocolAddress, bundle: &PreKeyBundle) -> Result<()> {
        let slot = self.session_slot(addr);
        let mut guard = slot.lock().await;
        *guard = Some(self.initiate(bundle)?);
        tracing::info!("Established outbound session with {}", addr);
        Ok(())
    }

    /// Drop the session with `addr` so the next send re-establishes it.
    pub async fn reset_session(&self, addr: &ProtocolAddress) {
        let slot = self.session_slot(addr);
        let mut guard = slot.lock().await;
        if guard.take().is_some() {
            tracing::info!("Reset session with {}", addr);
        }
    }

    /// Encrypt for one device.
    ///
    /// Without a session, `bundle` is used to establish one; until the peer
    /// replies, the output is a prekey message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSessionAvailable`] if there is neither a session
    /// nor a bundle.
    pub async fn encrypt(
        &self,
        addr: &ProtocolAddress,
        plaintext: &[u8],
        bundle: Option<&PreKeyBundle>,
    ) -> Result<EncryptedMessage> {
        let slot = self.session_slot(addr);
        let mut guard = slot.lock().await;

        if guard.is_none() {
            let bundle = bundle.ok_or_else(|| Error::NoSessionAvailable(addr.to_string()))?;
            *guard = Some(self.initiate(bundle)?);
            tracing::info!("Established outbound session with {}", addr);
        }
        let record = guard
            .as_mut()
            .ok_or_else(|| Error::NoSessionAvailable(addr.to_string()))?;

        let message = record.ratchet.encrypt(plaintext, &record.associated_data)?;
        let encrypted = match &record.pending_prekey {
            Some(pending) => EncryptedMessage {
                kind: CiphertextKind::PreKey,
                ciphertext: PreKeyMessage {
                    registration_id: self.registration_id,
                    one_time_prekey_id: pending.one_time_prekey_id,
                    signed_prekey_id: pending.signed_prekey_id,
                    base_key: pending.base_key,
                    identity: self.identity.public(),
                    message: message.encode(),
                }
                .encode(),
            },
            None => EncryptedMessage {
                kind: CiphertextKind::Whisper,
                ciphertext: message.encode(),
            },
        };

        tracing::trace!(
            "Encrypted {} for {} (counter {})",
            encrypted.kind.as_str(),
            addr,
            message.header.counter
        );
        Ok(encrypted)
    }

    /// Decrypt a pairwise message from one device.
    ///
    /// A failed decryption leaves the session unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecryptionFailure`] for unknown sessions or prekeys,
    /// authentication failures, replays and skips beyond the window.
    pub async fn decrypt(
        &self,
        addr: &ProtocolAddress,
        kind: CiphertextKind,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        match kind {
            CiphertextKind::Whisper => self.decrypt_whisper(addr, ciphertext).await,
            CiphertextKind::PreKey => self.decrypt_prekey(addr, ciphertext).await,
            CiphertextKind::SenderKey => Err(Error::InvalidState(Cow::Borrowed(
                "sender-key messages are decrypted per group",
            ))),
        }
    }

    async fn decrypt_whisper(&self, addr: &ProtocolAddress, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let message = RatchetMessage::decode(ciphertext).map_err(decryption_failure)?;

        let slot = self.session_slot(addr);
        let mut guard = slot.lock().await;
        let record = guard
            .as_mut()
            .ok_or_else(|| Error::DecryptionFailure(Cow::Owned(format!("no session with {addr}"))))?;

        let plaintext = record
            .ratchet
            .decrypt(&message, &record.associated_data)
            .map_err(decryption_failure)?;
        if record.pending_prekey.take().is_some() {
            tracing::debug!("Session with {} confirmed by peer", addr);
        }
        Ok(plaintext)
    }

    async fn decrypt_prekey(&self, addr: &ProtocolAddress, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let prekey_message = PreKeyMessage::decode(ciphertext).map_err(decryption_failure)?;
        let inner = RatchetMessage::decode(&prekey_message.message).map_err(decryption_failure)?;

        let slot = self.session_slot(addr);
        let mut guard = slot.lock().await;

        // Repeated prekey message of a run we already accepted
        if let Some(record) = guard.as_mut() {
            if record.base_key == prekey_message.base_key
                && record.remote_identity == prekey_message.identity
            {
                return record
                    .ratchet
                    .decrypt(&inner, &record.associated_data)
                    .map_err(decryption_failure);
            }
        }

        let signed_prekey = self
            .signed_prekey_pair(prekey_message.signed_prekey_id)
            .await
            .ok_or(CryptoError::UnknownPreKey(prekey_message.signed_prekey_id))
            .map_err(decryption_failure)?;
        let one_time = match prekey_message.one_time_prekey_id {
            Some(id) => Some(
                self.one_time_prekeys
                    .get(&id)
                    .map(|k| k.key_pair.private.clone())
                    .ok_or(CryptoError::UnknownPreKey(id))
                    .map_err(decryption_failure)?,
            ),
            None => None,
        };

        let shared = x3dh::respond(
            &self.identity,
            &signed_prekey,
            one_time.as_ref(),
            &prekey_message.identity,
            &prekey_message.base_key,
        )
        .map_err(decryption_failure)?;
        let mut ratchet = DoubleRatchet::init_responder(shared, signed_prekey, self.max_skipped_keys);
        let associated_data = associated_data(&prekey_message.identity, &self.identity.public());
        let plaintext = ratchet
            .decrypt(&inner, &associated_data)
            .map_err(decryption_failure)?;

        if let Some(id) = prekey_message.one_time_prekey_id {
            self.one_time_prekeys.remove(&id);
        }
        *guard = Some(SessionRecord {
            ratchet,
            remote_identity: prekey_message.identity,
            remote_registration_id: prekey_message.registration_id,
            associated_data,
            base_key: prekey_message.base_key,
            pending_prekey: None,
        });
        tracing::info!("Established inbound session with {}", addr);
        Ok(plaintext)
    }

    fn initiate(&self, bundle: &PreKeyBundle) -> Result<SessionRecord> {
        let agreement = x3dh::initiate(&self.identity, bundle)?;
        let ratchet = DoubleRatchet::init_initiator(
            agreement.shared_secret,
            bundle.signed_prekey,
            self.max_skipped_keys,
        )?;

        Ok(SessionRecord {
            ratchet,
            remote_identity: bundle.identity,
            remote_registration_id: bundle.registration_id,
            associated_data: associated_data(&self.identity.public(), &bundle.identity),
            base_key: agreement.base_key,
            pending_prekey: Some(PendingPreKey {
                one_time_prekey_id: bundle.one_time_prekey.map(|(id, _)| id),
                signed_prekey_id: bundle.signed_prekey_id,
                base_key: agreement.base_key,
            }),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sender keys
    // ═══════════════════════════════════════════════════════════════════════

    /// Distribution message for our own sender key in a group, creating the
    /// key on first use.
    ///
    /// # Errors
    ///
    /// Fails only if the OS CSPRNG fails.
    pub async fn sender_key_distribution(&self, name: &SenderKeyName) -> Result<Vec<u8>> {
        let slot = self.sender_key_slot(name);
        let mut guard = slot.lock().await;
        let state = own_sender_key(&mut guard, self.max_skipped_keys)?;
        Ok(state.distribution().encode())
    }

    /// Encrypt one group message with our sender key.
    ///
    /// # Errors
    ///
    /// Fails only if the OS CSPRNG fails or the chain is exhausted.
    pub async fn group_encrypt(&self, name: &SenderKeyName, plaintext: &[u8]) -> Result<Vec<u8>> {
        let slot = self.sender_key_slot(name);
        let mut guard = slot.lock().await;
        let state = own_sender_key(&mut guard, self.max_skipped_keys)?;
        let message = state.encrypt(plaintext)?;
        tracing::trace!("Group message for {} at iteration {}", name, message.iteration);
        Ok(message.encode())
    }

    /// Store a member's sender key received through a pairwise session.
    ///
    /// A distribution for the key we already hold is ignored so the chain
    /// position is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecryptionFailure`] for a malformed distribution.
    pub async fn process_sender_key_distribution(
        &self,
        name: &SenderKeyName,
        distribution: &[u8],
    ) -> Result<()> {
        let distribution = SenderKeyDistribution::decode(distribution).map_err(decryption_failure)?;

        let slot = self.sender_key_slot(name);
        let mut guard = slot.lock().await;
        if guard
            .as_ref()
            .is_some_and(|s| s.key_id() == distribution.key_id)
        {
            return Ok(());
        }
        *guard = Some(SenderKeyState::from_distribution(
            &distribution,
            self.max_skipped_keys,
        ));
        tracing::debug!("Stored sender key {} for {}", distribution.key_id, name);
        Ok(())
    }

    /// Whether a sender key is held for `name`.
    pub async fn has_sender_key(&self, name: &SenderKeyName) -> bool {
        let Some(slot) = self.sender_keys.get(name).map(|s| Arc::clone(&s)) else {
            return false;
        };
        let guard = slot.lock().await;
        guard.is_some()
    }

    /// Decrypt one group message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSenderKey`] if no distribution was received
    /// from the sender, [`Error::DecryptionFailure`] otherwise.
    pub async fn group_decrypt(&self, name: &SenderKeyName, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let slot = self.sender_key_slot(name);
        let mut guard = slot.lock().await;
        let state = guard.as_mut().ok_or_else(|| Error::MissingSenderKey {
            group: name.group.clone(),
            sender: name.sender.to_string(),
        })?;

        let message = SenderKeyMessage::decode(ciphertext).map_err(decryption_failure)?;
        state.decrypt(&message).map_err(decryption_failure)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local prekeys
    // ═══════════════════════════════════════════════════════════════════════

    /// Generate and keep `count` one-time prekeys starting at `first_id`.
    ///
    /// Returns the new prekeys for upload.
    pub fn generate_one_time_prekeys(&self, first_id: u32, count: u32) -> Vec<OneTimePreKey> {
        let batch = OneTimePreKey::generate_batch(first_id, count);
        for prekey in &batch {
            self.one_time_prekeys.insert(prekey.id, prekey.clone());
        }
        tracing::debug!("Generated {} one-time prekeys from id {}", count, first_id);
        batch
    }

    /// Number of unconsumed local one-time prekeys.
    #[must_use]
    pub fn one_time_prekey_count(&self) -> usize {
        self.one_time_prekeys.len()
    }

    /// Install a rotated signed prekey, keeping the previous one for
    /// in-flight prekey messages.
    pub async fn set_signed_prekeys(&self, current: SignedPreKey, previous: Option<SignedPreKey>) {
        let mut keys = self.signed_prekeys.write().await;
        keys.current = current;
        keys.previous = previous;
    }

    /// Current signed prekey.
    pub async fn signed_prekey(&self) -> SignedPreKey {
        self.signed_prekeys.read().await.current.clone()
    }

    async fn signed_prekey_pair(&self, id: u32) -> Option<KeyPair> {
        let keys = self.signed_prekeys.read().await;
        std::iter::once(&keys.current)
            .chain(keys.previous.as_ref())
            .find(|k| k.id == id)
            .map(|k| k.key_pair.clone())
    }

    /// Our own published bundle, using the lowest unconsumed one-time prekey.
    pub async fn local_bundle(&self) -> PreKeyBundle {
        let signed = self.signed_prekey().await;
        let one_time = self
            .one_time_prekeys
            .iter()
            .map(|entry| (entry.id, entry.key_pair.public))
            .min_by_key(|(id, _)| *id);

        PreKeyBundle {
            registration_id: self.registration_id,
            identity: self.identity.public(),
            signed_prekey_id: signed.id,
            signed_prekey: signed.key_pair.public,
            signed_prekey_signature: signed.signature,
            one_time_prekey: one_time,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshots
    // ═══════════════════════════════════════════════════════════════════════

    /// Export the session table.
    ///
    /// Each entry is read under its own lock; entries are sorted by key.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let session_slots: Vec<_> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut sessions = Vec::with_capacity(session_slots.len());
        for (addr, slot) in session_slots {
            if let Some(record) = slot.lock().await.as_ref() {
                sessions.push((addr, record.clone()));
            }
        }
        sessions.sort_by(|a, b| a.0.cmp(&b.0));

        let sender_slots: Vec<_> = self
            .sender_keys
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut sender_keys = Vec::with_capacity(sender_slots.len());
        for (name, slot) in sender_slots {
            if let Some(state) = slot.lock().await.as_ref() {
                sender_keys.push((name, state.clone()));
            }
        }
        sender_keys.sort_by(|a, b| a.0.cmp(&b.0));

        let mut one_time_prekeys: Vec<_> = self
            .one_time_prekeys
            .iter()
            .map(|e| e.value().clone())
            .collect();
        one_time_prekeys.sort_by_key(|k| k.id);

        SessionSnapshot {
            sessions,
            sender_keys,
            one_time_prekeys,
        }
    }

    /// Import a snapshot, replacing entries with the same keys.
    pub async fn restore(&self, snapshot: SessionSnapshot) {
        let counts = (
            snapshot.sessions.len(),
            snapshot.sender_keys.len(),
            snapshot.one_time_prekeys.len(),
        );
        for (addr, record) in snapshot.sessions {
            let slot = self.session_slot(&addr);
            *slot.lock().await = Some(record);
        }
        for (name, state) in snapshot.sender_keys {
            let slot = self.sender_key_slot(&name);
            *slot.lock().await = Some(state);
        }
        for prekey in snapshot.one_time_prekeys {
            self.one_time_prekeys.insert(prekey.id, prekey);
        }
        tracing::debug!(
            "Restored {} sessions, {} sender keys, {} one-time prekeys",
            counts.0,
            counts.1,
            counts.2
        );
    }
}

fn own_sender_key(slot: &mut Option<SenderKeyState>, max_skip: u32) -> Result<&mut SenderKeyState> {
    if !slot.as_ref().is_some_and(SenderKeyState::is_own) {
        *slot = Some(SenderKeyState::generate(max_skip)?);
    }
    slot.as_mut()
        .ok_or(Error::InvalidState(Cow::Borrowed("sender key missing")))
}

/// Initiator identity first, then responder identity.
fn associated_data(initiator: &IdentityKey, responder: &IdentityKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(128);
    ad.extend_from_slice(&initiator.to_bytes());
    ad.extend_from_slice(&responder.to_bytes());
    ad
}

fn decryption_failure(err: CryptoError) -> Error {
    Error::DecryptionFailure(Cow::Owned(err.to_string()))
}
