//! Device credentials and their persistence.
//!
//! [`Credentials`] is the key material of one linked device. Together with
//! the session table it forms the [`AuthState`] that a [`CredentialStore`]
//! loads at startup and saves whenever either changes.

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::session::SessionSnapshot;
use async_trait::async_trait;
use courier_crypto::identity::IdentityKeyPair;
use courier_crypto::random::{random_32, random_u32};
use courier_crypto::x25519::KeyPair;
use courier_crypto::x3dh::SignedPreKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Registration ids are 14 bits wide
const REGISTRATION_ID_MASK: u32 = 0x3FFF;

/// Key material of one linked device
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Static key for the relay handshake
    pub noise_key: KeyPair,
    /// Long-term identity
    pub identity: IdentityKeyPair,
    /// Current signed prekey
    pub signed_prekey: SignedPreKey,
    /// Signed prekey replaced by the last rotation
    pub previous_signed_prekey: Option<SignedPreKey>,
    /// 14-bit registration id
    pub registration_id: u32,
    /// Secret shown in the QR code and used to authenticate pairing
    #[serde(with = "b64")]
    pub adv_secret: [u8; 32],
    /// Id of the next one-time prekey to generate
    pub next_prekey_id: u32,
    /// First one-time prekey id not yet uploaded
    pub first_unuploaded_prekey_id: u32,
    /// Own device JID once paired
    pub me: Option<Jid>,
    /// Active pairing code, if the code flow was used
    pub pairing_code: Option<String>,
    /// Whether pairing completed
    pub registered: bool,
}

impl Credentials {
    /// Fresh credentials for an unpaired device.
    ///
    /// # Errors
    ///
    /// Fails only if the OS CSPRNG fails.
    pub fn generate(now: u64) -> Result<Self> {
        let identity = IdentityKeyPair::generate();
        let signed_prekey = SignedPreKey::generate(&identity, 1, now);

        Ok(Self {
            noise_key: KeyPair::generate(),
            identity,
            signed_prekey,
            previous_signed_prekey: None,
            registration_id: random_u32()? & REGISTRATION_ID_MASK,
            adv_secret: random_32()?,
            next_prekey_id: 1,
            first_unuploaded_prekey_id: 1,
            me: None,
            pairing_code: None,
            registered: false,
        })
    }

    /// Whether the signed prekey is older than `rotation`.
    #[must_use]
    pub fn signed_prekey_due(&self, now: u64, rotation: Duration) -> bool {
        now.saturating_sub(self.signed_prekey.created_at) >= rotation.as_secs()
    }

    /// Replace the signed prekey, keeping the old one as previous.
    pub fn rotate_signed_prekey(&mut self, now: u64) -> &SignedPreKey {
        let id = match self.signed_prekey.id.wrapping_add(1) {
            0 => 1,
            id => id,
        };
        let next = SignedPreKey::generate(&self.identity, id, now);
        self.previous_signed_prekey = Some(std::mem::replace(&mut self.signed_prekey, next));
        tracing::info!("Rotated signed prekey to id {}", id);
        &self.signed_prekey
    }

    /// Reserve `count` one-time prekey ids, returning the first.
    pub fn reserve_prekey_ids(&mut self, count: u32) -> u32 {
        let first = self.next_prekey_id;
        self.next_prekey_id = self.next_prekey_id.wrapping_add(count);
        first
    }

    /// Record that every reserved prekey id has been uploaded.
    pub fn mark_prekeys_uploaded(&mut self) {
        self.first_unuploaded_prekey_id = self.next_prekey_id;
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity.public().fingerprint())
            .field("registration_id", &self.registration_id)
            .field("signed_prekey_id", &self.signed_prekey.id)
            .field("next_prekey_id", &self.next_prekey_id)
            .field("me", &self.me)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

/// Everything a store persists for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthState {
    /// Device credentials
    pub creds: Credentials,
    /// Session table
    pub keys: SessionSnapshot,
}

impl AuthState {
    /// Auth state for a fresh device with an empty session table.
    ///
    /// # Errors
    ///
    /// Fails only if the OS CSPRNG fails.
    pub fn generate(now: u64) -> Result<Self> {
        Ok(Self {
            creds: Credentials::generate(now)?,
            keys: SessionSnapshot::default(),
        })
    }
}

/// Persistence hook for the auth state
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the saved state, `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<AuthState>>;

    /// Persist the state, replacing any previous save atomically.
    async fn save(&self, state: &AuthState) -> Result<()>;
}

/// JSON file store
///
/// Saves write a sibling temp file, sync it, then rename it over the target.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn store_error(&self, err: impl fmt::Display) -> Error {
        Error::Store(format!("{}: {}", self.path.display(), err))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<AuthState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.store_error(e)),
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| self.store_error(e))?;
        tracing::debug!("Loaded auth state from {}", self.path.display());
        Ok(Some(state))
    }

    async fn save(&self, state: &AuthState) -> Result<()> {
        let bytes = serde_json::to_vec(state).map_err(|e| self.store_error(e))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.store_error(e))?;
        }

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| self.store_error(e))?;
        file.write_all(&bytes).await.map_err(|e| self.store_error(e))?;
        file.sync_all().await.map_err(|e| self.store_error(e))?;
        drop(file);
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.store_error(e))?;

        tracing::debug!("Saved auth state to {} ({} bytes)", self.path.display(), bytes.len());
        Ok(())
    }
}

/// In-memory store, for tests and short-lived bots.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: Mutex<Option<AuthState>>,
    saves: std::sync::atomic::AtomicU64,
}

impl MemoryCredentialStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed saves.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<AuthState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &AuthState) -> Result<()> {
        *self.state.lock().await = Some(state.clone());
        self.saves
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        Ok(())
    }
}

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(text).map_err(de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let creds = Credentials::generate(1_000).unwrap();
        assert!(creds.registration_id <= REGISTRATION_ID_MASK);
        assert!(!creds.registered);
        assert!(creds.me.is_none());
        assert_eq!(creds.signed_prekey.created_at, 1_000);
    }

    #[test]
    fn test_rotation_keeps_previous() {
        let mut creds = Credentials::generate(0).unwrap();
        let week = Duration::from_secs(7 * 24 * 3600);
        assert!(!creds.signed_prekey_due(3600, week));
        assert!(creds.signed_prekey_due(week.as_secs(), week));

        let old_id = creds.signed_prekey.id;
        let new_id = creds.rotate_signed_prekey(week.as_secs()).id;
        assert_eq!(new_id, old_id + 1);
        assert_eq!(creds.previous_signed_prekey.as_ref().map(|k| k.id), Some(old_id));
        assert!(!creds.signed_prekey_due(week.as_secs() + 1, week));
    }

    #[test]
    fn test_prekey_ids() {
        let mut creds = Credentials::generate(0).unwrap();
        assert_eq!(creds.reserve_prekey_ids(30), 1);
        assert_eq!(creds.reserve_prekey_ids(5), 31);
        assert_eq!(creds.first_unuploaded_prekey_id, 1);
        creds.mark_prekeys_uploaded();
        assert_eq!(creds.first_unuploaded_prekey_id, 36);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("auth").join("state.json"));
        assert!(store.load().await.unwrap().is_none());

        let mut state = AuthState::generate(5).unwrap();
        state.creds.me = Some(Jid::device("15551234567", 2));
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.creds.me, state.creds.me);
        assert_eq!(loaded.creds.adv_secret, state.creds.adv_secret);
        assert_eq!(loaded.creds.registration_id, state.creds.registration_id);
        assert_eq!(
            loaded.creds.identity.public(),
            state.creds.identity.public()
        );
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            FileCredentialStore::new(path).load().await,
            Err(Error::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save(&AuthState::generate(0).unwrap()).await.unwrap();
        assert!(store.load().await.unwrap().is_some());
        assert_eq!(store.save_count(), 1);
    }
}
