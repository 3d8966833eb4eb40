//! Retry/ack bookkeeping for outbound and inbound messages.
//!
//! Outbound: every sent message gets a [`RetryRecord`]. A retry receipt from
//! the recipient bumps the attempt count and yields a [`Resend`] until the
//! count passes [`RetryPolicy::max_attempts`]; an ack discards the record.
//! Receipts for ids we hold no record of create nothing.
//!
//! Inbound: a message we fail to decrypt is counted the same way, giving
//! the retry count to request from the sender.
//!
//! Records live in a [`RetryStore`] injected by the caller so counts
//! survive reconnects and engine restarts. Records untouched for
//! [`RetryPolicy::record_ttl`] are pruned, whether exhausted, acked by the
//! server only, or never answered.

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::unix_now;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimum spacing between automatic prune sweeps, in seconds
const PRUNE_INTERVAL_SECS: u64 = 60;

/// Key of one message for retry bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageIdentity {
    /// Chat the message belongs to
    pub remote_jid: Jid,
    /// Message id
    pub message_id: String,
    /// Whether we sent it
    pub from_me: bool,
}

impl MessageIdentity {
    /// Identity of a message we sent.
    pub fn outbound(remote_jid: Jid, message_id: impl Into<String>) -> Self {
        Self {
            remote_jid,
            message_id: message_id.into(),
            from_me: true,
        }
    }

    /// Identity of a message we received.
    pub fn inbound(remote_jid: Jid, message_id: impl Into<String>) -> Self {
        Self {
            remote_jid,
            message_id: message_id.into(),
            from_me: false,
        }
    }
}

impl fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.from_me { "out" } else { "in" };
        write!(f, "{}/{}/{}", self.remote_jid, self.message_id, direction)
    }
}

/// Retry state of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRecord {
    /// Message key
    pub identity: MessageIdentity,
    /// Resends made (outbound) or retries requested (inbound)
    pub attempts: u32,
    /// Plaintext to resend, if it was kept
    pub last_payload: Option<Vec<u8>>,
    /// Device the message was addressed to
    pub recipient: Option<Jid>,
    /// Whether the retry budget is spent
    pub exhausted: bool,
    /// Last update, seconds since the Unix epoch
    pub updated_at: u64,
}

impl RetryRecord {
    fn new(identity: MessageIdentity, now: u64) -> Self {
        Self {
            identity,
            attempts: 0,
            last_payload: None,
            recipient: None,
            exhausted: false,
            updated_at: now,
        }
    }
}

/// Storage for retry records
///
/// `update` is a read-modify-write that must run under a single writer per
/// identity: returning `None` from the closure removes the record.
pub trait RetryStore: Send + Sync {
    /// Current record for `identity`.
    fn get(&self, identity: &MessageIdentity) -> Option<RetryRecord>;

    /// Atomically replace the record for `identity` with the closure result.
    fn update(
        &self,
        identity: &MessageIdentity,
        f: &mut dyn FnMut(Option<RetryRecord>) -> Option<RetryRecord>,
    ) -> Option<RetryRecord>;

    /// Remove the record for `identity`.
    fn remove(&self, identity: &MessageIdentity) -> Option<RetryRecord>;

    /// Drop every record for which `keep` returns `false`.
    ///
    /// Returns the number of records removed.
    fn retain(&self, keep: &mut dyn FnMut(&RetryRecord) -> bool) -> usize;

    /// Number of records held.
    fn len(&self) -> usize;

    /// Whether no records are held.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`RetryStore`] backed by a sharded map.
#[derive(Debug, Default)]
pub struct MemoryRetryStore {
    records: DashMap<MessageIdentity, RetryRecord>,
}

impl MemoryRetryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RetryStore for MemoryRetryStore {
    fn get(&self, identity: &MessageIdentity) -> Option<RetryRecord> {
        self.records.get(identity).map(|r| r.clone())
    }

    fn update(
        &self,
        identity: &MessageIdentity,
        f: &mut dyn FnMut(Option<RetryRecord>) -> Option<RetryRecord>,
    ) -> Option<RetryRecord> {
        // The entry guard holds the shard lock for the whole closure
        match self.records.entry(identity.clone()) {
            Entry::Occupied(mut entry) => match f(Some(entry.get().clone())) {
                Some(record) => {
                    entry.insert(record.clone());
                    Some(record)
                }
                None => {
                    entry.remove();
                    None
                }
            },
            Entry::Vacant(entry) => {
                let record = f(None)?;
                entry.insert(record.clone());
                Some(record)
            }
        }
    }

    fn remove(&self, identity: &MessageIdentity) -> Option<RetryRecord> {
        self.records.remove(identity).map(|(_, r)| r)
    }

    fn retain(&self, keep: &mut dyn FnMut(&RetryRecord) -> bool) -> usize {
        let mut removed = 0;
        self.records.retain(|_, record| {
            let kept = keep(record);
            if !kept {
                removed += 1;
            }
            kept
        });
        removed
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Instruction to resend an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resend {
    /// Stored plaintext, `None` if the caller must look it up
    pub payload: Option<Vec<u8>>,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Device to resend to
    pub recipient: Jid,
}

/// Retry/ack coordinator
#[derive(Clone)]
pub struct RetryCoordinator {
    store: Arc<dyn RetryStore>,
    policy: RetryPolicy,
    last_prune: Arc<AtomicU64>,
}

impl fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("records", &self.store.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetryCoordinator {
    /// Coordinator over a shared store.
    pub fn new(store: Arc<dyn RetryStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            last_prune: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RetryStore> {
        &self.store
    }

    /// Active policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Record an outbound message.
    ///
    /// An existing record keeps its attempt count; payload and recipient
    /// are refreshed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the system clock is unusable.
    pub fn record_sent(
        &self,
        identity: &MessageIdentity,
        recipient: Option<Jid>,
        payload: Option<Vec<u8>>,
    ) -> Result<()> {
        let now = unix_now()?;
        let mut payload = payload;
        let mut recipient = recipient;
        self.store.update(identity, &mut |current| {
            let mut record = current.unwrap_or_else(|| RetryRecord::new(identity.clone(), now));
            if let Some(p) = payload.take() {
                record.last_payload = Some(p);
            }
            if let Some(r) = recipient.take() {
                record.recipient = Some(r);
            }
            record.updated_at = now;
            Some(record)
        });
        tracing::trace!("Recorded sent message {}", identity);
        self.maybe_prune(now);
        Ok(())
    }

    /// Handle a retry receipt for one of our messages.
    ///
    /// Returns `Ok(None)` when no record exists for `identity`: the message
    /// was never sent through this coordinator, was acknowledged, or was
    /// pruned. Nothing is stored in that case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetryExhausted`] once the attempt count would pass
    /// the policy maximum; the record stays at the maximum and is marked
    /// exhausted.
    pub fn on_retry_receipt(&self, identity: &MessageIdentity) -> Result<Option<Resend>> {
        let now = unix_now()?;
        let max = self.policy.max_attempts;
        let Some(record) = self.store.update(identity, &mut |current| {
            let mut record = current?;
            if record.attempts >= max {
                record.attempts = max;
                record.exhausted = true;
            } else {
                record.attempts += 1;
            }
            record.updated_at = now;
            Some(record)
        }) else {
            tracing::debug!("Retry receipt for unknown message {}", identity);
            return Ok(None);
        };

        if record.exhausted {
            tracing::warn!(
                "Retry budget exhausted for {} after {} attempts",
                identity,
                record.attempts
            );
            return Err(Error::RetryExhausted {
                message_id: identity.message_id.clone(),
                attempts: record.attempts,
            });
        }

        tracing::debug!("Resending {} (attempt {}/{})", identity, record.attempts, max);
        Ok(Some(Resend {
            payload: record.last_payload,
            attempt: record.attempts,
            recipient: record
                .recipient
                .unwrap_or_else(|| identity.remote_jid.clone()),
        }))
    }

    /// Discard the record of an acknowledged message.
    ///
    /// Returns `true` if a record existed.
    pub fn on_ack(&self, identity: &MessageIdentity) -> bool {
        let removed = self.store.remove(identity).is_some();
        if removed {
            tracing::trace!("Acknowledged {}", identity);
        }
        removed
    }

    /// Count a failed decryption of an inbound message.
    ///
    /// Returns the retry count to put in the retry receipt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetryExhausted`] once the sender was asked
    /// `max_attempts` times.
    pub fn on_decrypt_failure(&self, identity: &MessageIdentity) -> Result<u32> {
        let now = unix_now()?;
        let max = self.policy.max_attempts;
        let record = self
            .store
            .update(identity, &mut |current| {
                let mut record = current.unwrap_or_else(|| RetryRecord::new(identity.clone(), now));
                if record.attempts >= max {
                    record.exhausted = true;
                } else {
                    record.attempts += 1;
                }
                record.updated_at = now;
                Some(record)
            })
            .ok_or_else(|| Error::Store(format!("retry record for {identity} vanished")))?;
        self.maybe_prune(now);

        if record.exhausted {
            tracing::warn!("Giving up on undecryptable message {}", identity);
            return Err(Error::RetryExhausted {
                message_id: identity.message_id.clone(),
                attempts: record.attempts,
            });
        }
        tracing::debug!("Requesting retry {} for {}", record.attempts, identity);
        Ok(record.attempts)
    }

    /// Attempts recorded for `identity`.
    #[must_use]
    pub fn attempts(&self, identity: &MessageIdentity) -> Option<u32> {
        self.store.get(identity).map(|r| r.attempts)
    }

    /// Remove every record last updated at least `record_ttl` before `now`.
    ///
    /// Returns the number of records removed.
    pub fn prune_expired(&self, now: u64) -> usize {
        let ttl = self.policy.record_ttl.as_secs();
        let removed = self
            .store
            .retain(&mut |record| now.saturating_sub(record.updated_at) < ttl);
        if removed > 0 {
            tracing::debug!("Pruned {} expired retry records", removed);
        }
        removed
    }

    fn maybe_prune(&self, now: u64) {
        let interval = PRUNE_INTERVAL_SECS.min(self.policy.record_ttl.as_secs());
        let last = self.last_prune.load(Ordering::Relaxed);
        if now.saturating_sub(last) < interval {
            return;
        }
        if self
            .last_prune
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.prune_expired(now);
        }
    }
}
