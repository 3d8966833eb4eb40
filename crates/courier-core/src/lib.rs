//! # Courier Core
//!
//! Protocol engine for a multi-device messaging client.
//!
//! This crate provides:
//! - Binary node codec with a static token dictionary
//! - Length-prefixed framing sealed after the relay handshake
//! - Connection state machine and stanza pump
//! - End-to-end sessions (X3DH, double ratchet, sender keys)
//! - Retry/ack coordination for undecryptable messages
//! - Batched, typed event delivery
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Client                                 │
//! │   (state machine, queries, pairing, send/receive, events)       │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │   SessionManager             │   RetryCoordinator               │
//! │   (per-device ratchets,      │   (bounded resends, acks)        │
//! │    group sender keys)        │                                  │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │                     Binary nodes                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Framed, sealed transport                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod binary;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod events;
pub mod frame;
pub mod jid;
pub mod retry;
pub mod session;
pub mod stanza;
pub mod transport;

pub use binary::{BinaryNode, NodeBuilder, NodeContent, decode, encode};
pub use config::{
    ClientConfig, JidFilter, KeepAliveConfig, PairingConfig, RetryPolicy, SessionConfig,
    TransportConfig,
};
pub use connection::{Client, ConnectionState, DisconnectReason, MessageLookup, ReconnectAdvice};
pub use credentials::{
    AuthState, CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore,
};
pub use error::{CodecError, Error, Result, TransportError};
pub use events::{Event, EventBatch, EventKind, EventStream};
pub use jid::Jid;
pub use retry::{MemoryRetryStore, MessageIdentity, RetryCoordinator, RetryStore};
pub use session::{ProtocolAddress, SenderKeyName, SessionManager};

/// Seconds since the Unix epoch.
///
/// A clock set before the epoch is an error rather than a zero timestamp:
/// certificate expiry and record ages are computed from this value.
pub(crate) fn unix_now() -> Result<u64> {
    epoch_secs(std::time::SystemTime::now())
}

fn epoch_secs(at: std::time::SystemTime) -> Result<u64> {
    at.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| Error::InvalidState(std::borrow::Cow::Borrowed("system clock is before the unix epoch")))
}
