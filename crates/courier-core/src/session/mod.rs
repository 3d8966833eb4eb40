//! End-to-end sessions: pairwise Double Ratchet sessions established over
//! X3DH, and sender keys for groups.

mod address;
mod manager;

pub use address::{ProtocolAddress, SenderKeyName};
pub use manager::{CiphertextKind, EncryptedMessage, SessionManager, SessionRecord, SessionSnapshot};
