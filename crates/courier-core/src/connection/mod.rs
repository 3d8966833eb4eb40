//! Connection lifecycle: handshake, state machine, stanza pump and the
//! [`Client`] that ties them together.

mod client;
mod handshake;
mod messaging;
mod pairing;
mod pump;
mod reason;
mod state;

pub use client::Client;
pub use handshake::{CertificateTrust, SecureChannel, client_handshake};
pub use messaging::MessageLookup;
pub use pairing::{PAIRING_CODE_ALPHABET, format_pairing_code, generate_pairing_code};
pub use reason::{DisconnectReason, ReconnectAdvice};
pub use state::{ConnectionState, StateMachine};
