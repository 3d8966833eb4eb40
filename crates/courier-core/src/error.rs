//! Error types for the Courier protocol engine.
//!
//! Errors are classified so callers can decide what to do next:
//!
//! - **Fatal**: the connection is torn down (`HandshakeFailure`, `FrameOrder`,
//!   `MalformedNode`, transport failures)
//! - **Transient**: the operation may succeed if retried (`QueryTimeout`,
//!   `NotConnected`, recoverable disconnects)
//! - **Absorbed**: decryption problems handled by the retry coordinator until
//!   they surface as `RetryExhausted`

use crate::connection::DisconnectReason;
use courier_crypto::CryptoError;
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Debug, Error, Clone)]
pub enum Error {
    // ============ Codec & Transport Errors ============
    /// Node could not be decoded (or encoded)
    #[error("malformed node: {0}")]
    MalformedNode(#[from] CodecError),

    /// Byte-stream or framing failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake or certificate validation failed
    #[error("handshake failure: {0}")]
    HandshakeFailure(Cow<'static, str>),

    /// Frame counter did not match the next expected value
    #[error("frame order violation: expected counter {expected}, got {received}")]
    FrameOrder {
        /// Counter the receiver expected
        expected: u64,
        /// Counter carried by the frame
        received: u64,
    },

    // ============ Request Errors ============
    /// No matching response arrived in time
    #[error("query {tag} timed out after {timeout:?}")]
    QueryTimeout {
        /// Message tag of the query
        tag: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Server answered with an error stanza
    #[error("server error {code}: {text}")]
    ServerError {
        /// Numeric error code
        code: u16,
        /// Error text
        text: String,
    },

    /// Response was well-formed on the wire but not what the request expects
    #[error("unexpected response: {0}")]
    UnexpectedResponse(Cow<'static, str>),

    /// Operation requires an open connection
    #[error("not connected")]
    NotConnected,

    /// Connection closed while the operation was pending
    #[error("connection closed: {0}")]
    ConnectionClosed(DisconnectReason),

    // ============ Session Errors ============
    /// Ciphertext could not be decrypted
    #[error("decryption failure: {0}")]
    DecryptionFailure(Cow<'static, str>),

    /// Group message arrived before the sender's key distribution
    #[error("missing sender key for {sender} in {group}")]
    MissingSenderKey {
        /// Group JID
        group: String,
        /// Sender address
        sender: String,
    },

    /// No session exists and no prekey bundle was supplied
    #[error("no session available for {0}")]
    NoSessionAvailable(String),

    /// Retry budget exhausted for a message
    #[error("retries exhausted for message {message_id} after {attempts} attempts")]
    RetryExhausted {
        /// Message id
        message_id: String,
        /// Attempts made
        attempts: u32,
    },

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Credential or retry store failure
    #[error("store error: {0}")]
    Store(String),

    /// Other cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Event consumer went away
    #[error("event channel closed")]
    EventChannelClosed,
}

impl Error {
    /// Whether the error must tear down the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedNode(_)
                | Self::Transport(_)
                | Self::HandshakeFailure(_)
                | Self::FrameOrder { .. }
        )
    }

    /// Whether retrying the operation might succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueryTimeout { .. }
            | Self::NotConnected
            | Self::DecryptionFailure(_)
            | Self::MissingSenderKey { .. } => true,
            Self::ConnectionClosed(reason) => reason.advice().should_reconnect(),
            _ => false,
        }
    }

    /// Disconnect reason to report when this error closes the connection.
    #[must_use]
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::MalformedNode(_)
            | Self::FrameOrder { .. }
            | Self::Transport(
                TransportError::AuthenticationFailed
                | TransportError::BadIntro
                | TransportError::FrameTooLarge { .. },
            ) => DisconnectReason::Malformed,
            Self::HandshakeFailure(_) => DisconnectReason::HandshakeFailed,
            Self::ConnectionClosed(reason) => *reason,
            Self::QueryTimeout { .. } => DisconnectReason::TimedOut,
            _ => DisconnectReason::ConnectionLost,
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::HandshakeFailed(msg) | CryptoError::InvalidCertificate(msg) => {
                Self::HandshakeFailure(Cow::Owned(msg))
            }
            CryptoError::FrameOrder { expected, received } => Self::FrameOrder { expected, received },
            CryptoError::DecryptionFailed
            | CryptoError::ReplayDetected
            | CryptoError::TooManySkipped { .. }
            | CryptoError::SenderKeyMismatch { .. }
            | CryptoError::UnknownPreKey(_)
            | CryptoError::InvalidMessage(_) => Self::DecryptionFailure(Cow::Owned(err.to_string())),
            other => Self::Crypto(other),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(TransportError::from(err))
    }
}

/// Binary node codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the value was complete
    #[error("truncated input: needed {needed} bytes at offset {offset}")]
    Truncated {
        /// Offset of the read
        offset: usize,
        /// Bytes required
        needed: usize,
    },

    /// Bytes left after the root node
    #[error("{0} trailing bytes after node")]
    TrailingBytes(usize),

    /// Leading flags byte is not supported
    #[error("unsupported flags byte 0x{0:02X}")]
    UnsupportedFlags(u8),

    /// Wire tag byte has no meaning
    #[error("unknown wire tag 0x{0:02X}")]
    UnknownTag(u8),

    /// Dictionary index beyond the static table
    #[error("dictionary index {0} out of range")]
    TokenOutOfRange(u8),

    /// String was not valid UTF-8
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Invalid packed nibble
    #[error("invalid nibble 0x{0:X}")]
    InvalidNibble(u8),

    /// Nesting exceeds the configured depth
    #[error("nesting deeper than {0}")]
    DepthExceeded(usize),

    /// Node tag was empty
    #[error("empty node tag")]
    EmptyTag,

    /// Attribute key repeated within one node
    #[error("duplicate attribute {0}")]
    DuplicateAttribute(String),

    /// List header does not describe a node
    #[error("invalid list size {0}")]
    InvalidListSize(usize),

    /// Value too large for the encoding
    #[error("value too large to encode: {0} items")]
    TooLarge(usize),
}

/// Transport-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Frame length exceeds the configured maximum
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Peer closed the stream
    #[error("stream closed by peer")]
    Eof,

    /// Stream ended in the middle of a frame
    #[error("stream closed mid-frame with {0} buffered bytes")]
    UnexpectedEof(usize),

    /// Sealed frame failed authentication
    #[error("frame failed authentication")]
    AuthenticationFailed,

    /// Connection did not start with the expected intro header
    #[error("bad intro header")]
    BadIntro,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Connect or handshake did not finish in time
    #[error("timed out: {0}")]
    Timeout(Cow<'static, str>),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
