//! Disconnect reasons and reconnect advice.

use crate::binary::BinaryNode;
use std::fmt;

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Credentials were invalidated; do not reconnect with them (401)
    LoggedOut,
    /// Account is banned or the device is forbidden (403)
    Forbidden,
    /// Relay gave up waiting on us (408)
    TimedOut,
    /// Device list out of sync with the account (411)
    MultideviceMismatch,
    /// Relay closed the stream (428)
    ConnectionClosed,
    /// Another connection took over this session (440)
    ConnectionReplaced,
    /// Relay rejected the session state (500)
    BadSession,
    /// Relay temporarily unavailable (503)
    ServiceUnavailable,
    /// Relay asks for an immediate reconnect (515)
    RestartRequired,
    /// Stream ended unexpectedly or keep-alive expired
    ConnectionLost,
    /// Peer violated the wire protocol
    Malformed,
    /// Handshake or certificate validation failed
    HandshakeFailed,
    /// Pairing was cancelled or ran out of codes
    PairingCancelled,
    /// Closed locally through `close()`
    ClosedByClient,
}

/// What the caller should do after a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAdvice {
    /// Reconnecting with the same credentials will not help
    Never,
    /// Reconnect right away with the same credentials
    Immediately,
    /// Reconnect after a backoff delay
    WithBackoff,
}

impl ReconnectAdvice {
    /// Whether any reconnect is advised.
    #[must_use]
    pub fn should_reconnect(self) -> bool {
        !matches!(self, Self::Never)
    }
}

impl DisconnectReason {
    /// Map a relay status code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::TimedOut,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            _ => return None,
        })
    }

    /// Relay status code, for reasons the relay can send.
    #[must_use]
    pub fn code(self) -> Option<u16> {
        Some(match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::TimedOut => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::ServiceUnavailable => 503,
            Self::RestartRequired => 515,
            _ => return None,
        })
    }

    /// Reconnect advice for this reason.
    #[must_use]
    pub fn advice(self) -> ReconnectAdvice {
        match self {
            Self::RestartRequired => ReconnectAdvice::Immediately,
            Self::TimedOut
            | Self::ConnectionClosed
            | Self::ConnectionLost
            | Self::BadSession
            | Self::ServiceUnavailable => ReconnectAdvice::WithBackoff,
            Self::LoggedOut
            | Self::Forbidden
            | Self::MultideviceMismatch
            | Self::ConnectionReplaced
            | Self::Malformed
            | Self::HandshakeFailed
            | Self::PairingCancelled
            | Self::ClosedByClient => ReconnectAdvice::Never,
        }
    }

    /// Whether the stored credentials are no longer usable.
    #[must_use]
    pub fn invalidates_credentials(self) -> bool {
        matches!(self, Self::LoggedOut | Self::MultideviceMismatch)
    }

    /// Classify a `stream:error` stanza.
    #[must_use]
    pub fn from_stream_error(node: &BinaryNode) -> Self {
        if let Some(reason) = node
            .attr("code")
            .and_then(|c| c.parse().ok())
            .and_then(Self::from_code)
        {
            return reason;
        }
        match node.children().first().map(BinaryNode::tag) {
            Some("conflict") => Self::ConnectionReplaced,
            Some("device_removed") => Self::LoggedOut,
            _ => Self::BadSession,
        }
    }

    /// Classify a login `failure` stanza.
    #[must_use]
    pub fn from_failure(node: &BinaryNode) -> Self {
        node.attr("reason")
            .and_then(|c| c.parse().ok())
            .and_then(Self::from_code)
            .unwrap_or(Self::BadSession)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LoggedOut => "logged out",
            Self::Forbidden => "forbidden",
            Self::TimedOut => "timed out",
            Self::MultideviceMismatch => "multi-device mismatch",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionReplaced => "connection replaced",
            Self::BadSession => "bad session",
            Self::ServiceUnavailable => "service unavailable",
            Self::RestartRequired => "restart required",
            Self::ConnectionLost => "connection lost",
            Self::Malformed => "malformed stream",
            Self::HandshakeFailed => "handshake failed",
            Self::PairingCancelled => "pairing cancelled",
            Self::ClosedByClient => "closed by client",
        };
        match self.code() {
            Some(code) => write!(f, "{text} ({code})"),
            None => f.write_str(text),
        }
    }
}
