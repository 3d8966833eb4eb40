//! Connection lifecycle states.

use crate::connection::reason::DisconnectReason;
use crate::error::{Error, Result};
use std::borrow::Cow;
use std::fmt;
use std::time::Instant;

/// Lifecycle state of one logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opening the byte stream
    Connecting,
    /// Noise handshake in progress
    Handshaking,
    /// Waiting for the account to link this device
    Pairing,
    /// Authenticated and pumping stanzas
    Open,
    /// Tearing down
    Closing,
    /// Fully closed; a new connection must be started by the caller
    Closed,
}

impl ConnectionState {
    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Connecting, Handshaking | Closing)
                | (Handshaking, Pairing | Open | Closing)
                | (Pairing, Open | Closing)
                | (Open, Closing)
                | (Closing, Closed)
                | (Closed, Connecting)
        )
    }

    /// Name used in connection updates.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Pairing => "pairing",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state machine
///
/// Tracks the current state, when it was entered, and the reason the
/// connection closed.
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    entered_at: Instant,
    opened_at: Option<Instant>,
    close_reason: Option<DisconnectReason>,
}

impl StateMachine {
    /// New machine in [`ConnectionState::Closed`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Closed,
            entered_at: Instant::now(),
            opened_at: None,
            close_reason: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// When the current state was entered.
    #[must_use]
    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    /// When the connection last reached [`ConnectionState::Open`].
    #[must_use]
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Reason recorded when the connection began closing.
    #[must_use]
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason
    }

    /// Whether `to` is reachable from the current state.
    #[must_use]
    pub fn can_transition(&self, to: ConnectionState) -> bool {
        self.state.can_transition(to)
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for an illegal transition.
    pub fn transition_to(&mut self, to: ConnectionState) -> Result<()> {
        if !self.can_transition(to) {
            return Err(Error::InvalidState(Cow::Owned(format!(
                "illegal connection transition {} -> {}",
                self.state, to
            ))));
        }

        let from = self.state;
        self.state = to;
        self.entered_at = Instant::now();
        match to {
            ConnectionState::Connecting => {
                self.opened_at = None;
                self.close_reason = None;
            }
            ConnectionState::Open => self.opened_at = Some(self.entered_at),
            _ => {}
        }

        tracing::debug!("Connection state transition: {:?} -> {:?}", from, to);
        Ok(())
    }

    /// Move to [`ConnectionState::Closing`], keeping the first reason given.
    ///
    /// Returns `false` if the machine is already closing or closed.
    pub fn begin_close(&mut self, reason: DisconnectReason) -> bool {
        if !self.can_transition(ConnectionState::Closing) {
            return false;
        }
        self.close_reason.get_or_insert(reason);
        self.transition_to(ConnectionState::Closing).is_ok()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path() {
        let mut sm = StateMachine::new();
        for state in [Connecting, Handshaking, Pairing, Open, Closing, Closed, Connecting] {
            sm.transition_to(state).unwrap();
            assert_eq!(sm.state(), state);
        }
        assert!(sm.opened_at().is_none());
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Closed.can_transition(Open));
        assert!(!Open.can_transition(Pairing));
        assert!(!Open.can_transition(Closed));
        assert!(!Pairing.can_transition(Handshaking));
        assert!(!Closing.can_transition(Open));

        let mut sm = StateMachine::new();
        assert!(matches!(
            sm.transition_to(Open),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(sm.state(), Closed);
    }

    #[test]
    fn test_begin_close_keeps_first_reason() {
        let mut sm = StateMachine::new();
        sm.transition_to(Connecting).unwrap();
        sm.transition_to(Handshaking).unwrap();
        sm.transition_to(Open).unwrap();
        assert!(sm.opened_at().is_some());

        assert!(sm.begin_close(DisconnectReason::ConnectionLost));
        assert!(!sm.begin_close(DisconnectReason::ClosedByClient));
        assert_eq!(sm.close_reason(), Some(DisconnectReason::ConnectionLost));
        assert_eq!(sm.state(), Closing);
    }
}
