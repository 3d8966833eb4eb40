//! `Noise_XX` handshake with the relay, driven by `snow`.
//!
//! Pattern:
//!
//! ```text
//! -> e
//! <- e, ee, s, es, [certificate]
//! -> s, se, [login payload]
//! ```
//!
//! Suite: `Noise_XX_25519_ChaChaPoly_BLAKE2s`. The prologue is mixed into
//! the transcript before the first message so both sides commit to the same
//! protocol header. After the third message the raw `Split` keys are lifted
//! out of the Noise state and handed to the frame cipher, which runs its own
//! counter discipline over frames larger than a Noise message may be.
//!
//! The state machine is sans-IO: callers move bytes, this module moves
//! phases. Any error leaves the handshake unusable and it must be dropped.

use crate::CryptoError;
use crate::aead::AeadKey;
use crate::x25519::{KeyPair, PublicKey};
use snow::{Builder, HandshakeState};
use zeroize::Zeroize;

/// Noise protocol name
pub const PROTOCOL_NAME: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Largest Noise handshake message
const MAX_MESSAGE_LEN: usize = 65_535;

/// Which side of the handshake this state drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client side: sends the first message
    Initiator,
    /// Relay side: answers with its static key and certificate
    Responder,
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Nothing exchanged yet
    Init,
    /// Our ephemeral key is on the wire
    SentEphemeral,
    /// Peer ephemeral received and mixed
    ReceivedPeerEphemeral,
    /// Static-key DH results mixed into the chaining key
    MixedStaticKeys,
    /// All three messages processed
    Complete,
}

/// Keys produced by a completed handshake, one per direction.
pub struct TransportKeys {
    /// Key sealing frames we send
    pub send: AeadKey,
    /// Key opening frames we receive
    pub recv: AeadKey,
    /// Final transcript hash, identical on both sides
    pub handshake_hash: [u8; 32],
    /// Static key the peer proved possession of
    pub remote_static: PublicKey,
}

/// In-progress `Noise_XX` handshake.
pub struct Handshake {
    role: Role,
    phase: HandshakePhase,
    state: HandshakeState,
}

impl Handshake {
    /// Start a handshake as the initiator (client).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HandshakeFailed`] if the Noise state cannot be
    /// built.
    pub fn initiator(local_static: &KeyPair, prologue: &[u8]) -> Result<Self, CryptoError> {
        Self::new(Role::Initiator, local_static, prologue)
    }

    /// Start a handshake as the responder (relay).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HandshakeFailed`] if the Noise state cannot be
    /// built.
    pub fn responder(local_static: &KeyPair, prologue: &[u8]) -> Result<Self, CryptoError> {
        Self::new(Role::Responder, local_static, prologue)
    }

    fn new(role: Role, local_static: &KeyPair, prologue: &[u8]) -> Result<Self, CryptoError> {
        let params = PROTOCOL_NAME.parse().map_err(noise_error)?;
        let mut private = local_static.private.to_bytes();
        let built = Builder::new(params)
            .local_private_key(&private)
            .and_then(|builder| builder.prologue(prologue))
            .and_then(|builder| match role {
                Role::Initiator => builder.build_initiator(),
                Role::Responder => builder.build_responder(),
            });
        private.zeroize();

        Ok(Self {
            role,
            phase: HandshakePhase::Init,
            state: built.map_err(noise_error)?,
        })
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Local role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether all handshake messages were processed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Static key of the peer, once it has been decrypted.
    #[must_use]
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.state.get_remote_static().and_then(PublicKey::from_slice)
    }

    /// Check if a transition to the target phase is valid for this role.
    #[must_use]
    pub fn can_transition(&self, to: HandshakePhase) -> bool {
        use HandshakePhase::{Complete, Init, MixedStaticKeys, ReceivedPeerEphemeral, SentEphemeral};

        match self.role {
            Role::Initiator => matches!(
                (self.phase, to),
                (Init, SentEphemeral)
                    | (SentEphemeral, ReceivedPeerEphemeral)
                    | (ReceivedPeerEphemeral, MixedStaticKeys)
                    | (MixedStaticKeys, Complete)
            ),
            Role::Responder => matches!(
                (self.phase, to),
                (Init, ReceivedPeerEphemeral)
                    | (ReceivedPeerEphemeral, SentEphemeral)
                    | (SentEphemeral, MixedStaticKeys)
                    | (MixedStaticKeys, Complete)
            ),
        }
    }

    fn transition_to(&mut self, to: HandshakePhase) -> Result<(), CryptoError> {
        if !self.can_transition(to) {
            return Err(unexpected(self.phase));
        }
        tracing::debug!(
            "Handshake phase transition ({:?}): {:?} -> {:?}",
            self.role,
            self.phase,
            to
        );
        self.phase = to;
        Ok(())
    }

    /// Produce the next outbound handshake message carrying `payload`.
    ///
    /// The initiator writes messages one and three, the responder writes
    /// message two. The first message's payload travels unencrypted.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HandshakeFailed`] when it is not this side's turn
    /// to write or Noise refuses the message.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::Init) => HandshakePhase::SentEphemeral,
            (Role::Responder, HandshakePhase::ReceivedPeerEphemeral) => HandshakePhase::SentEphemeral,
            (Role::Initiator, HandshakePhase::MixedStaticKeys) => HandshakePhase::Complete,
            (_, phase) => return Err(unexpected(phase)),
        };

        let mut out = vec![0u8; MAX_MESSAGE_LEN];
        let len = self
            .state
            .write_message(payload, &mut out)
            .map_err(noise_error)?;
        out.truncate(len);

        self.transition_to(next)?;
        Ok(out)
    }

    /// Consume an inbound handshake message and return its payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HandshakeFailed`] when the message arrives in an
    /// unexpected phase, is malformed or fails authentication.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Messages one and two open with the peer ephemeral
        let (steps, ephemeral): (&[HandshakePhase], bool) = match (self.role, self.phase) {
            (Role::Responder, HandshakePhase::Init) => (&[HandshakePhase::ReceivedPeerEphemeral], true),
            (Role::Initiator, HandshakePhase::SentEphemeral) => (
                &[
                    HandshakePhase::ReceivedPeerEphemeral,
                    HandshakePhase::MixedStaticKeys,
                ],
                true,
            ),
            (Role::Responder, HandshakePhase::SentEphemeral) => (
                &[HandshakePhase::MixedStaticKeys, HandshakePhase::Complete],
                false,
            ),
            (_, phase) => return Err(unexpected(phase)),
        };
        if ephemeral {
            reject_low_order(message.get(..32))?;
        }

        let mut payload = vec![0u8; message.len()];
        let len = self
            .state
            .read_message(message, &mut payload)
            .map_err(noise_error)?;
        payload.truncate(len);
        reject_low_order(self.state.get_remote_static())?;

        for step in steps {
            self.transition_to(*step)?;
        }
        Ok(payload)
    }

    /// Derive the transport keys and destroy the handshake state.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if the handshake is not complete.
    pub fn into_transport(mut self) -> Result<TransportKeys, CryptoError> {
        if !self.is_complete() || !self.state.is_handshake_finished() {
            return Err(CryptoError::InvalidState);
        }
        let remote_static = self.remote_static().ok_or(CryptoError::InvalidState)?;
        let handshake_hash: [u8; 32] = self
            .state
            .get_handshake_hash()
            .try_into()
            .map_err(|_| CryptoError::InvalidState)?;

        // First key always seals initiator-to-responder traffic
        let (mut first, mut second) = self.state.dangerously_get_raw_split();
        let (send, recv) = match self.role {
            Role::Initiator => (AeadKey::new(first), AeadKey::new(second)),
            Role::Responder => (AeadKey::new(second), AeadKey::new(first)),
        };
        first.zeroize();
        second.zeroize();

        Ok(TransportKeys {
            send,
            recv,
            handshake_hash,
            remote_static,
        })
    }
}

/// Refuse a peer key whose DH result would be all zero.
///
/// `None` passes: the static key is only present from message two on.
fn reject_low_order(key: Option<&[u8]>) -> Result<(), CryptoError> {
    let Some(bytes) = key else {
        return Ok(());
    };
    let public = PublicKey::from_slice(bytes)
        .ok_or_else(|| CryptoError::HandshakeFailed("truncated key".into()))?;
    KeyPair::generate()
        .private
        .diffie_hellman(&public)
        .map(drop)
        .map_err(|_| CryptoError::HandshakeFailed("low-order public key".into()))
}

fn noise_error(e: snow::Error) -> CryptoError {
    CryptoError::HandshakeFailed(e.to_string())
}

fn unexpected(phase: HandshakePhase) -> CryptoError {
    CryptoError::HandshakeFailed(format!("unexpected message in phase {phase:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::{Nonce, NonceDomain};

    const PROLOGUE: &[u8] = b"CR\x01\x00";

    fn pair(client: &KeyPair, server: &KeyPair) -> (Handshake, Handshake) {
        (
            Handshake::initiator(client, PROLOGUE).unwrap(),
            Handshake::responder(server, PROLOGUE).unwrap(),
        )
    }

    fn run(initiator: &mut Handshake, responder: &mut Handshake) -> Vec<Vec<u8>> {
        let m1 = initiator.write_message(&[]).unwrap();
        responder.read_message(&m1).unwrap();
        let m2 = responder.write_message(b"cert").unwrap();
        assert_eq!(initiator.read_message(&m2).unwrap(), b"cert");
        let m3 = initiator.write_message(b"login").unwrap();
        assert_eq!(responder.read_message(&m3).unwrap(), b"login");
        vec![m1, m2, m3]
    }

    #[test]
    fn test_handshake_completes_in_three_messages() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let (mut initiator, mut responder) = pair(&client, &server);

        let messages = run(&mut initiator, &mut responder);
        assert_eq!(messages.len(), 3);
        // e | e, enc(s), enc(payload) | enc(s), enc(payload)
        assert_eq!(messages[0].len(), 32);
        assert_eq!(messages[1].len(), 32 + 48 + 4 + 16);
        assert_eq!(messages[2].len(), 48 + 5 + 16);
        assert!(initiator.is_complete());
        assert!(responder.is_complete());
        assert_eq!(initiator.remote_static(), Some(server.public));
        assert_eq!(responder.remote_static(), Some(client.public));

        let i = initiator.into_transport().unwrap();
        let r = responder.into_transport().unwrap();
        assert_eq!(i.handshake_hash, r.handshake_hash);
        assert_eq!(i.remote_static, server.public);

        let nonce = Nonce::new(NonceDomain::Frame, 0);
        let upstream = i.send.seal(&nonce, b"up", b"").unwrap();
        assert_eq!(r.recv.open(&nonce, &upstream, b"").unwrap(), b"up");
        let downstream = r.send.seal(&nonce, b"down", b"").unwrap();
        assert_eq!(i.recv.open(&nonce, &downstream, b"").unwrap(), b"down");
        // Directions use distinct keys
        assert!(i.recv.open(&nonce, &upstream, b"").is_err());
    }

    #[test]
    fn test_phase_sequence() {
        let (mut initiator, mut responder) = pair(&KeyPair::generate(), &KeyPair::generate());
        assert_eq!(initiator.phase(), HandshakePhase::Init);

        let m1 = initiator.write_message(&[]).unwrap();
        assert_eq!(initiator.phase(), HandshakePhase::SentEphemeral);
        responder.read_message(&m1).unwrap();
        assert_eq!(responder.phase(), HandshakePhase::ReceivedPeerEphemeral);

        let m2 = responder.write_message(&[]).unwrap();
        assert_eq!(responder.phase(), HandshakePhase::SentEphemeral);
        initiator.read_message(&m2).unwrap();
        assert_eq!(initiator.phase(), HandshakePhase::MixedStaticKeys);
    }

    #[test]
    fn test_tampered_finish_fails_responder() {
        let len = {
            let (mut initiator, mut responder) = pair(&KeyPair::generate(), &KeyPair::generate());
            run(&mut initiator, &mut responder)[2].len()
        };

        for i in 0..len {
            let (mut initiator, mut responder) = pair(&KeyPair::generate(), &KeyPair::generate());

            let m1 = initiator.write_message(&[]).unwrap();
            responder.read_message(&m1).unwrap();
            let m2 = responder.write_message(b"cert").unwrap();
            initiator.read_message(&m2).unwrap();
            let mut m3 = initiator.write_message(b"login").unwrap();
            m3[i] ^= 0x01;

            assert!(matches!(
                responder.read_message(&m3),
                Err(CryptoError::HandshakeFailed(_))
            ));
            assert!(!responder.is_complete());
        }
    }

    #[test]
    fn test_tampered_hello_fails_initiator() {
        let (mut initiator, mut responder) = pair(&KeyPair::generate(), &KeyPair::generate());

        let m1 = initiator.write_message(&[]).unwrap();
        responder.read_message(&m1).unwrap();
        let mut m2 = responder.write_message(b"cert").unwrap();
        let last = m2.len() - 1;
        m2[last] ^= 0x01;

        assert!(matches!(
            initiator.read_message(&m2),
            Err(CryptoError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_prologue_mismatch_fails() {
        let mut initiator = Handshake::initiator(&KeyPair::generate(), b"CR\x01\x00").unwrap();
        let mut responder = Handshake::responder(&KeyPair::generate(), b"CR\x02\x00").unwrap();

        let m1 = initiator.write_message(&[]).unwrap();
        responder.read_message(&m1).unwrap();
        let m2 = responder.write_message(b"cert").unwrap();
        assert!(initiator.read_message(&m2).is_err());
    }

    #[test]
    fn test_unexpected_message_rejected() {
        let (mut initiator, mut responder) = pair(&KeyPair::generate(), &KeyPair::generate());
        assert!(matches!(
            initiator.read_message(&[0u8; 96]),
            Err(CryptoError::HandshakeFailed(_))
        ));
        assert!(responder.write_message(&[]).is_err());
    }

    #[test]
    fn test_low_order_ephemeral_rejected() {
        let mut responder = Handshake::responder(&KeyPair::generate(), PROLOGUE).unwrap();
        assert!(matches!(
            responder.read_message(&[0u8; 32]),
            Err(CryptoError::HandshakeFailed(_))
        ));
        assert_eq!(responder.phase(), HandshakePhase::Init);
    }

    #[test]
    fn test_into_transport_requires_completion() {
        let initiator = Handshake::initiator(&KeyPair::generate(), PROLOGUE).unwrap();
        assert!(matches!(
            initiator.into_transport(),
            Err(CryptoError::InvalidState)
        ));
    }
}
