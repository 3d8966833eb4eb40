//! Client configuration

use crate::binary::DEFAULT_MAX_DEPTH;
use crate::error::{Error, Result};
use crate::frame::MAX_ENCODABLE_FRAME;
use crate::jid::Jid;
use courier_crypto::signatures::VerifyingKey;
use std::borrow::Cow;
use std::time::Duration;

/// Predicate deciding whether inbound stanzas from a JID are ignored
pub type JidFilter = fn(&Jid) -> bool;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Transport configuration
    pub transport: TransportConfig,

    /// Pairing configuration
    pub pairing: PairingConfig,

    /// Session configuration
    pub session: SessionConfig,

    /// Retry policy
    pub retry: RetryPolicy,

    /// Keep-alive configuration
    pub keep_alive: KeepAliveConfig,

    /// Timeout applied to queries issued without an explicit one
    pub default_query_timeout: Duration,

    /// Capacity of the event batch channel
    pub event_channel_capacity: usize,

    /// Inbound messages from matching JIDs are acked but not processed
    pub should_ignore_jid: Option<JidFilter>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            pairing: PairingConfig::default(),
            session: SessionConfig::default(),
            retry: RetryPolicy::default(),
            keep_alive: KeepAliveConfig::default(),
            default_query_timeout: Duration::from_secs(60),
            event_channel_capacity: 256,
            should_ignore_jid: None,
        }
    }
}

impl ClientConfig {
    /// Reject configurations the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &'static str| Err(Error::InvalidConfig(Cow::Borrowed(msg)));

        if self.transport.trusted_root.is_none() {
            return invalid("transport.trusted_root must be set");
        }
        if self.transport.certificate_issuer.is_empty() {
            return invalid("transport.certificate_issuer must not be empty");
        }
        if self.transport.max_frame_size == 0 || self.transport.max_frame_size > MAX_ENCODABLE_FRAME
        {
            return invalid("transport.max_frame_size must be between 1 and 2^24 - 1");
        }
        if self.transport.max_node_depth == 0 {
            return invalid("transport.max_node_depth must be positive");
        }
        if self.transport.connect_timeout.is_zero() || self.default_query_timeout.is_zero() {
            return invalid("timeouts must be positive");
        }
        if self.keep_alive.enabled && self.keep_alive.interval.is_zero() {
            return invalid("keep_alive.interval must be positive");
        }
        if self.pairing.max_qr_codes == 0 {
            return invalid("pairing.max_qr_codes must be positive");
        }
        if let Some(phone) = &self.pairing.phone_number {
            if phone.is_empty() || !phone.bytes().all(|b| b.is_ascii_digit()) {
                return invalid("pairing.phone_number must contain digits only");
            }
        }
        if self.session.prekey_batch_size == 0 {
            return invalid("session.prekey_batch_size must be positive");
        }
        if self.session.min_server_prekeys > self.session.prekey_batch_size {
            return invalid("session.min_server_prekeys exceeds the upload batch size");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be positive");
        }
        if self.retry.record_ttl.as_secs() == 0 {
            return invalid("retry.record_ttl must be at least one second");
        }
        if self.event_channel_capacity == 0 {
            return invalid("event_channel_capacity must be positive");
        }
        Ok(())
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay endpoint (`host:port`)
    pub relay_addr: String,

    /// Connect plus handshake deadline
    pub connect_timeout: Duration,

    /// Largest accepted frame body
    pub max_frame_size: usize,

    /// Deepest accepted node nesting
    pub max_node_depth: usize,

    /// Root key the relay certificate must be signed by
    pub trusted_root: Option<VerifyingKey>,

    /// Issuer the relay certificate must name
    pub certificate_issuer: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_addr: "relay.courier.net:443".to_string(),
            connect_timeout: Duration::from_secs(20),
            max_frame_size: 4 * 1024 * 1024, // 4 MB
            max_node_depth: DEFAULT_MAX_DEPTH,
            trusted_root: None,
            certificate_issuer: "courier-root".to_string(),
        }
    }
}

/// Pairing configuration
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Lifetime of the first QR code
    pub initial_qr_timeout: Duration,

    /// Lifetime of each following QR code
    pub qr_timeout: Duration,

    /// Most QR codes shown per login attempt
    pub max_qr_codes: usize,

    /// Use the pairing-code flow for this number instead of QR codes
    pub phone_number: Option<String>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            initial_qr_timeout: Duration::from_secs(60),
            qr_timeout: Duration::from_secs(20),
            max_qr_codes: 6,
            phone_number: None,
        }
    }
}

/// End-to-end session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Skipped message keys kept per chain before decryption gives up
    pub max_skipped_keys: u32,

    /// Age after which the signed prekey is replaced
    pub signed_prekey_rotation: Duration,

    /// One-time prekeys generated per upload
    pub prekey_batch_size: u32,

    /// Upload when the server holds fewer one-time prekeys than this
    pub min_server_prekeys: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skipped_keys: 2000,
            signed_prekey_rotation: Duration::from_secs(7 * 24 * 3600), // 1 week
            prekey_batch_size: 30,
            min_server_prekeys: 5,
        }
    }
}

/// Retry policy for decryption-failure receipts
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Resends allowed per message before giving up
    pub max_attempts: u32,

    /// Records untouched for this long are pruned, exhausted or not
    pub record_ttl: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            record_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Keep-alive configuration
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Send pings while open
    pub enabled: bool,

    /// Ping interval
    pub interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}
