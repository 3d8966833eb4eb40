//! Device pairing and post-login key maintenance.
//!
//! A fresh device is led into pairing by the relay's `pair-device` iq.
//! Either QR codes are shown, one per reference the relay handed out, or
//! a pairing code is requested for a phone number; only one flow runs per
//! login attempt. `pair-success` completes either flow.

use super::client::Client;
use super::pump::Disposition;
use super::reason::DisconnectReason;
use super::state::ConnectionState;
use crate::binary::BinaryNode;
use crate::error::{Error, Result};
use crate::events::{ConnectionUpdate, Event, EventBuffer};
use crate::jid::Jid;
use crate::stanza;
use crate::unix_now;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use courier_crypto::hash::verify_mac;
use rand::Rng;
use std::borrow::Cow;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;

/// Characters a pairing code is drawn from (no `0`, `I`, `O` or `U`)
pub const PAIRING_CODE_ALPHABET: &[u8; 32] = b"123456789ABCDEFGHJKLMNPQRSTVWXYZ";

/// Length of a pairing code
const PAIRING_CODE_LEN: usize = 8;

/// Random pairing code.
#[must_use]
pub fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..PAIRING_CODE_LEN)
        .map(|_| PAIRING_CODE_ALPHABET[rng.gen_range(0..PAIRING_CODE_ALPHABET.len())] as char)
        .collect()
}

/// `ABCD1234` -> `ABCD-1234`.
#[must_use]
pub fn format_pairing_code(code: &str) -> String {
    let split = code.len() / 2;
    match (code.get(..split), code.get(split..)) {
        (Some(head), Some(tail)) if !code.is_empty() => format!("{head}-{tail}"),
        _ => code.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pairing
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    pub(crate) async fn handle_pair_device(&self, node: &BinaryNode) -> Disposition {
        if let Err(e) = self.transition(ConnectionState::Pairing).await {
            tracing::warn!("Ignoring pair-device: {}", e);
            return Disposition::Continue;
        }
        if let Err(e) = self.send_frame(&stanza::iq_result(node)).await {
            tracing::warn!("Failed to acknowledge pair-device: {}", e);
        }

        let refs: Vec<String> = node
            .child("pair-device")
            .map(|pair| {
                pair.children_by_tag("ref")
                    .filter_map(BinaryNode::bytes)
                    .map(|r| String::from_utf8_lossy(r).into_owned())
                    .take(self.inner.config.pairing.max_qr_codes)
                    .collect()
            })
            .unwrap_or_default();
        tracing::info!("Pairing requested with {} QR references", refs.len());

        let Some(shutdown) = self.shutdown_signal().await else {
            return Disposition::Continue;
        };
        match self.inner.config.pairing.phone_number.clone() {
            Some(phone) => {
                let client = self.clone();
                self.spawn_task("pairing code request", async move {
                    client.request_pairing_code(&phone).await.map(|_| ())
                })
                .await;
            }
            None => {
                let client = self.clone();
                self.spawn_task("QR rotation", async move {
                    client.rotate_qr_codes(refs, shutdown).await;
                    Ok(())
                })
                .await;
            }
        }
        Disposition::Continue
    }

    async fn rotate_qr_codes(&self, refs: Vec<String>, mut shutdown: watch::Receiver<bool>) {
        let (noise, identity, adv_secret) = {
            let creds = self.inner.creds.read().await;
            (
                STANDARD.encode(creds.noise_key.public.as_bytes()),
                STANDARD.encode(creds.identity.public().to_bytes()),
                STANDARD.encode(creds.adv_secret),
            )
        };
        let pairing = &self.inner.config.pairing;

        for (index, reference) in refs.iter().enumerate() {
            if self.inner.pairing_code_requested.load(Ordering::Acquire)
                || self.state() != ConnectionState::Pairing
            {
                return;
            }

            let update = ConnectionUpdate {
                qr: Some(format!("{reference},{noise},{identity},{adv_secret}")),
                ..ConnectionUpdate::state(ConnectionState::Pairing)
            };
            self.emit(Event::ConnectionUpdate(update)).await;

            let lifetime = qr_lifetime(index, pairing.initial_qr_timeout, pairing.qr_timeout);
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(lifetime) => {}
            }
        }

        if !self.inner.pairing_code_requested.load(Ordering::Acquire)
            && self.state() == ConnectionState::Pairing
        {
            tracing::info!("QR codes exhausted without pairing");
            self.close_with(DisconnectReason::PairingCancelled).await;
        }
    }

    /// Pair by code instead of QR for the account behind `phone_number`.
    ///
    /// Stops the QR rotation and returns the code, formatted `XXXX-XXXX`,
    /// for the user to type on the primary device. The code is also
    /// delivered as a `connection.update`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `phone_number` is not all digits
    /// - [`Error::NotConnected`] unless the connection awaits pairing
    /// - query errors from the relay
    pub async fn request_pairing_code(&self, phone_number: &str) -> Result<String> {
        if phone_number.is_empty() || !phone_number.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidConfig(Cow::Borrowed(
                "phone number must contain digits only",
            )));
        }
        self.ensure_state(ConnectionState::Pairing)?;
        self.inner
            .pairing_code_requested
            .store(true, Ordering::Release);

        let code = generate_pairing_code();
        let phone = Jid::user(phone_number);
        let request = {
            let mut creds = self.inner.creds.write().await;
            creds.pairing_code = Some(code.clone());
            creds.me = Some(phone.clone());
            stanza::companion_hello(
                &self.generate_message_tag(),
                &phone,
                &code,
                &creds.noise_key.public,
            )
        };
        self.send_query(request, self.inner.config.default_query_timeout)
            .await?;

        self.persist().await?;
        let formatted = format_pairing_code(&code);
        tracing::info!("Pairing code issued for {}", phone);
        self.emit(self.creds_update_event().await).await;
        self.emit(Event::ConnectionUpdate(ConnectionUpdate {
            pairing_code: Some(formatted.clone()),
            ..ConnectionUpdate::state(ConnectionState::Pairing)
        }))
        .await;
        Ok(formatted)
    }

    pub(crate) async fn handle_pair_success(
        &self,
        node: &BinaryNode,
        buffer: &mut EventBuffer,
    ) -> Disposition {
        match self.complete_pairing(node).await {
            Ok(device) => {
                tracing::info!("Paired as {}", device);
                buffer.push(self.creds_update_event().await);
                if let Err(e) = self.transition(ConnectionState::Open).await {
                    tracing::warn!("{}", e);
                    return Disposition::Continue;
                }
                buffer.push(Event::ConnectionUpdate(ConnectionUpdate {
                    is_new_login: true,
                    ..ConnectionUpdate::state(ConnectionState::Open)
                }));
                self.spawn_after_open().await;
                Disposition::Continue
            }
            Err(e) => {
                tracing::warn!("Pairing rejected: {}", e);
                let reply = BinaryNode::builder("iq")
                    .attr_opt("to", node.attr("from"))
                    .attr_opt("id", node.attr("id"))
                    .attr("type", "error")
                    .child(
                        BinaryNode::builder("error")
                            .attr("code", "401")
                            .attr("text", "not-authorized")
                            .build(),
                    )
                    .build();
                if let Err(e) = self.send_frame(&reply).await {
                    tracing::debug!("Failed to reject pairing: {}", e);
                }
                Disposition::Close(DisconnectReason::BadSession)
            }
        }
    }

    async fn complete_pairing(&self, node: &BinaryNode) -> Result<Jid> {
        let unexpected = |text: &'static str| Error::UnexpectedResponse(Cow::Borrowed(text));
        let success = node
            .child("pair-success")
            .ok_or_else(|| unexpected("missing pair-success"))?;
        let device: Jid = success
            .child("device")
            .and_then(|d| d.attr("jid"))
            .and_then(|j| j.parse().ok())
            .ok_or_else(|| unexpected("pair-success without a device jid"))?;
        let identity = success
            .child("device-identity")
            .ok_or_else(|| unexpected("pair-success without a device identity"))?;
        let details = identity
            .child_bytes("details")
            .ok_or_else(|| unexpected("device identity without details"))?;
        let mac = identity
            .child_bytes("hmac")
            .ok_or_else(|| unexpected("device identity without hmac"))?;

        let signature = {
            let mut creds = self.inner.creds.write().await;
            let expected = stanza::device_identity_mac(&creds.adv_secret, details);
            if !verify_mac(&expected, mac) {
                return Err(Error::HandshakeFailure(Cow::Borrowed(
                    "device identity hmac mismatch",
                )));
            }
            creds.me = Some(device.clone());
            creds.registered = true;
            creds.pairing_code = None;
            creds.identity.sign(details)
        };
        self.persist().await?;
        self.send_frame(&stanza::pair_device_sign(node, details, &signature))
            .await?;
        Ok(device)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Key maintenance
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    pub(crate) async fn spawn_after_open(&self) {
        let client = self.clone();
        self.spawn_task("post-login key maintenance", async move {
            if let Err(e) = client.upload_prekeys_if_needed().await {
                tracing::warn!("Prekey upload failed: {}", e);
            }
            client.rotate_signed_prekey_if_due().await.map(|_| ())
        })
        .await;
    }

    /// Upload a fresh batch of one-time prekeys if the relay holds fewer
    /// than the configured minimum.
    ///
    /// Returns whether an upload happened.
    ///
    /// # Errors
    ///
    /// Returns query or store errors.
    pub async fn upload_prekeys_if_needed(&self) -> Result<bool> {
        let timeout = self.inner.config.default_query_timeout;
        let response = self
            .query(stanza::prekey_count_query(&self.generate_message_tag()), timeout)
            .await?;
        let count = stanza::parse_prekey_count(&response)?;

        let session = &self.inner.config.session;
        if count >= session.min_server_prekeys {
            tracing::debug!("Relay holds {} prekeys, no upload needed", count);
            return Ok(false);
        }
        self.upload_prekeys(session.prekey_batch_size).await?;
        Ok(true)
    }

    /// Generate and upload `count` one-time prekeys.
    ///
    /// # Errors
    ///
    /// Returns query or store errors. Generated keys stay usable locally
    /// even if the upload fails.
    pub async fn upload_prekeys(&self, count: u32) -> Result<()> {
        let (first, request) = {
            let mut creds = self.inner.creds.write().await;
            let first = creds.reserve_prekey_ids(count);
            let prekeys = self.inner.sessions.generate_one_time_prekeys(first, count);
            let request = stanza::prekey_upload(&self.generate_message_tag(), &creds, &prekeys);
            (first, request)
        };
        self.inner.sessions_dirty.store(true, Ordering::Release);

        self.query(request, self.inner.config.default_query_timeout)
            .await?;
        self.inner.creds.write().await.mark_prekeys_uploaded();
        self.persist().await?;
        tracing::info!("Uploaded {} prekeys starting at id {}", count, first);
        self.emit(self.creds_update_event().await).await;
        Ok(())
    }

    /// Replace the signed prekey once it is older than the configured
    /// rotation period.
    ///
    /// The previous key keeps answering prekey messages built against it.
    /// Returns whether a rotation happened.
    ///
    /// # Errors
    ///
    /// Returns query or store errors.
    pub async fn rotate_signed_prekey_if_due(&self) -> Result<bool> {
        let rotation = self.inner.config.session.signed_prekey_rotation;
        let now = unix_now()?;
        let (request, current, previous) = {
            let mut creds = self.inner.creds.write().await;
            if !creds.signed_prekey_due(now, rotation) {
                return Ok(false);
            }
            let current = creds.rotate_signed_prekey(now).clone();
            let request = stanza::rotate_signed_prekey(&self.generate_message_tag(), &current);
            (request, current, creds.previous_signed_prekey.clone())
        };
        let id = current.id;
        self.inner
            .sessions
            .set_signed_prekeys(current, previous)
            .await;

        self.query(request, self.inner.config.default_query_timeout)
            .await?;
        self.persist().await?;
        tracing::info!("Rotated signed prekey to id {}", id);
        self.emit(self.creds_update_event().await).await;
        Ok(true)
    }
}

/// Delay before a QR code is replaced.
#[must_use]
pub(crate) fn qr_lifetime(index: usize, initial: Duration, following: Duration) -> Duration {
    if index == 0 { initial } else { following }
}
