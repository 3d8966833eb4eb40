//! Message send and receive paths.
//!
//! Inbound messages are decrypted, surfaced as `messages.upsert` and acked.
//! A message that cannot be decrypted is still acked, and a retry receipt
//! goes back to the sender until the retry budget runs out. Retry receipts
//! for our own messages re-encrypt the stored payload for the requesting
//! device; for group messages the resend carries our sender key again.

use super::client::Client;
use crate::binary::BinaryNode;
use crate::error::{Error, Result};
use crate::events::{
    Event, EventBuffer, InboundMessage, MessageSecurity, MessageStatus, MessageUpdate,
    ReceiptUpdate,
};
use crate::jid::Jid;
use crate::retry::{MessageIdentity, Resend};
use crate::session::{CiphertextKind, EncryptedMessage, ProtocolAddress, SenderKeyName};
use crate::stanza;
use crate::unix_now;
use async_trait::async_trait;
use courier_crypto::x3dh::PreKeyBundle;
use std::borrow::Cow;
use std::sync::atomic::Ordering;

/// Source of payloads for messages the retry store did not keep.
#[async_trait]
pub trait MessageLookup: Send + Sync {
    /// Payload of one of our sent messages.
    async fn payload(&self, identity: &MessageIdentity) -> Option<Vec<u8>>;
}

fn parse_jid(node: &BinaryNode, key: &str) -> Option<Jid> {
    node.attr(key).and_then(|value| value.parse().ok())
}

fn parse_timestamp(node: &BinaryNode) -> u64 {
    node.attr("t").and_then(|t| t.parse().ok()).unwrap_or(0)
}

/// Chat a stanza from `from` belongs to: the group itself, or the account
/// behind a device.
fn chat_of(from: &Jid) -> Jid {
    if from.is_group() || from.is_broadcast() {
        from.clone()
    } else {
        from.to_account()
    }
}

fn text_message(id: &str, to: &Jid) -> crate::binary::NodeBuilder {
    BinaryNode::builder("message")
        .attr("id", id)
        .attr("to", to.to_string())
        .attr("type", "text")
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbound
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Encrypt `payload` for one device and send it.
    ///
    /// A session is established from a fetched prekey bundle if none
    /// exists. The payload is kept for retries. Returns the message id.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] unless the connection is open
    /// - [`Error::NoSessionAvailable`] if the relay has no bundle for `to`
    /// - query, crypto and store errors
    pub async fn send_message(&self, to: &Jid, payload: &[u8]) -> Result<String> {
        self.ensure_state(super::ConnectionState::Open)?;
        let encrypted = self.encrypt_for(to, payload).await?;

        let id = Self::generate_message_id();
        let message = text_message(&id, to)
            .child(stanza::enc_node(encrypted.kind, encrypted.ciphertext))
            .build();
        self.inner.retry.record_sent(
            &MessageIdentity::outbound(to.to_account(), &id),
            Some(to.clone()),
            Some(payload.to_vec()),
        )?;
        self.send_frame(&message).await?;
        self.persist().await?;

        tracing::debug!("Sent message {} to {}", id, to);
        Ok(id)
    }

    /// Encrypt `payload` once with our sender key and send it to `group`.
    ///
    /// Devices in `participants` that have not received our sender key yet
    /// get it pairwise in the same stanza. Returns the message id.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] unless the connection is open
    /// - [`Error::InvalidState`] if `group` is not a group or this device
    ///   is not registered
    /// - session, query and store errors
    pub async fn send_group_message(
        &self,
        group: &Jid,
        participants: &[Jid],
        payload: &[u8],
    ) -> Result<String> {
        self.ensure_state(super::ConnectionState::Open)?;
        if !group.is_group() {
            return Err(Error::InvalidState(Cow::Owned(format!(
                "{group} is not a group"
            ))));
        }
        let me = self.registered_jid().await?;

        let group_key = group.to_string();
        let name = SenderKeyName::new(group_key.clone(), ProtocolAddress::from_jid(&me));
        let distribution = self.inner.sessions.sender_key_distribution(&name).await?;

        let mut fanout = Vec::new();
        let mut distributed = Vec::new();
        for device in participants {
            let key = (group_key.clone(), ProtocolAddress::from_jid(device));
            if self.inner.sender_key_recipients.contains(&key) {
                continue;
            }
            let encrypted = self.encrypt_for(device, &distribution).await?;
            fanout.push(
                BinaryNode::builder("to")
                    .attr("jid", device.to_string())
                    .child(stanza::enc_node(encrypted.kind, encrypted.ciphertext))
                    .build(),
            );
            distributed.push(key);
        }

        let ciphertext = self.inner.sessions.group_encrypt(&name, payload).await?;
        let id = Self::generate_message_id();
        let mut builder = text_message(&id, group);
        if !fanout.is_empty() {
            builder = builder.child(BinaryNode::builder("participants").children(fanout).build());
        }
        let message = builder
            .child(stanza::enc_node(CiphertextKind::SenderKey, ciphertext))
            .build();

        self.inner.retry.record_sent(
            &MessageIdentity::outbound(group.clone(), &id),
            None,
            Some(payload.to_vec()),
        )?;
        self.send_frame(&message).await?;
        let count = distributed.len();
        for key in distributed {
            self.inner.sender_key_recipients.insert(key);
        }
        self.persist().await?;

        tracing::debug!(
            "Sent group message {} to {} ({} new key recipients)",
            id,
            group,
            count
        );
        Ok(id)
    }

    /// Fetch and verify the prekey bundle of one device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSessionAvailable`] if the relay has no bundle for
    /// `device`, and query errors.
    pub async fn fetch_prekey_bundle(&self, device: &Jid) -> Result<PreKeyBundle> {
        let request = stanza::bundle_query(&self.generate_message_tag(), std::slice::from_ref(device));
        let response = self
            .send_query(request, self.inner.config.default_query_timeout)
            .await?;
        stanza::parse_bundles(&response)?
            .into_iter()
            .find(|(jid, _)| jid == device)
            .map(|(_, bundle)| bundle)
            .ok_or_else(|| Error::NoSessionAvailable(device.to_string()))
    }

    async fn registered_jid(&self) -> Result<Jid> {
        self.inner
            .creds
            .read()
            .await
            .me
            .clone()
            .ok_or(Error::InvalidState(Cow::Borrowed("device is not registered")))
    }

    async fn encrypt_for(&self, device: &Jid, payload: &[u8]) -> Result<EncryptedMessage> {
        let addr = ProtocolAddress::from_jid(device);
        let bundle = if self.inner.sessions.has_session(&addr).await {
            None
        } else {
            Some(self.fetch_prekey_bundle(device).await?)
        };
        self.inner
            .sessions
            .encrypt(&addr, payload, bundle.as_ref())
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inbound
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    pub(crate) async fn handle_message(&self, node: BinaryNode, buffer: &mut EventBuffer) {
        let (Some(id), Some(from)) = (node.attr("id").map(str::to_owned), parse_jid(&node, "from"))
        else {
            tracing::warn!("Dropping message without id or sender");
            return;
        };
        let participant = parse_jid(&node, "participant");

        if let Some(ignore) = self.inner.config.should_ignore_jid {
            if ignore(&from) || participant.as_ref().is_some_and(ignore) {
                tracing::debug!("Ignoring message {} from {}", id, from);
                self.send_ack(&node).await;
                return;
            }
        }

        let identity = MessageIdentity::inbound(chat_of(&from), id);
        let sender = participant.clone().unwrap_or_else(|| from.clone());
        let timestamp = parse_timestamp(&node);

        let decrypted = match node.child_bytes("plaintext") {
            Some(plaintext) => Ok(Some((MessageSecurity::Plaintext, plaintext.to_vec()))),
            None => self.decrypt_message(&node, &from, &sender).await,
        };
        match decrypted {
            Ok(Some((security, payload))) => {
                self.inner.retry.on_ack(&identity);
                buffer.push(Event::MessagesUpsert(InboundMessage {
                    identity,
                    participant,
                    timestamp,
                    security,
                    payload,
                }));
            }
            Ok(None) => {
                self.inner.retry.on_ack(&identity);
            }
            Err(e @ (Error::DecryptionFailure(_) | Error::MissingSenderKey { .. })) => {
                tracing::warn!("Failed to decrypt {}: {}", identity, e);
                self.request_retry(&node, identity, buffer).await;
            }
            Err(e) => tracing::warn!("Failed to process {}: {}", identity, e),
        }

        self.send_ack(&node).await;
    }

    /// Decrypt every `<enc>` of a message in order.
    ///
    /// In groups, pairwise ciphertexts carry the sender's key distribution
    /// and are consumed before the sender-key ciphertext.
    async fn decrypt_message(
        &self,
        node: &BinaryNode,
        from: &Jid,
        sender: &Jid,
    ) -> Result<Option<(MessageSecurity, Vec<u8>)>> {
        let addr = ProtocolAddress::from_jid(sender);
        let mut body = None;

        for enc in node.children_by_tag("enc") {
            let kind = enc
                .attr("type")
                .and_then(CiphertextKind::parse)
                .ok_or(Error::DecryptionFailure(Cow::Borrowed("unknown ciphertext type")))?;
            let ciphertext = enc.bytes().unwrap_or_default();

            match kind {
                CiphertextKind::SenderKey => {
                    let name = SenderKeyName::new(from.to_string(), addr.clone());
                    let plaintext = self.inner.sessions.group_decrypt(&name, ciphertext).await?;
                    self.inner.sessions_dirty.store(true, Ordering::Release);
                    body = Some((MessageSecurity::SenderKey, plaintext));
                }
                CiphertextKind::Whisper | CiphertextKind::PreKey => {
                    let plaintext = self.inner.sessions.decrypt(&addr, kind, ciphertext).await?;
                    self.inner.sessions_dirty.store(true, Ordering::Release);
                    if from.is_group() {
                        let name = SenderKeyName::new(from.to_string(), addr.clone());
                        self.inner
                            .sessions
                            .process_sender_key_distribution(&name, &plaintext)
                            .await?;
                    } else {
                        body = Some((MessageSecurity::Pairwise, plaintext));
                    }
                }
            }
        }
        Ok(body)
    }

    async fn request_retry(&self, node: &BinaryNode, identity: MessageIdentity, buffer: &mut EventBuffer) {
        let counted = unix_now()
            .and_then(|now| Ok((now, self.inner.retry.on_decrypt_failure(&identity)?)));
        let status = match counted {
            Ok((now, count)) => {
                let keys = if count > 1 {
                    Some(self.inner.sessions.local_bundle().await)
                } else {
                    None
                };
                let receipt = stanza::retry_receipt(
                    node,
                    count,
                    self.inner.sessions.registration_id(),
                    now,
                    keys.as_ref(),
                );
                if let Err(e) = self.send_frame(&receipt).await {
                    tracing::warn!("Failed to send retry receipt for {}: {}", identity, e);
                }
                MessageStatus::DecryptionFailed { retry_count: count }
            }
            Err(Error::RetryExhausted { attempts, .. }) => MessageStatus::RetryExhausted { attempts },
            Err(e) => {
                tracing::warn!("Retry bookkeeping failed for {}: {}", identity, e);
                return;
            }
        };
        buffer.push(Event::MessagesUpdate(MessageUpdate { identity, status }));
    }

    pub(crate) async fn handle_receipt(&self, node: BinaryNode, buffer: &mut EventBuffer) {
        self.send_ack(&node).await;
        let (Some(id), Some(from)) = (node.attr("id").map(str::to_owned), parse_jid(&node, "from"))
        else {
            tracing::debug!("Dropping receipt without id or sender");
            return;
        };
        let identity = MessageIdentity::outbound(chat_of(&from), id);
        let receipt_type = node.attr("type").unwrap_or("delivery").to_string();

        if receipt_type == "retry" {
            let client = self.clone();
            self.spawn_task("message resend", async move {
                client.handle_retry_receipt(node, identity).await
            })
            .await;
            return;
        }

        if self.inner.retry.on_ack(&identity) {
            tracing::trace!("Cleared retry record of {}", identity);
        }
        buffer.push(Event::ReceiptUpdate(ReceiptUpdate {
            identity,
            receipt_type,
            participant: parse_jid(&node, "participant"),
            timestamp: parse_timestamp(&node),
        }));
    }

    async fn handle_retry_receipt(&self, node: BinaryNode, identity: MessageIdentity) -> Result<()> {
        let (resend, payload) = match self.next_resend(&identity).await {
            Ok(Some(next)) => next,
            Ok(None) => {
                tracing::debug!("Nothing to resend for {}", identity);
                return Ok(());
            }
            Err(Error::RetryExhausted { attempts, .. }) => {
                self.emit(Event::MessagesUpdate(MessageUpdate {
                    identity,
                    status: MessageStatus::RetryExhausted { attempts },
                }))
                .await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let device = parse_jid(&node, "participant")
            .or_else(|| parse_jid(&node, "from"))
            .unwrap_or(resend.recipient);
        if device.is_group() {
            tracing::warn!("Group retry receipt for {} names no participant", identity);
            return Ok(());
        }
        let addr = ProtocolAddress::from_jid(&device);
        if let Some(keys) = node.child("keys") {
            let bundle = stanza::parse_bundle(keys)?;
            self.inner.sessions.reset_session(&addr).await;
            self.inner.sessions.process_bundle(&addr, &bundle).await?;
            tracing::info!("Rebuilt session with {} from retry receipt", addr);
        }

        if identity.remote_jid.is_group() {
            self.resend_to_group_member(&identity, &device, &payload).await?;
        } else {
            let encrypted = self.encrypt_for(&device, &payload).await?;
            let message = text_message(&identity.message_id, &device)
                .child(stanza::enc_node(encrypted.kind, encrypted.ciphertext))
                .build();
            self.send_frame(&message).await?;
        }
        self.persist().await?;
        tracing::info!(
            "Resent {} to {} (attempt {})",
            identity,
            device,
            resend.attempt
        );
        Ok(())
    }

    /// Count a retry receipt and find the payload to resend.
    ///
    /// Messages the store no longer holds are only adopted when the
    /// caller's [`MessageLookup`] knows them.
    async fn next_resend(&self, identity: &MessageIdentity) -> Result<Option<(Resend, Vec<u8>)>> {
        if let Some(resend) = self.inner.retry.on_retry_receipt(identity)? {
            let payload = match resend.payload.clone() {
                Some(payload) => Some(payload),
                None => self.lookup_payload(identity).await,
            };
            return Ok(payload.map(|payload| (resend, payload)));
        }

        let Some(payload) = self.lookup_payload(identity).await else {
            return Ok(None);
        };
        self.inner.retry.record_sent(identity, None, Some(payload))?;
        Ok(self
            .inner
            .retry
            .on_retry_receipt(identity)?
            .and_then(|resend| resend.payload.clone().map(|payload| (resend, payload))))
    }

    async fn lookup_payload(&self, identity: &MessageIdentity) -> Option<Vec<u8>> {
        let lookup = self.inner.message_lookup.read().await.clone();
        match lookup {
            Some(lookup) => lookup.payload(identity).await,
            None => None,
        }
    }

    /// Resend a group message to one member, redistributing our sender key
    /// pairwise since the member evidently lacks it.
    async fn resend_to_group_member(
        &self,
        identity: &MessageIdentity,
        device: &Jid,
        payload: &[u8],
    ) -> Result<()> {
        let group = &identity.remote_jid;
        let me = self.registered_jid().await?;
        let group_key = group.to_string();
        let recipient = (group_key.clone(), ProtocolAddress::from_jid(device));
        self.inner.sender_key_recipients.remove(&recipient);

        let name = SenderKeyName::new(group_key, ProtocolAddress::from_jid(&me));
        let distribution = self.inner.sessions.sender_key_distribution(&name).await?;
        let encrypted = self.encrypt_for(device, &distribution).await?;
        let ciphertext = self.inner.sessions.group_encrypt(&name, payload).await?;

        let fanout = BinaryNode::builder("to")
            .attr("jid", device.to_string())
            .child(stanza::enc_node(encrypted.kind, encrypted.ciphertext))
            .build();
        let message = text_message(&identity.message_id, group)
            .child(BinaryNode::builder("participants").child(fanout).build())
            .child(stanza::enc_node(CiphertextKind::SenderKey, ciphertext))
            .build();
        self.send_frame(&message).await?;
        self.inner.sender_key_recipients.insert(recipient);
        Ok(())
    }

    pub(crate) fn handle_server_ack(&self, node: &BinaryNode, buffer: &mut EventBuffer) {
        if node.attr("class") != Some("message") {
            return;
        }
        let (Some(id), Some(from)) = (node.attr("id"), parse_jid(node, "from")) else {
            return;
        };
        if let Some(error) = node.attr("error") {
            tracing::warn!("Relay rejected message {} with error {}", id, error);
            return;
        }
        buffer.push(Event::MessagesUpdate(MessageUpdate {
            identity: MessageIdentity::outbound(chat_of(&from), id),
            status: MessageStatus::ServerAck,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_of() {
        let device = Jid::device("155", 3);
        assert_eq!(chat_of(&device), Jid::user("155"));

        let group = Jid::group("123-456");
        assert_eq!(chat_of(&group), group);
    }

    #[test]
    fn test_text_message_layout() {
        let message = text_message("M1", &Jid::user("155"))
            .child(stanza::enc_node(CiphertextKind::Whisper, vec![1, 2]))
            .build();
        assert_eq!(message.attr("type"), Some("text"));
        assert_eq!(message.attr("to"), Some("155@s.courier.net"));
        assert_eq!(message.child("enc").and_then(|e| e.attr("type")), Some("msg"));
    }
}
