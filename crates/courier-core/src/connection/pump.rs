//! Stanza pump and keep-alive.
//!
//! One task per connection reads frame batches, decodes each frame into a
//! node and routes it. Events raised while handling one read are flushed
//! together as one batch once the whole read has been handled.

use super::client::{BoxedReader, Client};
use super::reason::DisconnectReason;
use super::state::ConnectionState;
use crate::binary::{BinaryNode, decode_with_depth};
use crate::error::{Error, TransportError};
use crate::events::{ConnectionUpdate, Event, EventBuffer};
use crate::stanza;
use crate::transport::FrameReader;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::watch;

/// What the pump does after routing a stanza
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Continue,
    Close(DisconnectReason),
}

impl Client {
    pub(crate) async fn run_pump(
        self,
        mut reader: FrameReader<BoxedReader>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!("Stanza pump started");
        loop {
            let read = tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!("Stanza pump stopped");
                    return;
                }
                read = reader.next_batch() => read,
            };

            match read {
                Ok(frames) => {
                    *self.inner.last_received.lock().await = Instant::now();
                    if let Disposition::Close(reason) = self.handle_frames(frames).await {
                        self.close_with(reason).await;
                        return;
                    }
                }
                Err(e) => {
                    let reason = match &e {
                        Error::Transport(TransportError::Eof | TransportError::UnexpectedEof(_)) => {
                            DisconnectReason::ConnectionLost
                        }
                        other => other.disconnect_reason(),
                    };
                    tracing::warn!("Read loop ended: {}", e);
                    self.close_with(reason).await;
                    return;
                }
            }
        }
    }

    async fn handle_frames(&self, frames: Vec<Vec<u8>>) -> Disposition {
        let max_depth = self.inner.config.transport.max_node_depth;
        let mut buffer = EventBuffer::new();
        let mut disposition = Disposition::Continue;

        for frame in frames {
            let node = match decode_with_depth(&frame, max_depth) {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!("Dropping connection on undecodable frame: {}", e);
                    disposition = Disposition::Close(DisconnectReason::Malformed);
                    break;
                }
            };
            tracing::trace!("Received <{}>", node.tag());

            if let Disposition::Close(reason) = self.route(node, &mut buffer).await {
                disposition = Disposition::Close(reason);
                break;
            }
        }

        if self.inner.sessions_dirty.load(Ordering::Acquire) {
            if let Err(e) = self.persist().await {
                tracing::warn!("Failed to save auth state: {}", e);
            }
        }
        if let Some(batch) = buffer.flush() {
            if let Err(e) = self.inner.events.send(batch).await {
                tracing::debug!("Dropping event batch: {}", e);
            }
        }
        disposition
    }

    async fn route(&self, node: BinaryNode, buffer: &mut EventBuffer) -> Disposition {
        match node.tag() {
            "iq" => return self.handle_iq(node, buffer).await,
            "success" => self.handle_success(buffer).await,
            "failure" => return Disposition::Close(DisconnectReason::from_failure(&node)),
            "stream:error" => {
                return Disposition::Close(DisconnectReason::from_stream_error(&node));
            }
            "xmlstreamend" => return Disposition::Close(DisconnectReason::ConnectionClosed),
            "message" => self.handle_message(node, buffer).await,
            "receipt" => self.handle_receipt(node, buffer).await,
            "ack" => self.handle_server_ack(&node, buffer),
            "call" => {
                self.send_ack(&node).await;
                buffer.push(Event::Call(node));
            }
            "notification" => {
                self.send_ack(&node).await;
                buffer.push(Event::Notification(node));
            }
            other => {
                tracing::debug!("Unhandled <{}> surfaced as notification", other);
                buffer.push(Event::Notification(node));
            }
        }
        Disposition::Continue
    }

    async fn handle_iq(&self, node: BinaryNode, buffer: &mut EventBuffer) -> Disposition {
        if matches!(node.attr("type"), Some("result" | "error")) {
            let id = node.attr("id").map(str::to_owned);
            if let Some((_, tx)) = id.and_then(|id| self.inner.pending_queries.remove(&id)) {
                let _ = tx.send(Ok(node));
                return Disposition::Continue;
            }
        }

        if stanza::is_server_ping(&node) {
            if let Err(e) = self.send_frame(&stanza::iq_result(&node)).await {
                tracing::debug!("Failed to answer server ping: {}", e);
            }
            return Disposition::Continue;
        }
        if node.child("pair-device").is_some() {
            return self.handle_pair_device(&node).await;
        }
        if node.child("pair-success").is_some() {
            return self.handle_pair_success(&node, buffer).await;
        }

        tracing::debug!("Unmatched iq {:?}", node.attr("id"));
        buffer.push(Event::Notification(node));
        Disposition::Continue
    }

    async fn handle_success(&self, buffer: &mut EventBuffer) {
        if let Err(e) = self.transition(ConnectionState::Open).await {
            tracing::warn!("Ignoring login success: {}", e);
            return;
        }
        tracing::info!("Logged in");
        buffer.push(Event::ConnectionUpdate(ConnectionUpdate::state(
            ConnectionState::Open,
        )));
        self.spawn_after_open().await;
    }

    pub(crate) async fn send_ack(&self, node: &BinaryNode) {
        if let Some(ack) = stanza::ack(node) {
            if let Err(e) = self.send_frame(&ack).await {
                tracing::debug!("Failed to ack <{}>: {}", node.tag(), e);
            }
        }
    }

    pub(crate) async fn run_keep_alive(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.config.keep_alive.interval;
        let query_timeout = self.inner.config.default_query_timeout;
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }

            let idle = self.inner.last_received.lock().await.elapsed();
            if idle > interval + query_timeout {
                tracing::warn!("Nothing received for {:?}, dropping connection", idle);
                self.close_with(DisconnectReason::ConnectionLost).await;
                return;
            }
            if self.state() != ConnectionState::Open {
                continue;
            }

            let ping = stanza::ping(&self.generate_message_tag());
            match self.send_query(ping, query_timeout).await {
                Ok(_) => tracing::trace!("Keep-alive acknowledged"),
                Err(e) => tracing::debug!("Keep-alive ping failed: {}", e),
            }
        }
    }
}
