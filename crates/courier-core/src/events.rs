//! Typed event delivery.
//!
//! Events produced while handling one network read are collected in an
//! [`EventBuffer`] and flushed as a single [`EventBatch`], partitioned by
//! [`EventKind`] with arrival order kept inside each kind. Batches travel
//! over a bounded channel to the consumer's [`EventStream`].

use crate::binary::BinaryNode;
use crate::connection::{ConnectionState, DisconnectReason};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::retry::MessageIdentity;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Event partition, in flush order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// `connection.update`
    ConnectionUpdate,
    /// `creds.update`
    CredsUpdate,
    /// `messages.upsert`
    MessagesUpsert,
    /// `messages.update`
    MessagesUpdate,
    /// `message-receipt.update`
    ReceiptUpdate,
    /// `call`
    Call,
    /// `notification`
    Notification,
}

impl EventKind {
    /// Event name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionUpdate => "connection.update",
            Self::CredsUpdate => "creds.update",
            Self::MessagesUpsert => "messages.upsert",
            Self::MessagesUpdate => "messages.update",
            Self::ReceiptUpdate => "message-receipt.update",
            Self::Call => "call",
            Self::Notification => "notification",
        }
    }
}

/// Connection lifecycle change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUpdate {
    /// New state
    pub state: ConnectionState,
    /// QR string to display, during QR pairing
    pub qr: Option<String>,
    /// Pairing code to enter on the primary device
    pub pairing_code: Option<String>,
    /// Why the connection closed
    pub reason: Option<DisconnectReason>,
    /// Whether this open followed a fresh pairing
    pub is_new_login: bool,
}

impl ConnectionUpdate {
    /// Plain state change.
    #[must_use]
    pub fn state(state: ConnectionState) -> Self {
        Self {
            state,
            qr: None,
            pairing_code: None,
            reason: None,
            is_new_login: false,
        }
    }
}

/// How an inbound message body was protected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSecurity {
    /// Pairwise session
    Pairwise,
    /// Group sender key
    SenderKey,
    /// Sent in the clear (newsletters)
    Plaintext,
}

/// Decrypted inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Message key
    pub identity: MessageIdentity,
    /// Sending device, for group messages
    pub participant: Option<Jid>,
    /// Server timestamp, seconds
    pub timestamp: u64,
    /// Body protection
    pub security: MessageSecurity,
    /// Application payload
    pub payload: Vec<u8>,
}

/// Change to a known message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Could not be decrypted; a retry was requested
    DecryptionFailed {
        /// Retry count requested from the sender
        retry_count: u32,
    },
    /// Gave up on the message
    RetryExhausted {
        /// Attempts made
        attempts: u32,
    },
    /// Acknowledged by the server
    ServerAck,
}

/// `messages.update` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUpdate {
    /// Message key
    pub identity: MessageIdentity,
    /// New status
    pub status: MessageStatus,
}

/// Delivery or read receipt for our message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptUpdate {
    /// Message key
    pub identity: MessageIdentity,
    /// Receipt `type`, `delivery` when absent
    pub receipt_type: String,
    /// Device that sent the receipt, for groups
    pub participant: Option<Jid>,
    /// Receipt timestamp, seconds
    pub timestamp: u64,
}

/// One engine event
#[derive(Debug, Clone)]
pub enum Event {
    /// `connection.update`
    ConnectionUpdate(ConnectionUpdate),
    /// `creds.update`
    CredsUpdate(Box<Credentials>),
    /// `messages.upsert`
    MessagesUpsert(InboundMessage),
    /// `messages.update`
    MessagesUpdate(MessageUpdate),
    /// `message-receipt.update`
    ReceiptUpdate(ReceiptUpdate),
    /// `call`
    Call(BinaryNode),
    /// `notification`
    Notification(BinaryNode),
}

impl Event {
    /// Partition of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionUpdate(_) => EventKind::ConnectionUpdate,
            Self::CredsUpdate(_) => EventKind::CredsUpdate,
            Self::MessagesUpsert(_) => EventKind::MessagesUpsert,
            Self::MessagesUpdate(_) => EventKind::MessagesUpdate,
            Self::ReceiptUpdate(_) => EventKind::ReceiptUpdate,
            Self::Call(_) => EventKind::Call,
            Self::Notification(_) => EventKind::Notification,
        }
    }
}

/// Events from one network read, grouped by kind
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    partitions: BTreeMap<EventKind, Vec<Event>>,
}

impl EventBatch {
    /// Whether the batch holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    /// Kinds present, in flush order.
    pub fn kinds(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.partitions.keys().copied()
    }

    /// Events of one kind, in arrival order.
    #[must_use]
    pub fn get(&self, kind: EventKind) -> &[Event] {
        self.partitions.get(&kind).map_or(&[][..], Vec::as_slice)
    }

    /// All events, kind by kind.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.partitions.values().flatten()
    }

    fn push(&mut self, event: Event) {
        self.partitions.entry(event.kind()).or_default().push(event);
    }
}

impl IntoIterator for EventBatch {
    type Item = Event;
    type IntoIter = std::iter::Flatten<std::collections::btree_map::IntoValues<EventKind, Vec<Event>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.into_values().flatten()
    }
}

/// Collects events until the current read is fully processed.
#[derive(Debug, Default)]
pub struct EventBuffer {
    batch: EventBatch,
}

impl EventBuffer {
    /// Empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one event.
    pub fn push(&mut self, event: Event) {
        self.batch.push(event);
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Take the queued events, `None` if there are none.
    pub fn flush(&mut self) -> Option<EventBatch> {
        if self.batch.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.batch))
    }
}

/// Producer half of the event channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EventBatch>,
}

impl EventSender {
    /// Deliver a batch, waiting for channel capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EventChannelClosed`] if the stream was dropped.
    pub async fn send(&self, batch: EventBatch) -> Result<()> {
        let count = batch.len();
        self.tx
            .send(batch)
            .await
            .map_err(|_| Error::EventChannelClosed)?;
        tracing::trace!("Flushed event batch of {} events", count);
        Ok(())
    }

    /// Deliver a single event as its own batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EventChannelClosed`] if the stream was dropped.
    pub async fn send_event(&self, event: Event) -> Result<()> {
        let mut batch = EventBatch::default();
        batch.push(event);
        self.send(batch).await
    }

    /// Whether the consumer is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the event channel
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<EventBatch>,
    retained: Option<EventBatch>,
}

impl EventStream {
    /// Next batch: a retained one first, then the channel.
    ///
    /// Returns `None` once the engine is gone and everything was delivered.
    pub async fn recv(&mut self) -> Option<EventBatch> {
        match self.retained.take() {
            Some(batch) => Some(batch),
            None => self.rx.recv().await,
        }
    }

    /// Hand the next batch to `handler`.
    ///
    /// If the handler fails, the batch is retained and handed out again on
    /// the next call. Returns `Ok(false)` when the channel is closed and
    /// drained.
    ///
    /// # Errors
    ///
    /// Returns the handler's error.
    pub async fn process<F, E>(&mut self, handler: F) -> std::result::Result<bool, E>
    where
        F: FnOnce(&EventBatch) -> std::result::Result<(), E>,
    {
        let Some(batch) = self.recv().await else {
            return Ok(false);
        };
        match handler(&batch) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::debug!("Event handler failed, retaining batch of {} events", batch.len());
                self.retained = Some(batch);
                Err(e)
            }
        }
    }

    /// Whether a failed batch is waiting for redelivery.
    #[must_use]
    pub fn has_retained(&self) -> bool {
        self.retained.is_some()
    }
}

/// Create a bounded event channel.
#[must_use]
pub fn channel(capacity: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender { tx },
        EventStream { rx, retained: None },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(id: &str) -> Event {
        Event::Notification(BinaryNode::builder("notification").attr("id", id).build())
    }

    fn id_of(event: &Event) -> Option<&str> {
        match event {
            Event::Notification(node) | Event::Call(node) => node.attr("id"),
            _ => None,
        }
    }

    #[test]
    fn test_partitioned_in_kind_order() {
        let mut buffer = EventBuffer::new();
        buffer.push(notification("n1"));
        buffer.push(Event::Call(BinaryNode::builder("call").attr("id", "c1").build()));
        buffer.push(Event::ConnectionUpdate(ConnectionUpdate::state(ConnectionState::Open)));
        buffer.push(notification("n2"));

        let batch = buffer.flush().unwrap();
        assert!(buffer.flush().is_none());
        assert_eq!(batch.len(), 4);
        assert_eq!(
            batch.kinds().collect::<Vec<_>>(),
            vec![EventKind::ConnectionUpdate, EventKind::Call, EventKind::Notification]
        );
        let ids: Vec<_> = batch
            .get(EventKind::Notification)
            .iter()
            .filter_map(id_of)
            .collect();
        assert_eq!(ids, vec!["n1", "n2"]);
        assert!(batch.get(EventKind::MessagesUpsert).is_empty());
    }

    #[tokio::test]
    async fn test_failed_handler_redelivers() {
        let (tx, mut stream) = channel(4);
        let mut buffer = EventBuffer::new();
        buffer.push(notification("n1"));
        tx.send(buffer.flush().unwrap()).await.unwrap();
        tx.send_event(notification("n2")).await.unwrap();

        let failed: std::result::Result<bool, &str> = stream.process(|_| Err("busy")).await;
        assert_eq!(failed, Err("busy"));
        assert!(stream.has_retained());

        let mut seen = Vec::new();
        let ok: std::result::Result<bool, ()> = stream
            .process(|batch| {
                seen.extend(batch.iter().filter_map(id_of).map(str::to_owned));
                Ok(())
            })
            .await;
        assert_eq!(ok, Ok(true));
        assert_eq!(seen, vec!["n1"]);

        drop(tx);
        let next = stream.recv().await.unwrap();
        assert_eq!(next.iter().filter_map(id_of).collect::<Vec<_>>(), vec!["n2"]);
        let done: std::result::Result<bool, ()> = stream.process(|_| Ok(())).await;
        assert_eq!(done, Ok(false));
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (tx, stream) = channel(1);
        drop(stream);
        assert!(tx.is_closed());
        assert!(matches!(
            tx.send_event(notification("x")).await,
            Err(Error::EventChannelClosed)
        ));
    }
}
