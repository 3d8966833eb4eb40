//! Client - one logical connection to the relay
//!
//! The client owns the credentials, the session table, the retry
//! coordinator and the event channel, and drives one connection at a time
//! through [`ConnectionState`]. The read loop lives in `pump.rs`, pairing
//! and key maintenance in `pairing.rs`, message handling in `messaging.rs`.
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{Client, ClientConfig, MemoryCredentialStore, MemoryRetryStore};
//! use std::sync::Arc;
//!
//! # async fn run(config: ClientConfig) -> courier_core::Result<()> {
//! let (client, mut events) = Client::new(
//!     config,
//!     Arc::new(MemoryCredentialStore::new()),
//!     Arc::new(MemoryRetryStore::new()),
//! )
//! .await?;
//! client.connect().await?;
//!
//! while let Some(batch) = events.recv().await {
//!     for event in batch {
//!         println!("{:?}", event.kind());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use super::handshake::{CertificateTrust, client_handshake};
use super::messaging::MessageLookup;
use super::reason::DisconnectReason;
use super::state::{ConnectionState, StateMachine};
use crate::binary::{BinaryNode, encode};
use crate::config::ClientConfig;
use crate::credentials::{AuthState, CredentialStore, Credentials};
use crate::error::{Error, Result, TransportError};
use crate::events::{self, ConnectionUpdate, Event, EventSender, EventStream};
use crate::retry::{RetryCoordinator, RetryStore};
use crate::session::{ProtocolAddress, SessionManager};
use crate::stanza;
use crate::transport::{FrameReader, FrameWriter};
use crate::unix_now;
use dashmap::{DashMap, DashSet};
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, oneshot, watch};
use tokio::task::JoinHandle;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Pending query completion
type PendingQuery = oneshot::Sender<Result<BinaryNode>>;

/// Client inner state
pub(crate) struct ClientInner {
    /// Engine configuration
    pub(crate) config: ClientConfig,
    /// Device credentials
    pub(crate) creds: RwLock<Credentials>,
    /// End-to-end session table
    pub(crate) sessions: SessionManager,
    /// Retry/ack bookkeeping
    pub(crate) retry: RetryCoordinator,
    /// Persistence hook for credentials and sessions
    pub(crate) credential_store: Arc<dyn CredentialStore>,
    /// Fallback for payloads the retry store did not keep
    pub(crate) message_lookup: RwLock<Option<Arc<dyn MessageLookup>>>,
    /// Lifecycle state machine
    pub(crate) machine: Mutex<StateMachine>,
    /// Published copy of the current state
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    /// Write half of the current connection
    pub(crate) writer: Mutex<Option<FrameWriter<BoxedWriter>>>,
    /// Queries waiting for a response (tag -> completion)
    pub(crate) pending_queries: DashMap<String, PendingQuery>,
    /// Event producer
    pub(crate) events: EventSender,
    /// Per-connection random tag prefix
    pub(crate) tag_prefix: AtomicU32,
    /// Monotonic tag counter
    pub(crate) tag_epoch: AtomicU64,
    /// When the last frame arrived
    pub(crate) last_received: Mutex<Instant>,
    /// Dropped to stop the current connection's tasks
    pub(crate) shutdown: Mutex<Option<watch::Sender<bool>>>,
    /// Tasks of the current connection
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Whether the pairing-code flow replaced QR pairing
    pub(crate) pairing_code_requested: AtomicBool,
    /// Devices that already hold our sender key (group, device)
    pub(crate) sender_key_recipients: DashSet<(String, ProtocolAddress)>,
    /// Session table changed since the last save
    pub(crate) sessions_dirty: AtomicBool,
}

/// Courier client
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Create a client, loading the auth state from `credential_store` or
    /// generating and saving fresh credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid configuration and
    /// store errors as they occur.
    pub async fn new(
        config: ClientConfig,
        credential_store: Arc<dyn CredentialStore>,
        retry_store: Arc<dyn RetryStore>,
    ) -> Result<(Self, EventStream)> {
        config.validate()?;

        let auth = match credential_store.load().await? {
            Some(auth) => auth,
            None => {
                let auth = AuthState::generate(unix_now()?)?;
                credential_store.save(&auth).await?;
                tracing::info!("Generated credentials for a new device");
                auth
            }
        };
        let AuthState { creds, keys } = auth;

        let sessions = SessionManager::new(
            creds.identity.clone(),
            creds.registration_id,
            creds.signed_prekey.clone(),
            creds.previous_signed_prekey.clone(),
            &config.session,
        );
        sessions.restore(keys).await;

        let (events, stream) = events::channel(config.event_channel_capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let retry = RetryCoordinator::new(retry_store, config.retry);

        let inner = ClientInner {
            config,
            creds: RwLock::new(creds),
            sessions,
            retry,
            credential_store,
            message_lookup: RwLock::new(None),
            machine: Mutex::new(StateMachine::new()),
            state_tx,
            writer: Mutex::new(None),
            pending_queries: DashMap::new(),
            events,
            tag_prefix: AtomicU32::new(0),
            tag_epoch: AtomicU64::new(1),
            last_received: Mutex::new(Instant::now()),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            pairing_code_requested: AtomicBool::new(false),
            sender_key_recipients: DashSet::new(),
            sessions_dirty: AtomicBool::new(false),
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            stream,
        ))
    }

    /// Install the hook used to find payloads for retry requests when the
    /// retry store did not keep them.
    pub async fn set_message_lookup(&self, lookup: Arc<dyn MessageLookup>) {
        *self.inner.message_lookup.write().await = Some(lookup);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Open a TCP connection to the configured relay and run the handshake.
    ///
    /// Returns once the handshake completes; the `open` (or `pairing`)
    /// state arrives as a `connection.update` event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the client is closed, transport
    /// errors if the relay is unreachable, and [`Error::HandshakeFailure`]
    /// if the relay cannot be authenticated.
    pub async fn connect(&self) -> Result<()> {
        self.begin_connect().await?;

        let transport = &self.inner.config.transport;
        let stream = match tokio::time::timeout(
            transport.connect_timeout,
            TcpStream::connect(&transport.relay_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.close_with(DisconnectReason::ConnectionLost).await;
                return Err(e.into());
            }
            Err(_) => {
                self.close_with(DisconnectReason::TimedOut).await;
                return Err(TransportError::Timeout(Cow::Borrowed("connect")).into());
            }
        };
        stream.set_nodelay(true)?;
        tracing::info!("Connected to relay {}", transport.relay_addr);

        self.establish(stream).await
    }

    /// Run the handshake over an already-open byte stream.
    ///
    /// # Errors
    ///
    /// As [`Client::connect`], minus the TCP errors.
    pub async fn connect_with_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.begin_connect().await?;
        self.establish(stream).await
    }

    async fn begin_connect(&self) -> Result<()> {
        // Previous connection's tasks must be gone before new keys exist
        let previous: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for handle in previous {
            handle.abort();
            let _ = handle.await;
        }

        self.transition(ConnectionState::Connecting).await?;
        self.inner.pairing_code_requested.store(false, Ordering::Release);
        self.inner
            .tag_prefix
            .store(rand::random::<u32>(), Ordering::Release);
        self.inner.tag_epoch.store(1, Ordering::Release);
        self.emit(Event::ConnectionUpdate(ConnectionUpdate::state(
            ConnectionState::Connecting,
        )))
        .await;
        Ok(())
    }

    async fn establish<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let transport = &self.inner.config.transport;
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FrameReader::new(Box::new(read_half) as BoxedReader, transport.max_frame_size);
        let writer = FrameWriter::new(Box::new(write_half) as BoxedWriter, transport.max_frame_size)
            .with_intro();

        self.transition(ConnectionState::Handshaking).await?;
        let Some(root) = transport.trusted_root else {
            self.close_with(DisconnectReason::HandshakeFailed).await;
            return Err(Error::InvalidConfig(Cow::Borrowed("trusted root key is required")));
        };
        let (noise_key, payload) = {
            let creds = self.inner.creds.read().await;
            (
                creds.noise_key.clone(),
                encode(&stanza::login_payload(&creds, false)),
            )
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                self.close_with(DisconnectReason::Malformed).await;
                return Err(e.into());
            }
        };

        let now = match unix_now() {
            Ok(now) => now,
            Err(e) => {
                tracing::warn!("Cannot check the relay certificate: {}", e);
                self.close_with(DisconnectReason::HandshakeFailed).await;
                return Err(Error::HandshakeFailure(Cow::Borrowed(
                    "system clock unusable for certificate validation",
                )));
            }
        };
        let handshake = client_handshake(
            reader,
            writer,
            &noise_key,
            &payload,
            CertificateTrust {
                root: &root,
                issuer: &transport.certificate_issuer,
            },
            now,
        );
        let result = match tokio::time::timeout(transport.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(Cow::Borrowed("handshake")).into()),
        };
        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("Handshake failed: {}", e);
                self.close_with(e.disconnect_reason()).await;
                return Err(e);
            }
        };
        tracing::info!("Handshake complete");

        *self.inner.writer.lock().await = Some(channel.writer);
        *self.inner.last_received.lock().await = Instant::now();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.shutdown.lock().await = Some(shutdown_tx);

        let client = self.clone();
        let pump = tokio::spawn(client.run_pump(channel.reader, shutdown_rx.clone()));
        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(pump);
        if self.inner.config.keep_alive.enabled {
            let client = self.clone();
            tasks.push(tokio::spawn(client.run_keep_alive(shutdown_rx)));
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// Every pending query fails with [`Error::ConnectionClosed`]. Closing a
    /// closed client does nothing.
    pub async fn close(&self) {
        self.close_with(DisconnectReason::ClosedByClient).await;
    }

    pub(crate) async fn close_with(&self, reason: DisconnectReason) {
        {
            let mut machine = self.inner.machine.lock().await;
            if !machine.begin_close(reason) {
                return;
            }
            self.inner.state_tx.send_replace(ConnectionState::Closing);
        }
        tracing::info!("Closing connection: {}", reason);

        self.inner.shutdown.lock().await.take();

        // No query can reach the wire once the writer is gone, so the drain
        // below sees every query that will ever wait on this connection
        let writer = self.inner.writer.lock().await.take();

        let tags: Vec<String> = self
            .inner
            .pending_queries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for tag in tags {
            if let Some((_, tx)) = self.inner.pending_queries.remove(&tag) {
                let _ = tx.send(Err(Error::ConnectionClosed(reason)));
            }
        }

        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Writer shutdown failed: {}", e);
            }
        }

        if let Err(e) = self.persist().await {
            tracing::warn!("Failed to save auth state on close: {}", e);
        }

        if let Err(e) = self.transition(ConnectionState::Closed).await {
            tracing::warn!("{}", e);
        }
        self.emit(Event::ConnectionUpdate(ConnectionUpdate {
            reason: Some(reason),
            ..ConnectionUpdate::state(ConnectionState::Closed)
        }))
        .await;
    }

    pub(crate) async fn transition(&self, to: ConnectionState) -> Result<()> {
        let mut machine = self.inner.machine.lock().await;
        machine.transition_to(to)?;
        self.inner.state_tx.send_replace(to);
        Ok(())
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Reason the last connection closed.
    pub async fn close_reason(&self) -> Option<DisconnectReason> {
        self.inner.machine.lock().await.close_reason()
    }

    /// Wait until the connection reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns a transport timeout if `target` is not reached in time.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state_tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::InvalidState(Cow::Borrowed("client dropped"))),
            Err(_) => Err(TransportError::Timeout(Cow::Owned(format!(
                "waiting for state {target}"
            )))
            .into()),
        }
    }

    pub(crate) fn ensure_state(&self, allowed: ConnectionState) -> Result<()> {
        if self.state() == allowed {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    pub(crate) async fn shutdown_signal(&self) -> Option<watch::Receiver<bool>> {
        self.inner.shutdown.lock().await.as_ref().map(watch::Sender::subscribe)
    }

    /// Spawn a task that belongs to the current connection.
    pub(crate) async fn spawn_task<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::warn!("{} failed: {}", name, e);
            }
        });
        let mut tasks = self.inner.tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Send an `iq` and wait for the response with the same tag.
    ///
    /// A tag is allocated if `node` has no `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] unless the connection is open
    /// - [`Error::QueryTimeout`] if no response arrives in time
    /// - [`Error::ServerError`] for an `iq type="error"` response
    /// - [`Error::ConnectionClosed`] if the connection closes first
    pub async fn query(&self, node: BinaryNode, timeout: Duration) -> Result<BinaryNode> {
        self.ensure_state(ConnectionState::Open)?;
        self.send_query(node, timeout).await
    }

    pub(crate) async fn send_query(&self, node: BinaryNode, timeout: Duration) -> Result<BinaryNode> {
        let (tag, node) = match node.attr("id") {
            Some(id) => (id.to_string(), node),
            None => {
                let tag = self.generate_message_tag();
                let node = node.into_builder().attr("id", tag.clone()).build();
                (tag, node)
            }
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending_queries.insert(tag.clone(), tx);
        if self.state() == ConnectionState::Closing {
            self.inner.pending_queries.remove(&tag);
            let reason = self
                .close_reason()
                .await
                .unwrap_or(DisconnectReason::ConnectionLost);
            return Err(Error::ConnectionClosed(reason));
        }
        if let Err(e) = self.send_frame(&node).await {
            self.inner.pending_queries.remove(&tag);
            return Err(e);
        }
        tracing::debug!("Sent query {}", tag);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                let response = response?;
                match stanza::server_error(&response) {
                    Some(e) => Err(e),
                    None => Ok(response),
                }
            }
            Ok(Err(_)) => {
                let reason = self
                    .close_reason()
                    .await
                    .unwrap_or(DisconnectReason::ConnectionLost);
                Err(Error::ConnectionClosed(reason))
            }
            Err(_) => {
                self.inner.pending_queries.remove(&tag);
                tracing::warn!("Query {} timed out after {:?}", tag, timeout);
                Err(Error::QueryTimeout { tag, timeout })
            }
        }
    }

    /// Send a stanza without waiting for a response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the connection is open.
    pub async fn send_node(&self, node: &BinaryNode) -> Result<()> {
        self.ensure_state(ConnectionState::Open)?;
        self.send_frame(node).await
    }

    pub(crate) async fn send_frame(&self, node: &BinaryNode) -> Result<()> {
        let bytes = encode(node)?;
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        writer.write_frame(&bytes).await?;
        tracing::trace!("Sent <{}> ({} bytes)", node.tag(), bytes.len());
        Ok(())
    }

    /// Unique tag for a request on this connection.
    ///
    /// Tags share a random per-connection prefix followed by a counter.
    #[must_use]
    pub fn generate_message_tag(&self) -> String {
        let prefix = self.inner.tag_prefix.load(Ordering::Acquire);
        let epoch = self.inner.tag_epoch.fetch_add(1, Ordering::AcqRel);
        format!("{}.{}-{}", prefix >> 16, prefix & 0xFFFF, epoch)
    }

    /// Random id for an outbound message.
    #[must_use]
    pub fn generate_message_id() -> String {
        format!("CR{}", hex::encode_upper(rand::random::<[u8; 10]>()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Credentials
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Snapshot of the current credentials.
    pub async fn credentials(&self) -> Credentials {
        self.inner.creds.read().await.clone()
    }

    /// Session table.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Retry coordinator.
    #[must_use]
    pub fn retry(&self) -> &RetryCoordinator {
        &self.inner.retry
    }

    /// Save credentials and the session table through the store.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn persist(&self) -> Result<()> {
        let state = AuthState {
            creds: self.inner.creds.read().await.clone(),
            keys: self.inner.sessions.snapshot().await,
        };
        self.inner.sessions_dirty.store(false, Ordering::Release);
        self.inner.credential_store.save(&state).await
    }

    pub(crate) async fn creds_update_event(&self) -> Event {
        Event::CredsUpdate(Box::new(self.inner.creds.read().await.clone()))
    }

    /// Deliver one event outside a read batch.
    pub(crate) async fn emit(&self, event: Event) {
        if let Err(e) = self.inner.events.send_event(event).await {
            tracing::debug!("Dropping event: {}", e);
        }
    }
}
