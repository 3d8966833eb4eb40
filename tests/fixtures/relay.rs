//! In-process relay for driving a [`Client`] over a duplex pipe.
//!
//! The relay runs the responder side of the handshake with a certificate
//! from its own test root, then hands the test a [`RelaySession`] to push
//! stanzas at the client and read what it sends back.
//!
//! # Example
//!
//! ```no_run
//! use courier_integration_tests::fixtures::MockRelay;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let relay = MockRelay::new();
//! let (client, events) = relay.client().await?;
//! let mut session = relay.connect(&client).await?;
//! session.open().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result, bail};
use courier_core::binary::{BinaryNode, decode, encode};
use courier_core::credentials::{AuthState, CredentialStore, MemoryCredentialStore};
use courier_core::events::EventStream;
use courier_core::frame::{INTRO_HEADER, encode_frame};
use courier_core::retry::MemoryRetryStore;
use courier_core::stanza;
use courier_core::transport::FrameReader;
use courier_core::{Client, ClientConfig, Jid};
use courier_crypto::certificate::ServerCertificate;
use courier_crypto::frame_cipher::FrameSealer;
use courier_crypto::handshake::Handshake;
use courier_crypto::signatures::SigningKey;
use courier_crypto::x25519::{KeyPair, PublicKey};
use courier_crypto::x3dh::PreKeyBundle;
use rand_core::OsRng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, duplex};

/// Upper bound for any single wait in the tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_FRAME: usize = 1 << 20;
const ISSUER: &str = "courier-root";

/// Credential store holding a device already linked as `me`.
pub async fn registered_store(me: Jid) -> Result<Arc<MemoryCredentialStore>> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let mut auth = AuthState::generate(now)?;
    auth.creds.me = Some(me);
    auth.creds.registered = true;
    let store = Arc::new(MemoryCredentialStore::new());
    store.save(&auth).await?;
    Ok(store)
}

/// Relay identity: certificate root plus static key
pub struct MockRelay {
    root: SigningKey,
    static_key: KeyPair,
}

impl Default for MockRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRelay {
    /// Relay with a fresh root and static key.
    pub fn new() -> Self {
        Self {
            root: SigningKey::generate(&mut OsRng),
            static_key: KeyPair::generate(),
        }
    }

    /// Client configuration trusting this relay, keep-alive off.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.transport.trusted_root = Some(self.root.verifying_key());
        config.transport.certificate_issuer = ISSUER.to_string();
        config.transport.connect_timeout = TEST_TIMEOUT;
        config.transport.max_frame_size = MAX_FRAME;
        config.default_query_timeout = TEST_TIMEOUT;
        config.keep_alive.enabled = false;
        config
    }

    /// Fresh, unpaired client for this relay.
    pub async fn client(&self) -> Result<(Client, EventStream)> {
        self.client_with(self.config(), Arc::new(MemoryCredentialStore::new()))
            .await
    }

    /// Client for this relay with explicit configuration and store.
    pub async fn client_with(
        &self,
        config: ClientConfig,
        store: Arc<MemoryCredentialStore>,
    ) -> Result<(Client, EventStream)> {
        Ok(Client::new(config, store, Arc::new(MemoryRetryStore::new())).await?)
    }

    /// Public half of the relay's static key.
    pub fn static_public(&self) -> PublicKey {
        self.static_key.public
    }

    /// Certificate for `key`, valid until `not_after`.
    pub fn certificate(&self, key: PublicKey, not_after: u64) -> Result<Vec<u8>> {
        Ok(ServerCertificate::issue(&self.root, 7, ISSUER, key, not_after)?.encode()?)
    }

    /// Connect `client` and complete the handshake.
    pub async fn connect(&self, client: &Client) -> Result<RelaySession> {
        let certificate = self.certificate(self.static_key.public, u64::MAX)?;
        let (client_io, relay_io) = duplex(MAX_FRAME);
        let (session, connected) = tokio::join!(
            self.accept(relay_io, certificate),
            client.connect_with_stream(client_io)
        );
        connected.context("client handshake")?;
        session
    }

    /// Run the relay side of the handshake presenting `certificate`.
    pub async fn accept(&self, stream: DuplexStream, certificate: Vec<u8>) -> Result<RelaySession> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, MAX_FRAME);
        let mut writer = write_half;

        reader.read_intro().await?;
        let mut handshake = Handshake::responder(&self.static_key, &INTRO_HEADER)?;
        handshake.read_message(&reader.next_frame().await?)?;
        let reply = handshake.write_message(&certificate)?;
        writer.write_all(&encode_frame(&reply, MAX_FRAME)?).await?;
        writer.flush().await?;

        let login = handshake.read_message(&reader.next_frame().await?)?;
        let (sealer, opener) = handshake.into_transport()?.into_ciphers();
        reader.install_opener(opener);

        Ok(RelaySession {
            reader,
            writer,
            sealer,
            login: decode(&login)?,
        })
    }
}

/// Relay end of one established connection
pub struct RelaySession {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    sealer: FrameSealer,
    /// Login payload the client sent in the handshake
    pub login: BinaryNode,
}

impl RelaySession {
    /// Seal and frame one stanza without sending it.
    pub fn seal(&mut self, node: &BinaryNode) -> Result<Vec<u8>> {
        let body = encode(node)?;
        self.seal_bytes(&body)
    }

    /// Seal and frame an arbitrary body.
    pub fn seal_bytes(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.sealer.seal(body)?;
        Ok(encode_frame(&sealed, MAX_FRAME)?)
    }

    /// Send one stanza.
    pub async fn send(&mut self, node: &BinaryNode) -> Result<()> {
        self.send_batch(std::slice::from_ref(node)).await
    }

    /// Send several stanzas in a single write.
    pub async fn send_batch(&mut self, nodes: &[BinaryNode]) -> Result<()> {
        let mut bytes = Vec::new();
        for node in nodes {
            bytes.extend(self.seal(node)?);
        }
        self.send_raw(&bytes).await
    }

    /// Write bytes as they are.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next stanza from the client.
    pub async fn recv(&mut self) -> Result<BinaryNode> {
        let frame = tokio::time::timeout(TEST_TIMEOUT, self.reader.next_frame())
            .await
            .context("timed out waiting for the client")??;
        Ok(decode(&frame)?)
    }

    /// Next stanza with tag `tag`, skipping everything else.
    pub async fn recv_tag(&mut self, tag: &str) -> Result<BinaryNode> {
        self.recv_matching(|node| node.tag() == tag).await
    }

    /// Next stanza accepted by `predicate`, skipping everything else.
    pub async fn recv_matching<F>(&mut self, predicate: F) -> Result<BinaryNode>
    where
        F: Fn(&BinaryNode) -> bool,
    {
        loop {
            let node = self.recv().await?;
            if predicate(&node) {
                return Ok(node);
            }
            tracing::debug!("relay skipping <{}>", node.tag());
        }
    }

    /// Whether the client closed its side.
    pub async fn closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(TEST_TIMEOUT, self.reader.next_frame()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }

    /// Log the client in and answer its prekey count check with `count`.
    pub async fn open(&mut self) -> Result<()> {
        self.send(&BinaryNode::empty("success")).await?;
        self.answer_prekey_count(50).await
    }

    /// Answer the next prekey count query.
    pub async fn answer_prekey_count(&mut self, count: u32) -> Result<()> {
        let query = self
            .recv_matching(|node| node.tag() == "iq" && node.child("count").is_some())
            .await?;
        let response = result_for(&query)
            .child(
                BinaryNode::builder("count")
                    .attr("value", count.to_string())
                    .build(),
            )
            .build();
        self.send(&response).await
    }

    /// Answer the next bundle query with `bundles`.
    pub async fn answer_bundle_query(&mut self, bundles: &[(Jid, PreKeyBundle)]) -> Result<()> {
        let query = self
            .recv_matching(|node| node.tag() == "iq" && node.child("key").is_some())
            .await?;
        let users = bundles
            .iter()
            .map(|(jid, bundle)| {
                BinaryNode::builder("user")
                    .attr("jid", jid.to_string())
                    .children(stanza::bundle_children(bundle))
                    .build()
            })
            .collect();
        let response = result_for(&query)
            .child(BinaryNode::builder("list").children(users).build())
            .build();
        self.send(&response).await
    }

    /// Forward a client `<message>` to another client as sent by `from`.
    pub fn deliver(message: &BinaryNode, from: &Jid, recipient: &Jid) -> Result<BinaryNode> {
        let Some(id) = message.attr("id") else {
            bail!("message without id");
        };
        let mut builder = BinaryNode::builder("message")
            .attr("id", id)
            .attr("type", "text")
            .attr("t", "1700000000");
        let mut encs: Vec<BinaryNode> = Vec::new();

        let to = message.attr("to").unwrap_or_default();
        if to.ends_with("@g.courier.net") {
            builder = builder
                .attr("from", to)
                .attr("participant", from.to_string());
            if let Some(fanout) = message.child("participants") {
                let recipient = recipient.to_string();
                encs.extend(
                    fanout
                        .children_by_tag("to")
                        .filter(|entry| entry.attr("jid") == Some(recipient.as_str()))
                        .filter_map(|entry| entry.child("enc").cloned()),
                );
            }
        } else {
            builder = builder.attr("from", from.to_string());
        }
        encs.extend(message.children_by_tag("enc").cloned());
        Ok(builder.children(encs).build())
    }
}

fn result_for(request: &BinaryNode) -> courier_core::NodeBuilder {
    BinaryNode::builder("iq")
        .attr("id", request.attr("id").unwrap_or_default())
        .attr("from", request.attr("to").unwrap_or("courier.net"))
        .attr("type", "result")
}
