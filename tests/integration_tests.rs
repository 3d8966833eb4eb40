//! Connection-level integration tests: handshake, queries, batching,
//! teardown and key maintenance against an in-process relay.

use anyhow::Result;
use courier_core::binary::BinaryNode;
use courier_core::credentials::{CredentialStore, FileCredentialStore};
use courier_core::events::{Event, EventKind};
use courier_core::retry::MemoryRetryStore;
use courier_core::{Client, ConnectionState, DisconnectReason, Error, Jid};
use courier_crypto::x25519::KeyPair;
use courier_integration_tests::fixtures::{
    EventProbe, MockRelay, RelaySession, TEST_TIMEOUT, registered_store,
};
use courier_integration_tests::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::duplex;

async fn open_client(relay: &MockRelay) -> Result<(Client, EventProbe, RelaySession)> {
    let (client, events) = relay.client().await?;
    let mut session = relay.connect(&client).await?;
    session.open().await?;
    client
        .wait_for_state(ConnectionState::Open, TEST_TIMEOUT)
        .await?;
    Ok((client, EventProbe::new(events), session))
}

fn test_iq(marker: usize) -> BinaryNode {
    BinaryNode::builder("iq")
        .attr("to", "courier.net")
        .attr("type", "get")
        .attr("xmlns", "test")
        .attr("marker", marker.to_string())
        .build()
}

// ============================================================================
// Handshake and login
// ============================================================================

#[tokio::test]
async fn test_fresh_device_registers_during_handshake() -> Result<()> {
    init_tracing();
    let relay = MockRelay::new();
    let (client, events) = relay.client().await?;
    let mut events = EventProbe::new(events);

    let session = relay.connect(&client).await?;
    assert_eq!(session.login.tag(), "register");
    assert!(session.login.child_bytes("identity").is_some());
    assert!(session.login.child("skey").is_some());
    assert_eq!(client.state(), ConnectionState::Handshaking);

    events.wait_for_state(ConnectionState::Connecting).await?;
    Ok(())
}

#[tokio::test]
async fn test_registered_device_logs_in() -> Result<()> {
    let relay = MockRelay::new();
    let store = registered_store(Jid::device("15550001111", 4)).await?;
    let (client, events) = relay.client_with(relay.config(), store).await?;
    let mut events = EventProbe::new(events);

    let mut session = relay.connect(&client).await?;
    assert_eq!(session.login.tag(), "login");
    assert_eq!(session.login.attr("user"), Some("15550001111"));
    assert_eq!(session.login.attr("device"), Some("4"));

    session.open().await?;
    let update = events.wait_for_state(ConnectionState::Open).await?;
    assert!(!update.is_new_login);
    assert_eq!(client.state(), ConnectionState::Open);
    Ok(())
}

#[tokio::test]
async fn test_certificate_for_other_key_fails_handshake() -> Result<()> {
    let relay = MockRelay::new();
    let (client, events) = relay.client().await?;
    let mut events = EventProbe::new(events);

    let certificate = relay.certificate(KeyPair::generate().public, u64::MAX)?;
    let (client_io, relay_io) = duplex(1 << 16);
    let (accepted, connected) = tokio::join!(
        relay.accept(relay_io, certificate),
        client.connect_with_stream(client_io)
    );

    assert!(matches!(connected, Err(Error::HandshakeFailure(_))));
    assert!(accepted.is_err());
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(
        client.close_reason().await,
        Some(DisconnectReason::HandshakeFailed)
    );
    let closed = events.wait_for_state(ConnectionState::Closed).await?;
    assert_eq!(closed.reason, Some(DisconnectReason::HandshakeFailed));
    Ok(())
}

#[tokio::test]
async fn test_expired_certificate_fails_handshake() -> Result<()> {
    let relay = MockRelay::new();
    let (client, _events) = relay.client().await?;

    let (client_io, relay_io) = duplex(1 << 16);
    let certificate = relay.certificate(relay.static_public(), 1)?;
    let (_, connected) = tokio::join!(
        relay.accept(relay_io, certificate),
        client.connect_with_stream(client_io)
    );
    assert!(matches!(connected, Err(Error::HandshakeFailure(_))));
    Ok(())
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_query_responses_matched_by_tag() -> Result<()> {
    init_tracing();
    let relay = MockRelay::new();
    let (client, _events, mut session) = open_client(&relay).await?;

    let mut handles = Vec::new();
    for marker in 0..3 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.query(test_iq(marker), TEST_TIMEOUT).await
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(session.recv_matching(|n| n.attr("xmlns") == Some("test")).await?);
    }
    // Answer in reverse order
    for request in requests.iter().rev() {
        let response = BinaryNode::builder("iq")
            .attr("id", request.attr("id").unwrap_or_default())
            .attr("type", "result")
            .attr("echo", request.attr("marker").unwrap_or_default())
            .build();
        session.send(&response).await?;
    }

    for (marker, handle) in handles.into_iter().enumerate() {
        let response = handle.await??;
        assert_eq!(response.attr("echo"), Some(marker.to_string().as_str()));
    }
    Ok(())
}

#[tokio::test]
async fn test_query_timeout_then_late_response_surfaces() -> Result<()> {
    let relay = MockRelay::new();
    let (client, mut events, mut session) = open_client(&relay).await?;

    let result = client.query(test_iq(0), Duration::from_millis(100)).await;
    let Err(Error::QueryTimeout { tag, .. }) = result else {
        panic!("expected timeout, got {result:?}");
    };

    let request = session.recv_matching(|n| n.attr("xmlns") == Some("test")).await?;
    assert_eq!(request.attr("id"), Some(tag.as_str()));
    session
        .send(
            &BinaryNode::builder("iq")
                .attr("id", tag.clone())
                .attr("type", "result")
                .build(),
        )
        .await?;

    let late = events
        .wait_for(|e| matches!(e, Event::Notification(n) if n.attr("id") == Some(tag.as_str())))
        .await?;
    assert_eq!(late.kind(), EventKind::Notification);
    Ok(())
}

#[tokio::test]
async fn test_error_response_maps_to_server_error() -> Result<()> {
    let relay = MockRelay::new();
    let (client, _events, mut session) = open_client(&relay).await?;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.query(test_iq(1), TEST_TIMEOUT).await })
    };
    let request = session.recv_matching(|n| n.attr("xmlns") == Some("test")).await?;
    session
        .send(
            &BinaryNode::builder("iq")
                .attr("id", request.attr("id").unwrap_or_default())
                .attr("type", "error")
                .child(
                    BinaryNode::builder("error")
                        .attr("code", "404")
                        .attr("text", "item-not-found")
                        .build(),
                )
                .build(),
        )
        .await?;

    match pending.await? {
        Err(Error::ServerError { code, text }) => {
            assert_eq!(code, 404);
            assert_eq!(text, "item-not-found");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_pending_queries_fail_on_close() -> Result<()> {
    let relay = MockRelay::new();
    let (client, mut events, mut session) = open_client(&relay).await?;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.query(test_iq(2), TEST_TIMEOUT).await })
    };
    session.recv_matching(|n| n.attr("xmlns") == Some("test")).await?;
    client.close().await;

    assert!(matches!(
        pending.await?,
        Err(Error::ConnectionClosed(DisconnectReason::ClosedByClient))
    ));
    let closed = events.wait_for_state(ConnectionState::Closed).await?;
    assert_eq!(closed.reason, Some(DisconnectReason::ClosedByClient));
    assert!(session.closed().await);
    assert!(matches!(
        client.query(test_iq(3), TEST_TIMEOUT).await,
        Err(Error::NotConnected)
    ));
    Ok(())
}

#[tokio::test]
async fn test_queries_racing_close_never_hang() -> Result<()> {
    let relay = MockRelay::new();
    let (client, _events, _session) = open_client(&relay).await?;

    let queries: Vec<_> = (0..32)
        .map(|marker| {
            let client = client.clone();
            tokio::spawn(async move { client.query(test_iq(100 + marker), Duration::from_secs(60)).await })
        })
        .collect();
    client.close().await;

    for query in queries {
        let outcome = tokio::time::timeout(Duration::from_secs(5), query)
            .await
            .expect("query left waiting after close")?;
        assert!(matches!(
            outcome,
            Err(Error::ConnectionClosed(_) | Error::NotConnected)
        ));
    }
    Ok(())
}

#[tokio::test]
async fn test_server_ping_answered() -> Result<()> {
    let relay = MockRelay::new();
    let (_client, _events, mut session) = open_client(&relay).await?;

    session
        .send(
            &BinaryNode::builder("iq")
                .attr("id", "srv-1")
                .attr("from", "courier.net")
                .attr("type", "get")
                .attr("xmlns", "urn:xmpp:ping")
                .build(),
        )
        .await?;
    let reply = session.recv_tag("iq").await?;
    assert_eq!(reply.attr("id"), Some("srv-1"));
    assert_eq!(reply.attr("type"), Some("result"));
    Ok(())
}

// ============================================================================
// Event batching
// ============================================================================

#[tokio::test]
async fn test_stanzas_from_one_read_form_one_batch() -> Result<()> {
    let relay = MockRelay::new();
    let (_client, mut events, mut session) = open_client(&relay).await?;

    let notifications: Vec<BinaryNode> = (0..10)
        .map(|i| {
            BinaryNode::builder("notification")
                .attr("id", format!("n{i}"))
                .attr("from", "courier.net")
                .attr("type", "server")
                .build()
        })
        .collect();
    session.send_batch(&notifications).await?;

    let batch = events
        .batch_matching(|b| !b.get(EventKind::Notification).is_empty())
        .await?;
    let ids: Vec<_> = batch
        .get(EventKind::Notification)
        .iter()
        .filter_map(|e| match e {
            Event::Notification(n) => n.attr("id").map(str::to_owned),
            _ => None,
        })
        .collect();
    let expected: Vec<_> = (0..10).map(|i| format!("n{i}")).collect();
    assert_eq!(ids, expected);

    for i in 0..10 {
        let ack = session.recv_tag("ack").await?;
        assert_eq!(ack.attr("id"), Some(format!("n{i}").as_str()));
        assert_eq!(ack.attr("class"), Some("notification"));
    }
    Ok(())
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_stream_error_closes_with_reason() -> Result<()> {
    let relay = MockRelay::new();
    let (client, mut events, mut session) = open_client(&relay).await?;

    session
        .send(&BinaryNode::builder("stream:error").attr("code", "515").build())
        .await?;
    let closed = events.wait_for_state(ConnectionState::Closed).await?;
    assert_eq!(closed.reason, Some(DisconnectReason::RestartRequired));
    assert!(DisconnectReason::RestartRequired.advice().should_reconnect());

    // Reconnect over a fresh stream
    let mut session = relay.connect(&client).await?;
    session.open().await?;
    client
        .wait_for_state(ConnectionState::Open, TEST_TIMEOUT)
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_replayed_frame_closes_connection() -> Result<()> {
    let relay = MockRelay::new();
    let (client, mut events, mut session) = open_client(&relay).await?;

    let frame = session.seal(
        &BinaryNode::builder("notification")
            .attr("id", "once")
            .attr("from", "courier.net")
            .build(),
    )?;
    session.send_raw(&frame).await?;
    session.send_raw(&frame).await?;

    let closed = events.wait_for_state(ConnectionState::Closed).await?;
    assert_eq!(closed.reason, Some(DisconnectReason::Malformed));
    assert_eq!(client.state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_undecodable_stanza_closes_connection() -> Result<()> {
    let relay = MockRelay::new();
    let (_client, mut events, mut session) = open_client(&relay).await?;

    let frame = session.seal_bytes(&[0x07, 0x00])?;
    session.send_raw(&frame).await?;

    let closed = events.wait_for_state(ConnectionState::Closed).await?;
    assert_eq!(closed.reason, Some(DisconnectReason::Malformed));
    Ok(())
}

#[tokio::test]
async fn test_keep_alive_pings_and_expires() -> Result<()> {
    let relay = MockRelay::new();
    let mut config = relay.config();
    config.keep_alive.enabled = true;
    config.keep_alive.interval = Duration::from_millis(100);
    config.default_query_timeout = Duration::from_millis(300);
    let (client, events) = relay
        .client_with(config, Arc::new(courier_core::MemoryCredentialStore::new()))
        .await?;
    let mut events = EventProbe::new(events);
    let mut session = relay.connect(&client).await?;
    session.open().await?;

    let ping = session.recv_matching(|n| n.attr("xmlns") == Some("w:p")).await?;
    assert!(ping.child("ping").is_some());

    // Stay silent: the connection is dropped once the grace period passes
    let closed = events.wait_for_state(ConnectionState::Closed).await?;
    assert_eq!(closed.reason, Some(DisconnectReason::ConnectionLost));
    Ok(())
}

// ============================================================================
// Key maintenance and persistence
// ============================================================================

#[tokio::test]
async fn test_prekeys_uploaded_when_relay_runs_low() -> Result<()> {
    let relay = MockRelay::new();
    let (client, events) = relay.client().await?;
    let mut events = EventProbe::new(events);
    let mut session = relay.connect(&client).await?;

    session.send(&BinaryNode::empty("success")).await?;
    session.answer_prekey_count(2).await?;

    let upload = session
        .recv_matching(|n| n.tag() == "iq" && n.child("list").is_some())
        .await?;
    let keys = upload.child("list").map(|l| l.children().len()).unwrap_or(0);
    assert_eq!(keys, 30);
    assert!(upload.child("skey").is_some());
    session
        .send(
            &BinaryNode::builder("iq")
                .attr("id", upload.attr("id").unwrap_or_default())
                .attr("type", "result")
                .build(),
        )
        .await?;

    let event = events
        .wait_for(|e| matches!(e, Event::CredsUpdate(_)))
        .await?;
    let Event::CredsUpdate(creds) = event else {
        unreachable!()
    };
    assert_eq!(creds.next_prekey_id, creds.first_unuploaded_prekey_id);
    assert_eq!(client.sessions().one_time_prekey_count(), 30);
    Ok(())
}

#[tokio::test]
async fn test_file_store_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("auth").join("state.json");
    let relay = MockRelay::new();

    let store = Arc::new(FileCredentialStore::new(&path));
    let (client, _events) =
        Client::new(relay.config(), store.clone(), Arc::new(MemoryRetryStore::new())).await?;
    let first = client.credentials().await;
    let mut session = relay.connect(&client).await?;
    session.open().await?;
    client.close().await;
    drop(client);

    let reloaded = store.load().await?.expect("state saved");
    assert_eq!(reloaded.creds.registration_id, first.registration_id);

    let (client, _events) =
        Client::new(relay.config(), store, Arc::new(MemoryRetryStore::new())).await?;
    let second = client.credentials().await;
    assert_eq!(second.identity.public(), first.identity.public());
    assert_eq!(second.noise_key.public, first.noise_key.public);
    Ok(())
}
