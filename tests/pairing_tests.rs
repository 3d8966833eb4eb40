//! Device pairing through QR codes and pairing codes.

use anyhow::Result;
use courier_core::binary::BinaryNode;
use courier_core::events::Event;
use courier_core::stanza;
use courier_core::{ConnectionState, DisconnectReason, Jid};
use courier_crypto::hash::{hash, keyed_hash};
use courier_crypto::signatures::Signature;
use courier_integration_tests::fixtures::{EventProbe, MockRelay};
use courier_integration_tests::init_tracing;
use std::sync::Arc;
use std::time::Duration;

const DETAILS: &[u8] = b"account-signed device details";

fn pair_device(refs: &[&str]) -> BinaryNode {
    BinaryNode::builder("iq")
        .attr("id", "pair-1")
        .attr("from", "courier.net")
        .attr("type", "set")
        .attr("xmlns", "md")
        .child(
            BinaryNode::builder("pair-device")
                .children(
                    refs.iter()
                        .map(|r| BinaryNode::builder("ref").bytes(r.as_bytes().to_vec()).build())
                        .collect(),
                )
                .build(),
        )
        .build()
}

fn pair_success(device: &Jid, hmac: &[u8]) -> BinaryNode {
    BinaryNode::builder("iq")
        .attr("id", "pair-2")
        .attr("from", "courier.net")
        .attr("type", "set")
        .attr("xmlns", "md")
        .child(
            BinaryNode::builder("pair-success")
                .child(
                    BinaryNode::builder("device")
                        .attr("jid", device.to_string())
                        .build(),
                )
                .child(
                    BinaryNode::builder("device-identity")
                        .child(BinaryNode::builder("details").bytes(DETAILS.to_vec()).build())
                        .child(BinaryNode::builder("hmac").bytes(hmac.to_vec()).build())
                        .build(),
                )
                .build(),
        )
        .build()
}

fn qr_of(event: &Event) -> Option<&str> {
    match event {
        Event::ConnectionUpdate(update) => update.qr.as_deref(),
        _ => None,
    }
}

#[tokio::test]
async fn test_qr_pairing_completes_login() -> Result<()> {
    init_tracing();
    let relay = MockRelay::new();
    let (client, events) = relay.client().await?;
    let mut events = EventProbe::new(events);
    let mut session = relay.connect(&client).await?;

    session.send(&pair_device(&["ref-one", "ref-two"])).await?;
    let ack = session.recv_tag("iq").await?;
    assert_eq!(ack.attr("id"), Some("pair-1"));
    assert_eq!(ack.attr("type"), Some("result"));

    let event = events.wait_for(|e| qr_of(e).is_some()).await?;
    let qr = qr_of(&event).unwrap_or_default();
    let parts: Vec<&str> = qr.split(',').collect();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[0], "ref-one");
    assert_eq!(client.state(), ConnectionState::Pairing);

    let creds = client.credentials().await;
    let device = Jid::device("15557654321", 7);
    let hmac = stanza::device_identity_mac(&creds.adv_secret, DETAILS);
    session.send(&pair_success(&device, &hmac)).await?;

    let sign = session
        .recv_matching(|n| n.child("pair-device-sign").is_some())
        .await?;
    assert_eq!(sign.attr("id"), Some("pair-2"));
    let identity = sign
        .child("pair-device-sign")
        .and_then(|s| s.child("device-identity"))
        .expect("device identity in reply");
    assert_eq!(identity.child_bytes("details"), Some(DETAILS));
    let signature = Signature::from_slice(identity.child_bytes("signature").unwrap_or_default())?;
    creds
        .identity
        .public()
        .signing
        .verify(DETAILS, &signature)?;

    let open = events.wait_for_state(ConnectionState::Open).await?;
    assert!(open.is_new_login);
    let creds = client.credentials().await;
    assert_eq!(creds.me, Some(device));
    assert!(creds.registered);
    Ok(())
}

#[tokio::test]
async fn test_pair_success_with_bad_hmac_is_rejected() -> Result<()> {
    let relay = MockRelay::new();
    let (client, events) = relay.client().await?;
    let mut events = EventProbe::new(events);
    let mut session = relay.connect(&client).await?;

    session.send(&pair_device(&["ref-one"])).await?;
    events.wait_for(|e| qr_of(e).is_some()).await?;

    session
        .send(&pair_success(&Jid::device("15557654321", 7), &[0u8; 32]))
        .await?;
    let rejection = session
        .recv_matching(|n| n.attr("type") == Some("error"))
        .await?;
    assert_eq!(rejection.attr("id"), Some("pair-2"));
    assert_eq!(
        rejection.child("error").and_then(|e| e.attr("code")),
        Some("401")
    );

    let closed = events.wait_for_state(ConnectionState::Closed).await?;
    assert_eq!(closed.reason, Some(DisconnectReason::BadSession));
    assert!(!client.credentials().await.registered);
    Ok(())
}

#[tokio::test]
async fn test_qr_codes_rotate_then_pairing_is_cancelled() -> Result<()> {
    let relay = MockRelay::new();
    let mut config = relay.config();
    config.pairing.initial_qr_timeout = Duration::from_millis(60);
    config.pairing.qr_timeout = Duration::from_millis(30);
    config.pairing.max_qr_codes = 2;
    let (client, events) = relay
        .client_with(config, Arc::new(courier_core::MemoryCredentialStore::new()))
        .await?;
    let mut events = EventProbe::new(events);
    let mut session = relay.connect(&client).await?;

    session.send(&pair_device(&["r1", "r2", "r3"])).await?;

    let mut shown = Vec::new();
    let closed = loop {
        match events.next().await? {
            Event::ConnectionUpdate(update) if update.state == ConnectionState::Closed => {
                break update;
            }
            event => {
                if let Some(qr) = qr_of(&event) {
                    shown.push(qr.split(',').next().unwrap_or_default().to_string());
                }
            }
        }
    };
    assert_eq!(shown, vec!["r1", "r2"]);
    assert_eq!(closed.reason, Some(DisconnectReason::PairingCancelled));
    assert!(!DisconnectReason::PairingCancelled.advice().should_reconnect());
    Ok(())
}

#[tokio::test]
async fn test_pairing_code_replaces_qr() -> Result<()> {
    let relay = MockRelay::new();
    let mut config = relay.config();
    config.pairing.phone_number = Some("15551234567".to_string());
    let (client, events) = relay
        .client_with(config, Arc::new(courier_core::MemoryCredentialStore::new()))
        .await?;
    let mut events = EventProbe::new(events);
    let mut session = relay.connect(&client).await?;

    session.send(&pair_device(&["ref-one"])).await?;
    let hello = session
        .recv_matching(|n| n.child("link_code_companion_reg").is_some())
        .await?;
    let registration = hello
        .child("link_code_companion_reg")
        .expect("companion registration");
    assert_eq!(registration.attr("stage"), Some("companion_hello"));
    assert_eq!(registration.attr("jid"), Some("15551234567@s.courier.net"));
    session
        .send(
            &BinaryNode::builder("iq")
                .attr("id", hello.attr("id").unwrap_or_default())
                .attr("type", "result")
                .build(),
        )
        .await?;

    let code = loop {
        let event = events.next().await?;
        assert!(qr_of(&event).is_none(), "QR shown during code pairing");
        if let Event::ConnectionUpdate(update) = event {
            if let Some(code) = update.pairing_code {
                break code;
            }
        }
    };
    assert_eq!(code.len(), 9);
    assert_eq!(code.as_bytes()[4], b'-');

    let creds = client.credentials().await;
    let raw = creds.pairing_code.clone().expect("code kept in credentials");
    assert_eq!(raw, code.replace('-', ""));
    let commitment = keyed_hash(&hash(raw.as_bytes()), creds.noise_key.public.as_bytes());
    assert_eq!(
        registration.child_bytes("link_code_pairing_wrapped_companion_ephemeral_pub"),
        Some(&commitment[..])
    );

    // Pair-success completes the code flow the same way
    let hmac = stanza::device_identity_mac(&creds.adv_secret, DETAILS);
    session
        .send(&pair_success(&Jid::device("15551234567", 2), &hmac))
        .await?;
    events.wait_for_state(ConnectionState::Open).await?;
    assert_eq!(client.credentials().await.pairing_code, None);
    Ok(())
}

#[tokio::test]
async fn test_pairing_code_needs_pairing_state() -> Result<()> {
    let relay = MockRelay::new();
    let (client, _events) = relay.client().await?;
    assert!(matches!(
        client.request_pairing_code("15551234567").await,
        Err(courier_core::Error::NotConnected)
    ));
    assert!(matches!(
        client.request_pairing_code("+1 555").await,
        Err(courier_core::Error::InvalidConfig(_))
    ));
    Ok(())
}
