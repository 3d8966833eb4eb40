//! Builders and parsers for the stanzas the engine itself speaks.
//!
//! Key material travels as fixed-width big-endian integers and raw key
//! bytes inside `<registration>`, `<identity>`, `<skey>` and `<key>`
//! children, the same layout in prekey uploads, bundle fetches and retry
//! receipts.

use crate::binary::{BinaryNode, NodeBuilder};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::session::CiphertextKind;
use courier_crypto::hash::{hash, keyed_hash};
use courier_crypto::identity::IdentityKey;
use courier_crypto::signatures::Signature;
use courier_crypto::x25519::PublicKey;
use courier_crypto::x3dh::{OneTimePreKey, PreKeyBundle, SignedPreKey};
use std::borrow::Cow;

/// Namespace of prekey iqs
pub const XMLNS_ENCRYPT: &str = "encrypt";
/// Namespace of client keep-alive pings
pub const XMLNS_PING: &str = "w:p";
/// Namespace of server pings
pub const XMLNS_SERVER_PING: &str = "urn:xmpp:ping";
/// Namespace of device pairing iqs
pub const XMLNS_PAIRING: &str = "md";

/// Key type byte for X25519 keys
const KEY_TYPE_X25519: u8 = 5;
/// Width of prekey ids on the wire
const PREKEY_ID_WIDTH: usize = 3;

/// Big-endian encoding of the low `width` bytes of `value`.
#[must_use]
pub fn encode_big_endian(value: u32, width: usize) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    bytes[bytes.len().saturating_sub(width)..].to_vec()
}

/// Decode up to four big-endian bytes.
///
/// # Errors
///
/// Returns [`Error::UnexpectedResponse`] for empty or over-long input.
pub fn decode_big_endian(bytes: &[u8]) -> Result<u32> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(unexpected(format!("integer of {} bytes", bytes.len())));
    }
    Ok(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

fn unexpected(text: impl Into<Cow<'static, str>>) -> Error {
    Error::UnexpectedResponse(text.into())
}

fn required_child<'a>(node: &'a BinaryNode, tag: &str) -> Result<&'a BinaryNode> {
    node.child(tag)
        .ok_or_else(|| unexpected(format!("<{}> missing <{}>", node.tag(), tag)))
}

fn required_bytes<'a>(node: &'a BinaryNode, tag: &str) -> Result<&'a [u8]> {
    node.child_bytes(tag)
        .ok_or_else(|| unexpected(format!("<{}> missing <{}> bytes", node.tag(), tag)))
}

fn required_attr<'a>(node: &'a BinaryNode, key: &str) -> Result<&'a str> {
    node.attr(key)
        .ok_or_else(|| unexpected(format!("<{}> missing {} attribute", node.tag(), key)))
}

fn public_key(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_slice(bytes).ok_or_else(|| unexpected("public key is not 32 bytes"))
}

fn bytes_node(tag: &str, bytes: impl Into<Vec<u8>>) -> BinaryNode {
    BinaryNode::builder(tag).bytes(bytes).build()
}

// ═══════════════════════════════════════════════════════════════════════════
// Generic stanzas
// ═══════════════════════════════════════════════════════════════════════════

/// Start an `<iq>` addressed to `to`.
pub fn iq(id: &str, to: &Jid, kind: &str, xmlns: &str) -> NodeBuilder {
    BinaryNode::builder("iq")
        .attr("id", id)
        .attr("to", to.to_string())
        .attr("type", kind)
        .attr("xmlns", xmlns)
}

/// Empty `type="result"` reply to an iq.
#[must_use]
pub fn iq_result(request: &BinaryNode) -> BinaryNode {
    BinaryNode::builder("iq")
        .attr_opt("to", request.attr("from"))
        .attr_opt("id", request.attr("id"))
        .attr("type", "result")
        .build()
}

/// Keep-alive ping to the relay.
#[must_use]
pub fn ping(id: &str) -> BinaryNode {
    iq(id, &Jid::relay(), "get", XMLNS_PING)
        .child(BinaryNode::empty("ping"))
        .build()
}

/// Whether `node` is a ping from the relay.
#[must_use]
pub fn is_server_ping(node: &BinaryNode) -> bool {
    node.tag() == "iq"
        && node.attr("type") == Some("get")
        && node.attr("xmlns") == Some(XMLNS_SERVER_PING)
}

/// Acknowledgment for an inbound stanza.
///
/// Returns `None` for stanzas without an id or sender.
#[must_use]
pub fn ack(node: &BinaryNode) -> Option<BinaryNode> {
    let id = node.attr("id")?;
    let from = node.attr("from")?;
    let builder = BinaryNode::builder("ack")
        .attr("id", id)
        .attr("class", node.tag())
        .attr("to", from)
        .attr_opt("participant", node.attr("participant"));
    let builder = match node.tag() {
        "message" => builder,
        _ => builder.attr_opt("type", node.attr("type")),
    };
    Some(builder.build())
}

/// Map an `iq type="error"` to [`Error::ServerError`].
#[must_use]
pub fn server_error(node: &BinaryNode) -> Option<Error> {
    if node.attr("type") != Some("error") {
        return None;
    }
    let error = node.child("error");
    let code = error
        .and_then(|e| e.attr("code"))
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let text = error
        .and_then(|e| e.attr("text"))
        .unwrap_or("unknown")
        .to_string();
    Some(Error::ServerError { code, text })
}

// ═══════════════════════════════════════════════════════════════════════════
// Login
// ═══════════════════════════════════════════════════════════════════════════

/// Payload sent inside the last handshake message.
///
/// Registered devices log in as their device JID; fresh devices send
/// their registration material and are led into pairing.
#[must_use]
pub fn login_payload(creds: &Credentials, passive: bool) -> BinaryNode {
    match (&creds.me, creds.registered) {
        (Some(me), true) => BinaryNode::builder("login")
            .attr("user", me.user.clone())
            .attr("device", me.device_id().to_string())
            .attr("passive", if passive { "true" } else { "false" })
            .build(),
        _ => BinaryNode::builder("register")
            .child(bytes_node(
                "registration",
                encode_big_endian(creds.registration_id, 4),
            ))
            .child(bytes_node("identity", creds.identity.public().to_bytes()))
            .child(signed_prekey_node(&creds.signed_prekey))
            .build(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Prekeys
// ═══════════════════════════════════════════════════════════════════════════

/// `<skey>` for a signed prekey.
#[must_use]
pub fn signed_prekey_node(prekey: &SignedPreKey) -> BinaryNode {
    BinaryNode::builder("skey")
        .child(bytes_node("id", encode_big_endian(prekey.id, PREKEY_ID_WIDTH)))
        .child(bytes_node("value", prekey.key_pair.public.to_bytes()))
        .child(bytes_node("signature", prekey.signature.as_bytes().to_vec()))
        .build()
}

fn one_time_prekey_node(id: u32, public: &PublicKey) -> BinaryNode {
    BinaryNode::builder("key")
        .child(bytes_node("id", encode_big_endian(id, PREKEY_ID_WIDTH)))
        .child(bytes_node("value", public.to_bytes()))
        .build()
}

/// Query the number of one-time prekeys the server still holds.
#[must_use]
pub fn prekey_count_query(id: &str) -> BinaryNode {
    iq(id, &Jid::server(crate::jid::USER_SERVER), "get", XMLNS_ENCRYPT)
        .child(BinaryNode::empty("count"))
        .build()
}

/// Read the `<count value>` of a prekey count response.
///
/// # Errors
///
/// Returns [`Error::UnexpectedResponse`] if the count is missing.
pub fn parse_prekey_count(response: &BinaryNode) -> Result<u32> {
    let count = required_child(response, "count")?;
    required_attr(count, "value")?
        .parse()
        .map_err(|_| unexpected("prekey count is not a number"))
}

/// Upload one-time prekeys along with the current signed prekey.
#[must_use]
pub fn prekey_upload(
    id: &str,
    creds: &Credentials,
    prekeys: &[OneTimePreKey],
) -> BinaryNode {
    let list = prekeys
        .iter()
        .map(|k| one_time_prekey_node(k.id, &k.key_pair.public))
        .collect();

    iq(id, &Jid::server(crate::jid::USER_SERVER), "set", XMLNS_ENCRYPT)
        .child(bytes_node(
            "registration",
            encode_big_endian(creds.registration_id, 4),
        ))
        .child(bytes_node("type", vec![KEY_TYPE_X25519]))
        .child(bytes_node("identity", creds.identity.public().to_bytes()))
        .child(BinaryNode::builder("list").children(list).build())
        .child(signed_prekey_node(&creds.signed_prekey))
        .build()
}

/// Publish a rotated signed prekey.
#[must_use]
pub fn rotate_signed_prekey(id: &str, prekey: &SignedPreKey) -> BinaryNode {
    iq(id, &Jid::server(crate::jid::USER_SERVER), "set", XMLNS_ENCRYPT)
        .child(
            BinaryNode::builder("rotate")
                .child(signed_prekey_node(prekey))
                .build(),
        )
        .build()
}

// ═══════════════════════════════════════════════════════════════════════════
// Bundles
// ═══════════════════════════════════════════════════════════════════════════

/// Fetch the prekey bundles of some devices.
#[must_use]
pub fn bundle_query(id: &str, devices: &[Jid]) -> BinaryNode {
    let users = devices
        .iter()
        .map(|jid| BinaryNode::builder("user").attr("jid", jid.to_string()).build())
        .collect();
    iq(id, &Jid::server(crate::jid::USER_SERVER), "get", XMLNS_ENCRYPT)
        .child(BinaryNode::builder("key").children(users).build())
        .build()
}

/// Children describing a bundle, as found under `<user>` or `<keys>`.
#[must_use]
pub fn bundle_children(bundle: &PreKeyBundle) -> Vec<BinaryNode> {
    let mut children = vec![
        bytes_node("registration", encode_big_endian(bundle.registration_id, 4)),
        bytes_node("type", vec![KEY_TYPE_X25519]),
        bytes_node("identity", bundle.identity.to_bytes()),
        BinaryNode::builder("skey")
            .child(bytes_node(
                "id",
                encode_big_endian(bundle.signed_prekey_id, PREKEY_ID_WIDTH),
            ))
            .child(bytes_node("value", bundle.signed_prekey.to_bytes()))
            .child(bytes_node(
                "signature",
                bundle.signed_prekey_signature.as_bytes().to_vec(),
            ))
            .build(),
    ];
    if let Some((id, key)) = &bundle.one_time_prekey {
        children.push(one_time_prekey_node(*id, key));
    }
    children
}

/// Parse the bundle children of `node` and verify the signed prekey.
///
/// # Errors
///
/// Returns [`Error::UnexpectedResponse`] for missing or malformed parts
/// and a crypto error if the signature does not verify.
pub fn parse_bundle(node: &BinaryNode) -> Result<PreKeyBundle> {
    let registration_id = decode_big_endian(required_bytes(node, "registration")?)?;
    let identity = IdentityKey::from_slice(required_bytes(node, "identity")?)
        .map_err(|_| unexpected("identity key is malformed"))?;

    let skey = required_child(node, "skey")?;
    let signed_prekey_id = decode_big_endian(required_bytes(skey, "id")?)?;
    let signed_prekey = public_key(required_bytes(skey, "value")?)?;
    let signed_prekey_signature = Signature::from_slice(required_bytes(skey, "signature")?)
        .map_err(|_| unexpected("signed prekey signature is malformed"))?;

    let one_time_prekey = match node.child("key") {
        Some(key) => Some((
            decode_big_endian(required_bytes(key, "id")?)?,
            public_key(required_bytes(key, "value")?)?,
        )),
        None => None,
    };

    let bundle = PreKeyBundle {
        registration_id,
        identity,
        signed_prekey_id,
        signed_prekey,
        signed_prekey_signature,
        one_time_prekey,
    };
    bundle.verify()?;
    Ok(bundle)
}

/// Parse every `<user>` of a bundle fetch response.
///
/// Users carrying an `<error>` instead of keys are skipped.
///
/// # Errors
///
/// Fails if the `<list>` is missing or a user's bundle is malformed.
pub fn parse_bundles(response: &BinaryNode) -> Result<Vec<(Jid, PreKeyBundle)>> {
    let list = required_child(response, "list")?;
    let mut bundles = Vec::new();
    for user in list.children_by_tag("user") {
        if user.child("error").is_some() {
            tracing::debug!("No bundle for {:?}", user.attr("jid"));
            continue;
        }
        let jid: Jid = required_attr(user, "jid")?
            .parse()
            .map_err(|_| unexpected("user jid is malformed"))?;
        bundles.push((jid, parse_bundle(user)?));
    }
    Ok(bundles)
}

// ═══════════════════════════════════════════════════════════════════════════
// Pairing
// ═══════════════════════════════════════════════════════════════════════════

/// MAC the primary device puts on the device identity it issues to us.
#[must_use]
pub fn device_identity_mac(adv_secret: &[u8; 32], details: &[u8]) -> [u8; 32] {
    keyed_hash(adv_secret, details)
}

/// Pairing-code request binding `code` to our noise key.
///
/// The relay only learns a commitment to the code; the primary device
/// recomputes it from what the user typed.
#[must_use]
pub fn companion_hello(id: &str, phone: &Jid, code: &str, noise_key: &PublicKey) -> BinaryNode {
    let commitment = keyed_hash(&hash(code.as_bytes()), noise_key.as_bytes());
    iq(id, &Jid::relay(), "set", XMLNS_PAIRING)
        .child(
            BinaryNode::builder("link_code_companion_reg")
                .attr("jid", phone.to_string())
                .attr("stage", "companion_hello")
                .attr("should_show_push_notification", "true")
                .child(bytes_node(
                    "link_code_pairing_wrapped_companion_ephemeral_pub",
                    commitment.to_vec(),
                ))
                .child(bytes_node(
                    "companion_server_auth_key_pub",
                    noise_key.to_bytes(),
                ))
                .child(bytes_node("companion_platform_id", b"1".to_vec()))
                .child(bytes_node("link_code_pairing_nonce", b"0".to_vec()))
                .build(),
        )
        .build()
}

/// Reply to `pair-success`: our identity's signature over the device
/// identity details.
#[must_use]
pub fn pair_device_sign(request: &BinaryNode, details: &[u8], signature: &Signature) -> BinaryNode {
    iq_result(request)
        .into_builder()
        .child(
            BinaryNode::builder("pair-device-sign")
                .child(
                    BinaryNode::builder("device-identity")
                        .child(bytes_node("details", details.to_vec()))
                        .child(bytes_node("signature", signature.as_bytes().to_vec()))
                        .build(),
                )
                .build(),
        )
        .build()
}

// ═══════════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════════

/// `<enc>` carrying one ciphertext.
#[must_use]
pub fn enc_node(kind: CiphertextKind, ciphertext: Vec<u8>) -> BinaryNode {
    BinaryNode::builder("enc")
        .attr("v", "2")
        .attr("type", kind.as_str())
        .bytes(ciphertext)
        .build()
}

/// Retry receipt asking the sender of `message` to resend it.
///
/// From the second request on, our own bundle is attached so the sender
/// can rebuild the session.
#[must_use]
pub fn retry_receipt(
    message: &BinaryNode,
    count: u32,
    registration_id: u32,
    timestamp: u64,
    keys: Option<&PreKeyBundle>,
) -> BinaryNode {
    let id = message.attr("id").unwrap_or_default();
    let mut builder = BinaryNode::builder("receipt")
        .attr("id", id)
        .attr("type", "retry")
        .attr_opt("to", message.attr("from"))
        .attr_opt("participant", message.attr("participant"))
        .child(
            BinaryNode::builder("retry")
                .attr("count", count.to_string())
                .attr("id", id)
                .attr("t", timestamp.to_string())
                .attr("v", "1")
                .build(),
        )
        .child(bytes_node(
            "registration",
            encode_big_endian(registration_id, 4),
        ));
    if let Some(bundle) = keys {
        builder = builder.child(
            BinaryNode::builder("keys")
                .children(bundle_children(bundle))
                .build(),
        );
    }
    builder.build()
}
