//! Static string dictionary and wire tags.
//!
//! The dictionary is closed and versioned: the relay and the client must
//! agree on [`DICTIONARY_VERSION`], which is announced in the connection
//! header. A string matching an entry is written as its one-byte index.
//! Index 0 is reserved for `LIST_EMPTY` and never matches.

/// Dictionary version announced in the connection header
pub const DICTIONARY_VERSION: u8 = 1;

/// Empty list (also: absent content slot)
pub const LIST_EMPTY: u8 = 0;
/// JID with agent and device on the default user server
pub const AD_JID: u8 = 247;
/// List with an 8-bit length
pub const LIST_8: u8 = 248;
/// List with a 16-bit length
pub const LIST_16: u8 = 249;
/// `user@server` pair
pub const JID_PAIR: u8 = 250;
/// Raw bytes with an 8-bit length
pub const BINARY_8: u8 = 252;
/// Raw bytes with a 20-bit length
pub const BINARY_20: u8 = 253;
/// Raw bytes with a 32-bit length
pub const BINARY_32: u8 = 254;
/// Packed numeric string
pub const NIBBLE_8: u8 = 255;

/// Highest byte usable as a dictionary index
pub const MAX_TOKEN_INDEX: u8 = 235;

/// Single-byte dictionary, version 1.
pub static TOKENS: &[&str] = &[
    "",
    "xmlstreamstart",
    "xmlstreamend",
    "s.courier.net",
    "type",
    "participant",
    "from",
    "receipt",
    "id",
    "notification",
    "disappearing_mode",
    "status",
    "jid",
    "broadcast",
    "user",
    "devices",
    "device_hash",
    "to",
    "offline",
    "message",
    "result",
    "class",
    "xmlns",
    "duration",
    "notify",
    "iq",
    "t",
    "ack",
    "g.courier.net",
    "enc",
    "urn:xmpp:ping",
    "remove",
    "server-error",
    "get",
    "set",
    "error",
    "code",
    "text",
    "v",
    "msg",
    "pkmsg",
    "skmsg",
    "plaintext",
    "retry",
    "count",
    "registration",
    "identity",
    "skey",
    "key",
    "value",
    "signature",
    "list",
    "encrypt",
    "keys",
    "participants",
    "to_participant",
    "ping",
    "success",
    "failure",
    "stream:error",
    "conflict",
    "replaced",
    "device_removed",
    "call",
    "offer",
    "accept",
    "reject",
    "terminate",
    "preaccept",
    "relaylatency",
    "call-id",
    "call-creator",
    "presence",
    "available",
    "unavailable",
    "chatstate",
    "composing",
    "paused",
    "read",
    "read-self",
    "delivery",
    "sender",
    "played",
    "inactive",
    "peer_msg",
    "pair-device",
    "pair-success",
    "ref",
    "device",
    "device-identity",
    "platform",
    "biz",
    "companion_hello",
    "link_code_companion_reg",
    "stage",
    "phone",
    "companion_platform_id",
    "companion_platform_display",
    "link_code_pairing_ref",
    "link_code_pairing_wrapped_companion_ephemeral_pub",
    "md",
    "passive",
    "active",
    "login",
    "courier.net",
    "newsletter",
    "w:p",
    "w:g2",
    "w:mex",
    "w:profile:picture",
    "usync",
    "query",
    "context",
    "mode",
    "sid",
    "last",
    "index",
    "side_list",
    "contact",
    "group",
    "subject",
    "creation",
    "creator",
    "admin",
    "superadmin",
    "add",
    "promote",
    "demote",
    "leave",
    "invite",
    "linked_group_jid",
    "edit",
    "reaction",
    "poll",
    "media",
    "mediatype",
    "image",
    "video",
    "audio",
    "document",
    "sticker",
    "category",
    "peer",
    "hash",
    "dirty",
    "clean",
    "config",
    "props",
    "prop",
    "name",
    "item",
    "items",
    "reason",
    "location",
    "timeout",
    "bad-request",
    "not-authorized",
    "forbidden",
    "item-not-found",
    "not-acceptable",
    "service-unavailable",
    "internal-server-error",
    "rate-overlimit",
    "edge_routing",
    "routing_info",
    "verified_name",
    "business",
    "privacy",
    "blocklist",
    "unread",
    "web",
    "urn:xmpp:courier:push",
    "encrypt_v2",
    "decrypt-fail",
    "hide",
    "unavailable_fanout",
    "retry_count",
    "lid",
    "phash",
    "addressing_mode",
    "pn",
    "expiration",
    "ephemeral",
    "view_once",
    "mute",
    "pin",
    "archive",
    "star",
    "delete",
    "subscribe",
    "unsubscribe",
    "update",
    "create",
    "owner",
    "description",
    "picture",
    "preview",
    "version",
    "s_t",
    "e",
    "u",
    "p",
    "epoch",
    "stanza_id",
    "server_id",
    "verified_level",
    "timestamp",
    "off_cnt",
    "offline_preview",
    "clean_rate",
    "w",
];

/// Look up a string in the dictionary.
///
/// Returns `None` for the reserved empty entry.
#[must_use]
pub fn index_of(value: &str) -> Option<u8> {
    if value.is_empty() {
        return None;
    }
    TOKENS
        .iter()
        .position(|t| *t == value)
        .and_then(|i| u8::try_from(i).ok())
}

/// Resolve a dictionary index.
#[must_use]
pub fn token(index: u8) -> Option<&'static str> {
    if index == LIST_EMPTY || index > MAX_TOKEN_INDEX {
        return None;
    }
    TOKENS.get(index as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_dictionary_fits_below_wire_tags() {
        assert!(TOKENS.len() <= MAX_TOKEN_INDEX as usize + 1);
    }

    #[test]
    fn test_dictionary_entries_unique() {
        let unique: HashSet<_> = TOKENS.iter().collect();
        assert_eq!(unique.len(), TOKENS.len());
    }

    #[test]
    fn test_lookup_roundtrip() {
        for (i, t) in TOKENS.iter().enumerate().skip(1) {
            let index = index_of(t).unwrap();
            assert_eq!(index as usize, i);
            assert_eq!(token(index), Some(*t));
        }
    }

    #[test]
    fn test_reserved_and_out_of_range() {
        assert_eq!(index_of(""), None);
        assert_eq!(token(LIST_EMPTY), None);
        assert_eq!(token(MAX_TOKEN_INDEX + 1), None);
    }
}
