//! Property-based tests for Courier
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Binary Node Properties
// ============================================================================

mod node_properties {
    use super::*;
    use courier_core::binary::{BinaryNode, decode, encode};
    use std::collections::BTreeMap;

    fn leaf() -> impl Strategy<Value = BinaryNode> {
        (
            "[a-z]{1,8}",
            prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,12}", 0..4),
            prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
        )
            .prop_map(|(tag, attrs, bytes)| build(tag, attrs).bytes_opt(bytes))
    }

    fn node() -> impl Strategy<Value = BinaryNode> {
        leaf().prop_recursive(4, 32, 4, |inner| {
            (
                "[a-z]{1,8}",
                prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,12}", 0..4),
                prop::collection::vec(inner, 1..4),
            )
                .prop_map(|(tag, attrs, children)| {
                    let mut builder = BinaryNode::builder(tag);
                    for (key, value) in attrs {
                        builder = builder.attr(key, value);
                    }
                    builder.children(children).build()
                })
        })
    }

    struct Leaf(courier_core::NodeBuilder);

    impl Leaf {
        fn bytes_opt(self, bytes: Option<Vec<u8>>) -> BinaryNode {
            match bytes {
                Some(bytes) => self.0.bytes(bytes).build(),
                None => self.0.build(),
            }
        }
    }

    fn build(tag: String, attrs: BTreeMap<String, String>) -> Leaf {
        let mut builder = BinaryNode::builder(tag);
        for (key, value) in attrs {
            builder = builder.attr(key, value);
        }
        Leaf(builder)
    }

    proptest! {
        /// Node roundtrip: decode(encode(n)) == n
        #[test]
        fn node_roundtrip(node in node()) {
            let encoded = encode(&node).unwrap();
            let decoded = decode(&encoded).unwrap();
            prop_assert_eq!(decoded, node);
        }

        /// Decoding arbitrary bytes returns an error instead of panicking
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode(&bytes);
        }

        /// Every strict prefix of an encoding is rejected
        #[test]
        fn truncated_encoding_rejected(node in node(), cut in any::<prop::sample::Index>()) {
            let encoded = encode(&node).unwrap();
            let len = cut.index(encoded.len());
            prop_assert!(decode(&encoded[..len]).is_err());
        }
    }
}

// ============================================================================
// Framing Properties
// ============================================================================

mod frame_properties {
    use super::*;
    use courier_core::frame::{FrameDecoder, encode_frame};

    const MAX: usize = 1 << 16;

    proptest! {
        /// Frames come out whole and in order however the stream is chunked
        #[test]
        fn decoder_independent_of_chunking(
            bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..10),
            chunk in 1usize..128,
        ) {
            let mut stream = Vec::new();
            for body in &bodies {
                stream.extend(encode_frame(body, MAX).unwrap());
            }

            let mut decoder = FrameDecoder::new(MAX);
            let mut frames = Vec::new();
            for piece in stream.chunks(chunk) {
                frames.extend(decoder.push(piece).unwrap());
            }
            prop_assert_eq!(frames, bodies);
            prop_assert_eq!(decoder.buffered(), 0);
        }

        /// Oversized frames are rejected before their body arrives
        #[test]
        fn oversized_frame_rejected(len in (MAX + 1)..(1 << 24)) {
            let header = [(len >> 16) as u8, (len >> 8) as u8, len as u8];
            let mut decoder = FrameDecoder::new(MAX);
            prop_assert!(decoder.push(&header).is_err());
        }
    }
}

// ============================================================================
// JID Properties
// ============================================================================

mod jid_properties {
    use super::*;
    use courier_core::Jid;

    proptest! {
        /// Display then parse yields the same device address
        #[test]
        fn device_jid_roundtrip(user in "[0-9]{5,15}", device in 1u16..1000) {
            let jid = Jid::device(user, device);
            let parsed: Jid = jid.to_string().parse().unwrap();
            prop_assert_eq!(parsed, jid);
        }

        /// Account of a device drops only the device part
        #[test]
        fn to_account_drops_device(user in "[0-9]{5,15}", device in 1u16..1000) {
            let jid = Jid::device(user.clone(), device);
            prop_assert_eq!(jid.to_account(), Jid::user(user));
        }
    }
}

// ============================================================================
// Ratchet Properties
// ============================================================================

mod ratchet_properties {
    use super::*;
    use courier_crypto::ratchet::DoubleRatchet;
    use courier_crypto::x25519::KeyPair;

    const MAX_SKIP: u32 = 64;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Messages within the skip window decrypt in any order
        #[test]
        fn out_of_order_delivery(
            secret in any::<[u8; 32]>(),
            order in Just((0..20usize).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let responder_key = KeyPair::generate();
            let mut alice =
                DoubleRatchet::init_initiator(secret, responder_key.public, MAX_SKIP).unwrap();
            let mut bob = DoubleRatchet::init_responder(secret, responder_key, MAX_SKIP);
            let ad = b"alice|bob";

            let messages: Vec<_> = (0..20)
                .map(|i| alice.encrypt(format!("message {i}").as_bytes(), ad).unwrap())
                .collect();
            for i in order {
                let plaintext = bob.decrypt(&messages[i], ad).unwrap();
                prop_assert_eq!(plaintext, format!("message {i}").into_bytes());
            }
            prop_assert_eq!(bob.skipped_len(), 0);
        }

        /// A message decrypts at most once
        #[test]
        fn replay_rejected(secret in any::<[u8; 32]>()) {
            let responder_key = KeyPair::generate();
            let mut alice =
                DoubleRatchet::init_initiator(secret, responder_key.public, MAX_SKIP).unwrap();
            let mut bob = DoubleRatchet::init_responder(secret, responder_key, MAX_SKIP);

            let message = alice.encrypt(b"once", b"ad").unwrap();
            prop_assert!(bob.decrypt(&message, b"ad").is_ok());
            prop_assert!(bob.decrypt(&message, b"ad").is_err());
        }
    }
}
