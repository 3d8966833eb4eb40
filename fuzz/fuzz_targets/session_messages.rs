//! Fuzz target for session wire messages
//!
//! Tests that ratchet, prekey, sender-key and certificate parsers reject
//! arbitrary bytes without panicking.

#![no_main]

use courier_crypto::certificate::ServerCertificate;
use courier_crypto::ratchet::RatchetMessage;
use courier_crypto::sender_key::{SenderKeyDistribution, SenderKeyMessage};
use courier_crypto::x3dh::PreKeyMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = RatchetMessage::decode(data) {
        let _ = RatchetMessage::decode(&message.encode());
    }
    let _ = PreKeyMessage::decode(data);
    let _ = SenderKeyMessage::decode(data);
    let _ = SenderKeyDistribution::decode(data);
    let _ = ServerCertificate::decode(data);
});
