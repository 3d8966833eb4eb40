//! Fuzz target for binary node decoding
//!
//! Decoding must never panic, and whatever decodes must re-encode to a
//! node that decodes identically.

#![no_main]

use courier_core::binary::{decode, decode_with_depth, encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(node) = decode(data) {
        let encoded = encode(&node).expect("decoded node re-encodes");
        let again = decode(&encoded).expect("re-encoded node decodes");
        assert_eq!(again, node);
    }

    // Shallow bound exercises the depth check on every nested list
    let _ = decode_with_depth(data, 2);
});
