//! Fuzz target for the length-prefixed frame splitter
//!
//! Tests that arbitrary chunking of arbitrary bytes never panics and that
//! the frames found do not depend on how the stream was split.

#![no_main]

use arbitrary::Arbitrary;
use courier_core::frame::FrameDecoder;
use libfuzzer_sys::fuzz_target;

const MAX_FRAME: usize = 4096;

#[derive(Debug, Arbitrary)]
struct FrameInput {
    stream: Vec<u8>,
    chunk: u8,
}

fuzz_target!(|input: FrameInput| {
    let mut whole = FrameDecoder::new(MAX_FRAME);
    let expected = whole.push(&input.stream);

    let chunk = usize::from(input.chunk).max(1);
    let mut split = FrameDecoder::new(MAX_FRAME);
    let mut frames = Vec::new();
    let mut failed = false;
    for piece in input.stream.chunks(chunk) {
        match split.push(piece) {
            Ok(found) => frames.extend(found),
            Err(_) => {
                failed = true;
                break;
            }
        }
    }

    match expected {
        Ok(expected) => {
            assert!(!failed);
            assert_eq!(frames, expected);
            assert_eq!(split.buffered(), whole.buffered());
        }
        Err(_) => assert!(failed),
    }
});
