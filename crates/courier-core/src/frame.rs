//! Length-prefixed framing for the relay byte stream.
//!
//! Every frame is a 3-byte big-endian length followed by the body. The
//! client prefixes its very first write with [`INTRO_HEADER`], which is
//! also the handshake prologue, so both sides commit to the protocol and
//! dictionary versions before any key material is exchanged.

use crate::binary::token::DICTIONARY_VERSION;
use crate::error::TransportError;

/// Framing protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes sent once before the first handshake frame
pub const INTRO_HEADER: [u8; 4] = [b'C', b'R', PROTOCOL_VERSION, DICTIONARY_VERSION];

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 3;

/// Largest body the length prefix can describe
pub const MAX_ENCODABLE_FRAME: usize = (1 << 24) - 1;

/// Prefix `body` with its length.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] if the body exceeds `max_frame_size`
/// or cannot be described by the 3-byte prefix.
pub fn encode_frame(body: &[u8], max_frame_size: usize) -> Result<Vec<u8>, TransportError> {
    let max = max_frame_size.min(MAX_ENCODABLE_FRAME);
    if body.len() > max {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max,
        });
    }

    let len = body.len();
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + len);
    out.push((len >> 16) as u8);
    out.push((len >> 8) as u8);
    out.push(len as u8);
    out.extend_from_slice(body);
    Ok(out)
}

/// Incremental frame splitter.
///
/// Bytes are pushed as they arrive from the stream; every frame completed
/// by a push is returned, in order, from that push.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder rejecting bodies larger than `max_frame_size`.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size: max_frame_size.min(MAX_ENCODABLE_FRAME),
        }
    }

    /// Bytes held for an incomplete frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes and collect every complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FrameTooLarge`] as soon as a length prefix
    /// announces an oversized body, without waiting for the body.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut offset = 0;
        while self.buf.len() - offset >= LENGTH_PREFIX_SIZE {
            let header = &self.buf[offset..offset + LENGTH_PREFIX_SIZE];
            let len = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
            if len > self.max_frame_size {
                return Err(TransportError::FrameTooLarge {
                    len,
                    max: self.max_frame_size,
                });
            }

            let start = offset + LENGTH_PREFIX_SIZE;
            if self.buf.len() - start < len {
                break;
            }
            frames.push(self.buf[start..start + len].to_vec());
            offset = start + len;
        }

        self.buf.drain(..offset);
        Ok(frames)
    }
}
