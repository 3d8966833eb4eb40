//! Node decoder.
//!
//! The decoder never trusts lengths from the wire: every read is checked
//! against the remaining input before anything is allocated, nesting is
//! bounded, and JID parts may not themselves be JIDs.

use super::node::{BinaryNode, NodeContent};
use super::token::{
    AD_JID, BINARY_8, BINARY_20, BINARY_32, JID_PAIR, LIST_8, LIST_16, LIST_EMPTY, NIBBLE_8,
    token,
};
use super::DEFAULT_MAX_DEPTH;
use crate::error::CodecError;
use crate::jid::USER_SERVER;

/// Decode a node with the default depth bound.
///
/// # Errors
///
/// See [`decode_with_depth`].
pub fn decode(bytes: &[u8]) -> Result<BinaryNode, CodecError> {
    decode_with_depth(bytes, DEFAULT_MAX_DEPTH)
}

/// Decode a node, rejecting trees nested deeper than `max_depth`.
///
/// # Errors
///
/// Returns a [`CodecError`] for truncated input, trailing bytes, unknown
/// wire tags, out-of-range dictionary indices, invalid nibbles or UTF-8,
/// duplicate attribute keys, empty tags and excessive nesting.
pub fn decode_with_depth(bytes: &[u8], max_depth: usize) -> Result<BinaryNode, CodecError> {
    let (&flags, body) = bytes
        .split_first()
        .ok_or(CodecError::Truncated { offset: 0, needed: 1 })?;
    if flags != 0 {
        return Err(CodecError::UnsupportedFlags(flags));
    }

    let mut decoder = Decoder {
        buf: body,
        pos: 0,
        max_depth,
    };
    let node = decoder.read_node(0)?;
    if decoder.pos != body.len() {
        return Err(CodecError::TrailingBytes(body.len() - decoder.pos));
    }
    Ok(node)
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Decoder<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated {
                // +1 for the flags byte
                offset: self.pos + 1,
                needed: len,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_list_size(&mut self, tag: u8) -> Result<usize, CodecError> {
        match tag {
            LIST_EMPTY => Ok(0),
            LIST_8 => Ok(self.read_u8()? as usize),
            LIST_16 => {
                let b = self.take(2)?;
                Ok(u16::from_be_bytes([b[0], b[1]]) as usize)
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    fn read_node(&mut self, depth: usize) -> Result<BinaryNode, CodecError> {
        if depth > self.max_depth {
            return Err(CodecError::DepthExceeded(self.max_depth));
        }

        let list_tag = self.read_u8()?;
        let size = self.read_list_size(list_tag)?;
        if size == 0 {
            return Err(CodecError::InvalidListSize(size));
        }

        let tag = self.read_string()?;
        if tag.is_empty() {
            return Err(CodecError::EmptyTag);
        }

        let mut builder = BinaryNode::builder(tag);
        for _ in 0..(size - 1) / 2 {
            let key = self.read_string()?;
            let value = self.read_string()?;
            if builder.has_attr(&key) {
                return Err(CodecError::DuplicateAttribute(key));
            }
            builder = builder.attr(key, value);
        }

        if size % 2 == 0 {
            builder = match self.read_content(depth)? {
                NodeContent::None => builder,
                NodeContent::Bytes(bytes) => builder.bytes(bytes),
                NodeContent::Nodes(children) => builder.children(children),
            };
        }
        Ok(builder.build())
    }

    fn read_content(&mut self, depth: usize) -> Result<NodeContent, CodecError> {
        let tag = self.read_u8()?;
        match tag {
            LIST_EMPTY | LIST_8 | LIST_16 => {
                let count = self.read_list_size(tag)?;
                // Each child needs at least two bytes
                let mut children = Vec::with_capacity(count.min(self.remaining() / 2));
                for _ in 0..count {
                    children.push(self.read_node(depth + 1)?);
                }
                Ok(NodeContent::Nodes(children))
            }
            BINARY_8 | BINARY_20 | BINARY_32 => {
                let len = self.read_binary_len(tag)?;
                Ok(NodeContent::Bytes(self.take(len)?.to_vec()))
            }
            _ => Ok(NodeContent::Bytes(self.read_string_with(tag)?.into_bytes())),
        }
    }

    fn read_binary_len(&mut self, tag: u8) -> Result<usize, CodecError> {
        match tag {
            BINARY_8 => Ok(self.read_u8()? as usize),
            BINARY_20 => {
                let b = self.take(3)?;
                Ok((((b[0] & 0x0F) as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
            }
            BINARY_32 => {
                let b = self.take(4)?;
                Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let tag = self.read_u8()?;
        self.read_string_with(tag)
    }

    fn read_string_with(&mut self, tag: u8) -> Result<String, CodecError> {
        match tag {
            JID_PAIR => {
                let user = self.read_plain_string()?;
                let server = self.read_plain_string()?;
                Ok(format!("{user}@{server}"))
            }
            AD_JID => {
                let _agent = self.read_u8()?;
                let device = self.read_u8()?;
                let user = self.read_plain_string()?;
                Ok(format!("{user}:{device}@{USER_SERVER}"))
            }
            _ => self.read_plain_with(tag),
        }
    }

    fn read_plain_string(&mut self) -> Result<String, CodecError> {
        let tag = self.read_u8()?;
        self.read_plain_with(tag)
    }

    fn read_plain_with(&mut self, tag: u8) -> Result<String, CodecError> {
        match tag {
            BINARY_8 | BINARY_20 | BINARY_32 => {
                let len = self.read_binary_len(tag)?;
                let raw = self.take(len)?;
                String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
            }
            NIBBLE_8 => self.read_nibbles(),
            LIST_EMPTY | LIST_8 | LIST_16 | AD_JID | JID_PAIR => Err(CodecError::UnknownTag(tag)),
            index => match token(index) {
                Some(s) => Ok(s.to_string()),
                None if index <= super::token::MAX_TOKEN_INDEX => {
                    Err(CodecError::TokenOutOfRange(index))
                }
                None => Err(CodecError::UnknownTag(index)),
            },
        }
    }

    fn read_nibbles(&mut self) -> Result<String, CodecError> {
        let header = self.read_u8()?;
        let odd = header & 0x80 != 0;
        let packed = (header & 0x7F) as usize;
        if odd && packed == 0 {
            return Err(CodecError::InvalidNibble(0x0F));
        }

        let raw = self.take(packed)?;
        let mut out = String::with_capacity(packed * 2);
        for (i, byte) in raw.iter().enumerate() {
            let last = i + 1 == packed;
            out.push(nibble_char(byte >> 4)?);
            let lo = byte & 0x0F;
            if last && odd {
                if lo != 0x0F {
                    return Err(CodecError::InvalidNibble(lo));
                }
            } else {
                out.push(nibble_char(lo)?);
            }
        }
        Ok(out)
    }
}

fn nibble_char(value: u8) -> Result<char, CodecError> {
    match value {
        0..=9 => Ok((b'0' + value) as char),
        10 => Ok('-'),
        11 => Ok('.'),
        other => Err(CodecError::InvalidNibble(other)),
    }
}
